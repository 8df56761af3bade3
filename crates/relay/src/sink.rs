use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use futures_util::StreamExt;
use futures_util::future::join_all;
use relay_protocol::SignalingEnvelope;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{info, warn};
use uuid::Uuid;

use crate::fanout::FanOut;
use crate::media::MediaFactory;
use crate::peer::PeerAdapter;
use crate::signaling;

/// Listens on the sink port. Every accepted connection gets its own peer
/// connection and is registered with the shared `FanOut` controller, which
/// publishes the currently active source track into it immediately.
pub struct SinkEndpoint {
    factory: Arc<MediaFactory>,
    fanout: Arc<FanOut>,
    connections: Mutex<HashMap<Uuid, ConnectionHandle>>,
}

/// What the supervisor needs to ask one sink connection to close during
/// shutdown and to know when it has actually finished tearing down.
struct ConnectionHandle {
    outbound_tx: tokio::sync::mpsc::UnboundedSender<Message>,
    shutdown: Arc<Notify>,
    finished: oneshot::Receiver<()>,
}

impl SinkEndpoint {
    pub fn new(factory: Arc<MediaFactory>, fanout: Arc<FanOut>) -> Arc<Self> {
        Arc::new(Self {
            factory,
            fanout,
            connections: Mutex::new(HashMap::new()),
        })
    }

    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind sink listener on {addr}"))?;
        info!(%addr, "sink signaling listening");

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("sink accept error: {e}");
                    continue;
                }
            };
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = this.accept_connection(stream, peer_addr).await {
                    warn!(%peer_addr, "sink connection error: {e:#}");
                }
            });
        }
    }

    async fn accept_connection(&self, stream: TcpStream, peer_addr: SocketAddr) -> anyhow::Result<()> {
        let id = Uuid::new_v4();
        let ws_stream = signaling::accept(stream).await?;
        let (ws_tx, mut ws_rx) = ws_stream.split();
        let outbound_tx = signaling::spawn_writer(ws_tx);

        let shutdown = Arc::new(Notify::new());
        let (finished_tx, finished_rx) = oneshot::channel();
        self.connections.lock().await.insert(
            id,
            ConnectionHandle {
                outbound_tx: outbound_tx.clone(),
                shutdown: Arc::clone(&shutdown),
                finished: finished_rx,
            },
        );

        let adapter = PeerAdapter::new(format!("sink-{id}"), &self.factory, outbound_tx, |_track| {
            // A sink never originates a track of its own.
        })
        .await?;

        self.fanout.attach(id, Arc::clone(&adapter)).await;
        info!(%peer_addr, %id, "sink connected");
        // Held until this function returns by any path; its drop resolves
        // `finished` on the shutdown side, signaling that teardown below has
        // completed.
        let _finished_tx = finished_tx;

        loop {
            tokio::select! {
                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => match serde_json::from_str::<SignalingEnvelope>(&text) {
                            Ok(envelope) => adapter.handle_envelope(&envelope).await,
                            Err(e) => warn!(%peer_addr, %id, "malformed signaling message from sink: {e}"),
                        },
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(Message::Binary(_))) => {
                            warn!(%peer_addr, %id, "dropping non-text frame from sink");
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(%peer_addr, %id, "sink socket error: {e}");
                            break;
                        }
                    }
                }
                _ = shutdown.notified() => {
                    info!(%peer_addr, %id, "closing sink connection for supervisor shutdown");
                    break;
                }
            }
        }

        self.fanout.detach(id).await;
        adapter.close().await;
        self.connections.lock().await.remove(&id);
        info!(%peer_addr, %id, "sink disconnected");
        Ok(())
    }

    /// Ask every connected sink to close with "going away" and wait for each
    /// connection task to finish tearing down (peer connection closed,
    /// detached from fan-out). Called once by the supervisor during
    /// shutdown, before the source connection is closed.
    pub async fn shutdown(&self) {
        let handles: Vec<ConnectionHandle> = self.connections.lock().await.drain().map(|(_, h)| h).collect();

        let closes = handles.into_iter().map(|handle| async move {
            let _ = handle.outbound_tx.send(Message::Close(Some(CloseFrame {
                code: CloseCode::Away,
                reason: "relay shutting down".into(),
            })));
            handle.shutdown.notify_one();
            let _ = handle.finished.await;
        });

        join_all(closes).await;
    }
}
