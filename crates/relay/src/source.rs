use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use futures_util::StreamExt;
use relay_protocol::SignalingEnvelope;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{info, warn};

use crate::fanout::FanOut;
use crate::media::MediaFactory;
use crate::peer::PeerAdapter;
use crate::signaling;

/// Listens on the source port and admits exactly one signaling connection at
/// a time. Its peer's incoming track becomes the process's one active track.
pub struct SourceEndpoint {
    factory: Arc<MediaFactory>,
    fanout: Arc<FanOut>,
    connection: Mutex<Option<ConnectionHandle>>,
}

/// What the supervisor needs to ask the current connection, if any, to close
/// during shutdown and to know when it has actually finished tearing down.
struct ConnectionHandle {
    outbound_tx: tokio::sync::mpsc::UnboundedSender<Message>,
    shutdown: Arc<Notify>,
    finished: oneshot::Receiver<()>,
}

impl SourceEndpoint {
    pub fn new(factory: Arc<MediaFactory>, fanout: Arc<FanOut>) -> Arc<Self> {
        Arc::new(Self {
            factory,
            fanout,
            connection: Mutex::new(None),
        })
    }

    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind source listener on {addr}"))?;
        info!(%addr, "source signaling listening");

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("source accept error: {e}");
                    continue;
                }
            };
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = this.accept_connection(stream, peer_addr).await {
                    warn!(%peer_addr, "source connection error: {e:#}");
                }
            });
        }
    }

    async fn accept_connection(&self, stream: TcpStream, peer_addr: SocketAddr) -> anyhow::Result<()> {
        let ws_stream = signaling::accept(stream).await?;
        let (ws_tx, mut ws_rx) = ws_stream.split();

        let mut slot = self.connection.lock().await;
        if slot.is_some() {
            drop(slot);
            warn!(%peer_addr, "rejecting second source connection");
            use futures_util::SinkExt;
            let mut ws_tx = ws_tx;
            let _ = ws_tx
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Away,
                    reason: "a source is already connected".into(),
                })))
                .await;
            return Ok(());
        }

        let outbound_tx = signaling::spawn_writer(ws_tx);
        let shutdown = Arc::new(Notify::new());
        let (finished_tx, finished_rx) = oneshot::channel();
        *slot = Some(ConnectionHandle {
            outbound_tx: outbound_tx.clone(),
            shutdown: Arc::clone(&shutdown),
            finished: finished_rx,
        });
        drop(slot);

        let fanout = Arc::clone(&self.fanout);
        let adapter = PeerAdapter::new("source", &self.factory, outbound_tx, {
            let fanout = Arc::clone(&fanout);
            move |track| {
                let fanout = Arc::clone(&fanout);
                tokio::spawn(async move { fanout.set_active(track).await });
            }
        })
        .await?;

        info!(%peer_addr, "source connected");
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
                            Err(e) => warn!(%peer_addr, "malformed signaling message from source: {e}"),
                        },
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(Message::Binary(_))) => {
                            warn!(%peer_addr, "dropping non-text frame from source");
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(%peer_addr, "source socket error: {e}");
                            break;
                        }
                    }
                }
                _ = shutdown.notified() => {
                    info!(%peer_addr, "closing source connection for supervisor shutdown");
                    break;
                }
            }
        }

        adapter.close().await;
        fanout.clear_active().await;
        *self.connection.lock().await = None;
        info!(%peer_addr, "source disconnected");
        Ok(())
    }

    /// Ask the current source connection, if any, to close and wait for its
    /// connection task to finish tearing down (peer connection closed,
    /// active track cleared). Called once by the supervisor during shutdown,
    /// after sinks have already been closed.
    pub async fn shutdown(&self) {
        let handle = self.connection.lock().await.take();
        let Some(handle) = handle else { return };

        let _ = handle.outbound_tx.send(Message::Close(Some(CloseFrame {
            code: CloseCode::Away,
            reason: "relay shutting down".into(),
        })));
        handle.shutdown.notify_one();
        let _ = handle.finished.await;
    }
}
