use futures_util::stream::SplitSink;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

/// Perform the WebSocket upgrade over a raw accepted TCP stream. There is no
/// HTTP router in front of either listener: every connection on the source
/// or sink port is a signaling socket.
pub(crate) async fn accept(stream: TcpStream) -> anyhow::Result<WebSocketStream<TcpStream>> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    Ok(ws)
}

/// Spawn the task that drains an outbound queue into the WebSocket sink.
/// `PeerAdapter` only ever sees the returned `UnboundedSender`, so a closed
/// or lagging socket never blocks callback-driven signaling.
pub(crate) fn spawn_writer(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
) -> mpsc::UnboundedSender<Message> {
    use futures_util::SinkExt;

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                debug!("signaling socket closed while writing");
                break;
            }
        }
    });
    tx
}
