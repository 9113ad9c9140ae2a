//! WebSocket reader/writer pump (C9, spec.md §4.9): decodes inbound frames
//! into [`ClientMessage`]s, serializes [`ServerMessage`]s onto outbound
//! frames, and closes with whatever code the session handler (or the live
//! broadcaster, for backpressure) set before cancelling.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::protocol::{ClientMessage, CloseCode, ServerMessage};

#[derive(Debug, Error)]
pub enum Error {
    #[error("websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("failed to serialize outbound message: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Runs the read/write pump for one session's socket until the peer
/// closes, a protocol error occurs, or `cancel` fires. A malformed inbound
/// frame (unknown message type, unparseable payload) is itself the
/// protocol violation spec.md §4.9 requires closing over: it's rejected
/// here with `ProtocolError` rather than forwarded to the session handler.
pub async fn run<S>(
    ws: WebSocketStream<S>,
    inbound: mpsc::Sender<ClientMessage>,
    mut outbound: mpsc::Receiver<ServerMessage>,
    cancel: CancellationToken,
    close_reason: Arc<Mutex<Option<CloseCode>>>,
) -> Result<(), Error>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let code = close_reason.lock().unwrap_or(CloseCode::Normal);
                let frame = CloseFrame {
                    code: WsCloseCode::from(code.code()),
                    reason: code.reason().into(),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                break;
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(msg) => {
                                if inbound.send(msg).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                warn!(error = %err, "rejecting malformed client message");
                                *close_reason.lock() = Some(CloseCode::ProtocolError);
                                cancel.cancel();
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(err.into()),
                }
            }
            outgoing = outbound.recv() => {
                match outgoing {
                    Some(msg) => {
                        let text = serde_json::to_string(&msg).map_err(Error::Encode)?;
                        sink.send(Message::Text(text)).await?;
                    }
                    None => break,
                }
            }
        }
    }

    Ok(())
}
