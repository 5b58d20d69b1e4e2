use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::consts::CLOSE_CODE_ABNORMAL;
use crate::net::{Socket, SocketEvent, SocketFactory};

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// No status code was present in the close frame.
const CLOSE_CODE_NO_STATUS: u16 = 1005;

/// Production socket factory dialing `ws://`/`wss://` URIs with
/// tokio-tungstenite. The dial runs on a background task so construction
/// returns immediately; the outcome arrives as an `Opened` or `Closed`
/// event on the returned receiver.
#[derive(Debug, Default)]
pub struct WsSocketFactory;

#[async_trait]
impl SocketFactory for WsSocketFactory {
    async fn connect(&self, uri: &str) -> Result<(Arc<dyn Socket>, mpsc::Receiver<SocketEvent>)> {
        let request = uri
            .into_client_request()
            .with_context(|| format!("invalid signaling URI {uri}"))?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let socket = Arc::new(WsSocket {
            sink: Arc::new(Mutex::new(None)),
        });

        let uri = uri.to_string();
        let sink_slot = Arc::clone(&socket.sink);
        tokio::spawn(async move {
            let (ws, _response) = match connect_async(request).await {
                Ok(ok) => ok,
                Err(e) => {
                    warn!(target: "Socket", "Dial {uri} failed: {e}");
                    let _ = events_tx
                        .send(SocketEvent::Closed {
                            code: CLOSE_CODE_ABNORMAL,
                            reason: e.to_string(),
                        })
                        .await;
                    return;
                }
            };
            info!(target: "Socket", "Connected to {uri}");
            let (sink, mut stream) = ws.split();
            *sink_slot.lock().await = Some(sink);
            if events_tx.send(SocketEvent::Opened).await.is_err() {
                return;
            }

            while let Some(item) = stream.next().await {
                match item {
                    Ok(Message::Text(text)) => {
                        debug!(target: "Socket", "<-- {} bytes", text.len());
                        if events_tx
                            .send(SocketEvent::Message(text.to_string()))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.to_string()))
                            .unwrap_or((CLOSE_CODE_NO_STATUS, String::new()));
                        let _ = events_tx.send(SocketEvent::Closed { code, reason }).await;
                        return;
                    }
                    // The protocol is text frames only; tungstenite answers
                    // ping frames on its own.
                    Ok(_) => {}
                    Err(e) => {
                        let _ = events_tx.send(SocketEvent::Error(e.to_string())).await;
                        let _ = events_tx
                            .send(SocketEvent::Closed {
                                code: CLOSE_CODE_ABNORMAL,
                                reason: e.to_string(),
                            })
                            .await;
                        return;
                    }
                }
            }

            // Stream ended without a close frame.
            let _ = events_tx
                .send(SocketEvent::Closed {
                    code: CLOSE_CODE_ABNORMAL,
                    reason: "stream ended".into(),
                })
                .await;
        });

        Ok((socket, events_rx))
    }
}

struct WsSocket {
    sink: Arc<Mutex<Option<WsSink>>>,
}

#[async_trait]
impl Socket for WsSocket {
    async fn send(&self, frame: &str) -> Result<()> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().context("socket is not open")?;
        debug!(target: "Socket", "--> {} bytes", frame.len());
        sink.send(Message::text(frame.to_string())).await?;
        Ok(())
    }

    async fn close(&self) {
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.close().await;
        }
    }
}
