use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc};

use crate::config::{ClientConfig, TransportConfig};
use crate::consts::{MAX_RECONNECT_TIMEOUT_SECS, PREFERRED_BACKOFF_MAX};
use crate::error::{SignalingError, TransportError};
use crate::events::{Closed, EventBus, GatewayInfo, IncomingMessage, Offline, Opened, Ready};
use crate::messages::Envelope;
use crate::net::SocketFactory;
use crate::transport::{Transport, TransportEvent};

/// Client connection status, tracked purely by observing events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    /// Never connected, or torn down for good.
    Disconnected,
    /// The channel dropped; the transport is reconnecting underneath.
    Offline,
    /// The socket is open and the handshake has been sent.
    Connected,
    /// The gateway acknowledged the handshake.
    Ready,
}

struct QueuedMessage {
    kind: String,
    payload: Value,
    should_retry: bool,
}

/// Protocol-framing client for the signaling channel.
///
/// Sits on top of [`Transport`] and owns the wire envelope, the `listen`
/// token handshake, the outbound queue replayed after every reconnection,
/// and the verb-specific message constructors. Everything it learns flows
/// out through the [`EventBus`]; nothing here ever throws past its boundary.
pub struct SignalingClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    transport: Transport,
    config: ClientConfig,
    token: Mutex<String>,
    queue: Mutex<VecDeque<QueuedMessage>>,
    status: Mutex<ClientStatus>,
    gateway: Mutex<GatewayInfo>,
    events: EventBus,
    destroyed: AtomicBool,
}

impl SignalingClient {
    /// Creates the client and immediately starts connecting.
    pub fn new(
        token: impl Into<String>,
        uris: Vec<String>,
        factory: Arc<dyn SocketFactory>,
        config: ClientConfig,
    ) -> Self {
        let (transport, transport_events) =
            Transport::new(config.transport.clone(), uris, factory);
        let inner = Arc::new(ClientInner {
            transport,
            config,
            token: Mutex::new(token.into()),
            queue: Mutex::new(VecDeque::new()),
            status: Mutex::new(ClientStatus::Disconnected),
            gateway: Mutex::new(GatewayInfo::default()),
            events: EventBus::new(),
            destroyed: AtomicBool::new(false),
        });
        tokio::spawn(Arc::clone(&inner).event_loop(transport_events));
        inner.transport.open();
        Self { inner }
    }

    /// The typed event channels consumed by the call and device layers.
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub async fn status(&self) -> ClientStatus {
        *self.inner.status.lock().await
    }

    /// Gateway metadata cached from inbound frames.
    pub async fn gateway_info(&self) -> GatewayInfo {
        self.inner.gateway.lock().await.clone()
    }

    /// Replaces the auth token. When the channel is up this re-authenticates
    /// right away; either way the new token is used for every later
    /// handshake.
    pub async fn set_token(&self, token: impl Into<String>) {
        *self.inner.token.lock().await = token.into();
        let status = *self.inner.status.lock().await;
        if matches!(status, ClientStatus::Connected | ClientStatus::Ready) {
            self.inner.publish_listen().await;
        }
    }

    pub async fn register(&self, capabilities: Value) {
        self.inner
            .publish("register", json!({ "media": capabilities }), true)
            .await;
    }

    pub async fn invite(&self, sdp: &str, call_id: &str, params: &str) {
        let payload = json!({
            "callid": call_id,
            "sdp": sdp,
            "params": params,
        });
        self.inner.publish("invite", payload, true).await;
    }

    pub async fn reconnect(&self, sdp: &str, call_id: &str, reconnect_token: &str) {
        let payload = json!({
            "callid": call_id,
            "sdp": sdp,
            "reconnect": reconnect_token,
        });
        self.inner.publish("reconnect", payload, true).await;
    }

    pub async fn answer(&self, sdp: &str, call_id: &str) {
        self.inner
            .publish("answer", json!({ "callid": call_id, "sdp": sdp }), true)
            .await;
    }

    pub async fn dtmf(&self, call_id: &str, digits: &str) {
        self.inner
            .publish("dtmf", json!({ "callid": call_id, "dtmf": digits }), true)
            .await;
    }

    pub async fn hangup(&self, call_id: &str, message: Option<&str>) {
        let payload = match message {
            Some(message) => json!({ "callid": call_id, "message": message }),
            None => json!({ "callid": call_id }),
        };
        self.inner.publish("hangup", payload, true).await;
    }

    pub async fn reject(&self, call_id: &str) {
        self.inner
            .publish("reject", json!({ "callid": call_id }), true)
            .await;
    }

    /// Mid-call renegotiation. Best effort: a reinvite for a session that
    /// has moved on is useless, so it is never buffered for replay.
    pub async fn reinvite(&self, sdp: &str, call_id: &str) {
        self.inner
            .publish("reinvite", json!({ "callid": call_id, "sdp": sdp }), false)
            .await;
    }

    pub async fn send_message(
        &self,
        call_id: &str,
        content: Value,
        content_type: &str,
        message_type: &str,
        message_id: &str,
    ) {
        let payload = json!({
            "callid": call_id,
            "content": content,
            "contenttype": content_type,
            "messagetype": message_type,
            "messageid": message_id,
        });
        self.inner.publish("message", payload, true).await;
    }

    pub fn update_preferred_uri(&self, uri: Option<String>) {
        self.inner.transport.update_preferred_uri(uri);
    }

    pub fn update_uris(&self, uris: Vec<String>) {
        self.inner.transport.update_uris(uris);
    }

    /// Tears the channel down for good.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(target: "Client", "Destroying signaling client");
        self.inner.transport.close();
        *self.inner.status.lock().await = ClientStatus::Disconnected;
        let _ = self.inner.events.close.send(Arc::new(Closed));
    }
}

impl ClientInner {
    async fn event_loop(
        self: Arc<Self>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        while let Some(event) = transport_events.recv().await {
            if self.destroyed.load(Ordering::SeqCst) {
                break;
            }
            match event {
                TransportEvent::Open => self.on_transport_open().await,
                TransportEvent::Message(frame) => self.on_transport_message(&frame).await,
                TransportEvent::Error(error) => {
                    let _ = self.events.error.send(Arc::new(SignalingError::from(&error)));
                }
                TransportEvent::Close => self.on_transport_close().await,
            }
        }
        debug!(target: "Client", "Event loop finished");
    }

    async fn on_transport_open(&self) {
        info!(target: "Client", "Signaling channel open, authenticating");
        *self.status.lock().await = ClientStatus::Connected;
        let _ = self.events.open.send(Arc::new(Opened));
        self.publish_listen().await;
        let pending: Vec<QueuedMessage> = self.queue.lock().await.drain(..).collect();
        for message in pending {
            self.publish(&message.kind, message.payload, message.should_retry)
                .await;
        }
    }

    /// The authentication handshake. Always the first frame after a
    /// (re)connection; never buffered, since every open sends a fresh one.
    async fn publish_listen(&self) {
        let token = self.token.lock().await.clone();
        let payload = json!({
            "token": token,
            "browserinfo": environment_info(),
            "reconnectTimeout": reconnect_timeout_secs(&self.config.transport),
        });
        self.publish("listen", payload, false).await;
    }

    async fn publish(&self, kind: &str, payload: Value, should_retry: bool) {
        let envelope = Envelope::new(kind, payload.clone());
        let frame = match serde_json::to_string(&envelope) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(target: "Client", "Could not serialize {kind} frame: {e}");
                return;
            }
        };
        debug!(target: "Client", "--> {kind}");
        if self.transport.send(frame).await {
            return;
        }
        if should_retry {
            debug!(target: "Client", "Buffering {kind} until the channel reopens");
            self.queue.lock().await.push_back(QueuedMessage {
                kind: kind.to_string(),
                payload,
                should_retry,
            });
            let error = TransportError::TransportUnavailable;
            let _ = self.events.error.send(Arc::new(SignalingError::from(&error)));
        } else {
            debug!(target: "Client", "Dropping non-retryable {kind}, channel not open");
        }
    }

    async fn on_transport_message(&self, frame: &str) {
        let Some(envelope) = Envelope::parse(frame) else {
            debug!(
                target: "Client",
                "Discarding malformed frame ({} bytes)",
                frame.len()
            );
            return;
        };
        let Envelope { kind, payload, .. } = envelope;
        self.cache_gateway_info(&payload).await;
        match kind.as_str() {
            "connected" => {
                *self.status.lock().await = ClientStatus::Ready;
                let gateway = self.gateway.lock().await.clone();
                info!(
                    target: "Client",
                    "Gateway ready (region {})",
                    gateway.region.as_deref().unwrap_or("unknown")
                );
                let _ = self.events.ready.send(Arc::new(Ready { gateway }));
            }
            "error" => {
                let error = decorate_error(&payload);
                warn!(target: "Client", "Server error {}: {}", error.code, error.message);
                let _ = self.events.error.send(Arc::new(error));
            }
            _ => {
                let _ = self
                    .events
                    .message
                    .send(Arc::new(IncomingMessage { kind, payload }));
            }
        }
    }

    async fn cache_gateway_info(&self, payload: &Value) {
        let mut cached = self.gateway.lock().await;
        if let Some(gateway) = payload.get("gateway").and_then(Value::as_str) {
            cached.gateway = Some(gateway.to_string());
        }
        if let Some(region) = payload.get("region").and_then(Value::as_str) {
            cached.region = Some(region.to_string());
        }
    }

    async fn on_transport_close(&self) {
        let mut status = self.status.lock().await;
        if matches!(*status, ClientStatus::Connected | ClientStatus::Ready) {
            *status = ClientStatus::Offline;
            drop(status);
            info!(target: "Client", "Signaling channel lost, waiting for it to come back");
            let _ = self.events.offline.send(Arc::new(Offline));
        }
    }
}

/// Server error frames carry their detail under `payload.error`; fold it
/// into a typed error so consumers never dig through raw JSON.
fn decorate_error(payload: &Value) -> SignalingError {
    let detail = payload.get("error");
    let code = detail
        .and_then(|e| e.get("code"))
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;
    let message = detail
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("server reported an unspecified error")
        .to_string();
    SignalingError { code, message }
}

fn environment_info() -> Value {
    json!({
        "p": "rust",
        "v": env!("CARGO_PKG_VERSION"),
        "os": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
    })
}

/// Advisory window the server is asked to keep the session alive across a
/// reconnect: the preferred-endpoint window plus its final backoff step,
/// capped so a stale session never lingers for long.
fn reconnect_timeout_secs(config: &TransportConfig) -> u64 {
    let total = config.max_preferred_duration + PREFERRED_BACKOFF_MAX;
    total.as_secs().clamp(1, MAX_RECONNECT_TIMEOUT_SECS)
}
