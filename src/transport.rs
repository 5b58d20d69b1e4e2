use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use rand::Rng;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::backoff::{BackoffConfig, BackoffFired, BackoffRole, BackoffTimer};
use crate::config::TransportConfig;
use crate::consts::{
    CLOSE_CODE_ABNORMAL, CLOSE_CODE_TLS_FAILURE, HEARTBEAT_FRAME, PREFERRED_BACKOFF_MAX,
    PREFERRED_BACKOFF_MIN, PRIMARY_BACKOFF_MAX, PRIMARY_BACKOFF_MIN, PRIMARY_BACKOFF_MIN_CEIL_MS,
    PRIMARY_BACKOFF_MIN_FLOOR_MS, RETRY_AFTER_BACKOFF_MAX,
};
use crate::endpoint::EndpointSet;
use crate::error::TransportError;
use crate::net::{Socket, SocketEvent, SocketFactory};

/// Connection lifecycle states. Reconnection never reuses a live socket:
/// every attempt is a fresh `Closed -> Connecting` transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
}

/// An event emitted toward the signaling layer.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The socket is open; frames can be written.
    Open,
    /// The socket went away. Emitted on every teardown, including the
    /// permanent one.
    Close,
    /// A raw inbound frame. Heartbeat pings are swallowed below this layer.
    Message(String),
    /// A failure, surfaced for visibility. Recovery is automatic.
    Error(TransportError),
}

enum Msg {
    Open,
    Send(String, oneshot::Sender<bool>),
    Close,
    UpdateUris(Vec<String>),
    UpdatePreferred(Option<String>),
    Socket(u64, SocketEvent),
    ConnectTimeout(u64),
    HeartbeatCheck(u64),
    Backoff(BackoffFired),
}

/// Why a socket went away. Remote closes carry the wire close code; the
/// local causes come from our own watchdogs.
enum CloseCause {
    Remote { code: u16, reason: String },
    ConnectTimeout,
    HeartbeatLoss,
}

/// Handle to the socket lifecycle actor.
///
/// The actor owns exactly one physical socket at a time, classifies
/// failures, rotates among candidate endpoints, and drives the primary and
/// preferred backoff schedules. All of its state lives on one task;
/// commands, socket events, and timer fires arrive on a single channel, and
/// every timer message carries the epoch it was armed under, so a stale
/// fire can never mutate fresh state.
#[derive(Clone)]
pub struct Transport {
    tx: mpsc::UnboundedSender<Msg>,
}

impl Transport {
    /// Spawns the lifecycle actor. Events flow on the returned receiver.
    pub fn new(
        config: TransportConfig,
        uris: Vec<String>,
        factory: Arc<dyn SocketFactory>,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let task = TransportTask::new(config, uris, factory, tx.clone(), events_tx);
        tokio::spawn(task.run(rx));
        (Self { tx }, events_rx)
    }

    /// Starts connecting. A no-op while a socket is already connecting or
    /// open, and after a permanent close.
    pub fn open(&self) {
        let _ = self.tx.send(Msg::Open);
    }

    /// Writes one frame if the socket is open right now. Returns whether
    /// the frame was handed to the socket; there is no queueing here.
    pub async fn send(&self, frame: String) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Msg::Send(frame, reply_tx)).is_err() {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    /// Permanent teardown. No further reconnection is attempted.
    pub fn close(&self) {
        let _ = self.tx.send(Msg::Close);
    }

    /// Replaces the primary endpoint list. Does not trigger reconnection.
    pub fn update_uris(&self, uris: Vec<String>) {
        let _ = self.tx.send(Msg::UpdateUris(uris));
    }

    /// Sets or clears the sticky endpoint. Does not trigger reconnection.
    pub fn update_preferred_uri(&self, uri: Option<String>) {
        let _ = self.tx.send(Msg::UpdatePreferred(uri));
    }
}

struct TransportTask {
    config: TransportConfig,
    factory: Arc<dyn SocketFactory>,
    endpoints: EndpointSet,
    state: ConnectionState,
    previous_state: ConnectionState,
    socket: Option<Arc<dyn Socket>>,
    socket_epoch: u64,
    connect_epoch: u64,
    heartbeat_epoch: u64,
    last_inbound: Instant,
    should_fallback: bool,
    closed: bool,
    primary: BackoffTimer,
    preferred: BackoffTimer,
    primary_started: Option<Instant>,
    preferred_started: Option<Instant>,
    retry_after: Option<Duration>,
    events: mpsc::UnboundedSender<TransportEvent>,
    tx: mpsc::UnboundedSender<Msg>,
}

impl TransportTask {
    fn new(
        config: TransportConfig,
        uris: Vec<String>,
        factory: Arc<dyn SocketFactory>,
        tx: mpsc::UnboundedSender<Msg>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        let primary_tx = tx.clone();
        let primary = BackoffTimer::new(
            BackoffRole::Primary,
            primary_backoff_config(uris.len()),
            move |fired| {
                let _ = primary_tx.send(Msg::Backoff(fired));
            },
        );
        let preferred_tx = tx.clone();
        let preferred = BackoffTimer::new(
            BackoffRole::Preferred,
            BackoffConfig::new(PREFERRED_BACKOFF_MIN, PREFERRED_BACKOFF_MAX),
            move |fired| {
                let _ = preferred_tx.send(Msg::Backoff(fired));
            },
        );
        Self {
            config,
            factory,
            endpoints: EndpointSet::new(uris),
            state: ConnectionState::Closed,
            previous_state: ConnectionState::Closed,
            socket: None,
            socket_epoch: 0,
            connect_epoch: 0,
            heartbeat_epoch: 0,
            last_inbound: Instant::now(),
            should_fallback: false,
            closed: false,
            primary,
            preferred,
            primary_started: None,
            preferred_started: None,
            retry_after: None,
            events,
            tx,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Msg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                Msg::Open => self.handle_open().await,
                Msg::Send(frame, reply) => {
                    let sent = self.handle_send(&frame).await;
                    let _ = reply.send(sent);
                }
                Msg::Close => self.handle_close(),
                Msg::UpdateUris(uris) => {
                    self.primary.seed(primary_backoff_config(uris.len()));
                    self.endpoints.update_uris(uris);
                }
                Msg::UpdatePreferred(uri) => self.endpoints.set_preferred(uri),
                Msg::Socket(epoch, event) => self.handle_socket_event(epoch, event).await,
                Msg::ConnectTimeout(epoch) => self.handle_connect_timeout(epoch).await,
                Msg::HeartbeatCheck(epoch) => self.handle_heartbeat_check(epoch).await,
                Msg::Backoff(fired) => self.handle_backoff(fired).await,
            }
        }
        debug!(target: "Transport", "Actor finished");
    }

    async fn handle_open(&mut self) {
        if self.closed {
            return;
        }
        if self.socket.is_some()
            && matches!(
                self.state,
                ConnectionState::Connecting | ConnectionState::Open
            )
        {
            debug!(target: "Transport", "open() ignored, already {:?}", self.state);
            return;
        }
        match self.endpoints.connect_target().map(str::to_string) {
            Some(uri) => self.connect(uri, 0).await,
            None => warn!(target: "Transport", "open() called with no signaling URIs configured"),
        }
    }

    async fn handle_send(&mut self, frame: &str) -> bool {
        if self.state != ConnectionState::Open {
            return false;
        }
        let Some(socket) = self.socket.clone() else {
            return false;
        };
        match socket.send(frame).await {
            Ok(()) => true,
            Err(e) => {
                warn!(target: "Transport", "Frame write failed: {e:#}");
                false
            }
        }
    }

    fn handle_close(&mut self) {
        if self.closed {
            return;
        }
        info!(target: "Transport", "Closing permanently");
        self.closed = true;
        self.primary.reset();
        self.preferred.reset();
        self.teardown_socket();
        self.set_state(ConnectionState::Closed);
        self.emit(TransportEvent::Close);
    }

    async fn connect(&mut self, uri: String, attempt: u32) {
        self.teardown_socket();
        self.set_state(ConnectionState::Connecting);
        info!(target: "Transport", "Connecting to {uri} (attempt {attempt})");
        match self.factory.connect(&uri).await {
            Ok((socket, mut socket_events)) => {
                self.socket = Some(socket);
                self.socket_epoch += 1;
                let epoch = self.socket_epoch;
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    while let Some(event) = socket_events.recv().await {
                        if tx.send(Msg::Socket(epoch, event)).is_err() {
                            break;
                        }
                    }
                });
                self.arm_connect_timeout();
            }
            Err(e) => {
                error!(target: "Transport", "Could not create a socket for {uri}: {e:#}");
                self.set_state(ConnectionState::Closed);
                self.emit(TransportEvent::Error(TransportError::ConnectionFailed {
                    uri,
                    reason: e.to_string(),
                }));
                self.emit(TransportEvent::Close);
            }
        }
    }

    async fn handle_socket_event(&mut self, epoch: u64, event: SocketEvent) {
        if epoch != self.socket_epoch {
            trace!(target: "Transport", "Dropping event from a dead socket");
            return;
        }
        match event {
            SocketEvent::Opened => self.on_socket_open(),
            SocketEvent::Message(frame) => self.on_socket_message(frame).await,
            SocketEvent::Error(reason) => {
                warn!(target: "Transport", "Socket error: {reason}");
                self.emit(TransportEvent::Error(TransportError::ConnectionDisconnected));
            }
            SocketEvent::Closed { code, reason } => {
                self.on_socket_closed(CloseCause::Remote { code, reason })
                    .await;
            }
        }
    }

    fn on_socket_open(&mut self) {
        info!(target: "Transport", "Socket open");
        self.connect_epoch += 1;
        self.should_fallback = false;
        self.set_state(ConnectionState::Open);
        self.primary.reset();
        self.preferred.reset();
        self.primary_started = None;
        self.preferred_started = None;
        self.retry_after = None;
        self.last_inbound = Instant::now();
        self.arm_heartbeat(self.config.heartbeat_timeout);
        self.emit(TransportEvent::Open);
    }

    async fn on_socket_message(&mut self, frame: String) {
        self.last_inbound = Instant::now();
        if frame == HEARTBEAT_FRAME {
            trace!(target: "Transport", "Heartbeat ping, echoing");
            if let Some(socket) = self.socket.clone() {
                if let Err(e) = socket.send(HEARTBEAT_FRAME).await {
                    warn!(target: "Transport", "Heartbeat echo failed: {e:#}");
                }
            }
            return;
        }
        if let Some(hint) = parse_retry_after(&frame) {
            info!(target: "Transport", "Server asked us to hold off for {hint:?}");
            self.retry_after = Some(hint);
        }
        self.emit(TransportEvent::Message(frame));
    }

    /// The close path is the sole recovery trigger: classify, tear down,
    /// then hand control to whichever backoff role applies.
    async fn on_socket_closed(&mut self, cause: CloseCause) {
        match &cause {
            CloseCause::Remote { code, reason } => {
                info!(target: "Transport", "Socket closed with code {code}: {reason}");
                if *code == CLOSE_CODE_ABNORMAL || *code == CLOSE_CODE_TLS_FAILURE {
                    self.emit(TransportEvent::Error(TransportError::ConnectionDisconnected));
                    self.classify_endpoint_failure();
                }
            }
            CloseCause::HeartbeatLoss => {
                self.emit(TransportEvent::Error(TransportError::ConnectionDisconnected));
                self.classify_endpoint_failure();
            }
            // The connect watchdog already rotated the index.
            CloseCause::ConnectTimeout => {}
        }
        self.teardown_socket();
        self.set_state(ConnectionState::Closed);
        self.emit(TransportEvent::Close);
        if !self.closed {
            self.schedule_recovery();
        }
    }

    /// Endpoint-level failures rotate the index unless this is the first
    /// failure of a connection that had been confirmed healthy; after that
    /// first observation every further failure rotates.
    fn classify_endpoint_failure(&mut self) {
        let was_connected = self.state == ConnectionState::Open
            || self.previous_state == ConnectionState::Open;
        if self.should_fallback || !was_connected {
            self.endpoints.advance();
            debug!(
                target: "Transport",
                "Rotating to the next endpoint: {:?}",
                self.endpoints.current()
            );
        }
        self.should_fallback = true;
    }

    fn schedule_recovery(&mut self) {
        if self.endpoints.preferred().is_some() {
            if self.preferred_started.is_none() {
                self.preferred_started = Some(Instant::now());
            }
            // The hint drives the whole schedule while it lasts; without one
            // the sticky endpoint is retried aggressively.
            let config = match self.retry_after {
                Some(hint) => {
                    let mut config = BackoffConfig::new(hint, RETRY_AFTER_BACKOFF_MAX.max(hint));
                    config.use_initial_value = true;
                    config
                }
                None => BackoffConfig::new(PREFERRED_BACKOFF_MIN, PREFERRED_BACKOFF_MAX),
            };
            self.preferred.seed(config);
            self.preferred.backoff();
        } else {
            if self.primary_started.is_none() {
                self.primary_started = Some(Instant::now());
            }
            self.primary.backoff();
        }
    }

    async fn handle_backoff(&mut self, fired: BackoffFired) {
        if self.closed {
            return;
        }
        let acknowledged = match fired.role {
            BackoffRole::Primary => self.primary.acknowledge(&fired),
            BackoffRole::Preferred => self.preferred.acknowledge(&fired),
        };
        if !acknowledged {
            return;
        }
        match fired.role {
            BackoffRole::Preferred => self.on_preferred_ready(fired).await,
            BackoffRole::Primary => self.on_primary_ready(fired).await,
        }
    }

    async fn on_preferred_ready(&mut self, fired: BackoffFired) {
        let expired = self
            .preferred_started
            .map(|started| started.elapsed() > self.config.max_preferred_duration)
            .unwrap_or(true);
        match self.endpoints.preferred().map(str::to_string) {
            Some(uri) if !expired => self.connect(uri, fired.attempt).await,
            _ => {
                info!(
                    target: "Transport",
                    "Giving up on the preferred endpoint, falling back to the primary list"
                );
                self.endpoints.set_preferred(None);
                self.preferred_started = None;
                self.preferred.reset();
                if self.primary_started.is_none() {
                    self.primary_started = Some(Instant::now());
                }
                self.primary.backoff();
            }
        }
    }

    async fn on_primary_ready(&mut self, fired: BackoffFired) {
        if let Some(max) = self.config.max_primary_duration {
            let exhausted = self
                .primary_started
                .map(|started| started.elapsed() > max)
                .unwrap_or(false);
            if exhausted {
                error!(
                    target: "Transport",
                    "Could not reconnect within {max:?}, giving up"
                );
                self.closed = true;
                return;
            }
        }
        match self.endpoints.current().map(str::to_string) {
            Some(uri) => self.connect(uri, fired.attempt).await,
            None => warn!(target: "Transport", "No signaling URIs configured"),
        }
    }

    async fn handle_connect_timeout(&mut self, epoch: u64) {
        if epoch != self.connect_epoch || self.state != ConnectionState::Connecting {
            return;
        }
        warn!(
            target: "Transport",
            "Timed out connecting after {:?}",
            self.config.connect_timeout
        );
        self.endpoints.advance();
        self.on_socket_closed(CloseCause::ConnectTimeout).await;
    }

    async fn handle_heartbeat_check(&mut self, epoch: u64) {
        if epoch != self.heartbeat_epoch || self.state != ConnectionState::Open {
            return;
        }
        let elapsed = self.last_inbound.elapsed();
        if elapsed >= self.config.heartbeat_timeout {
            warn!(
                target: "Transport",
                "No traffic for {elapsed:?}, recycling the connection"
            );
            self.on_socket_closed(CloseCause::HeartbeatLoss).await;
        } else {
            self.arm_heartbeat(self.config.heartbeat_timeout - elapsed);
        }
    }

    fn teardown_socket(&mut self) {
        // Bumping the epochs detaches the old socket and cancels its
        // watchdogs; anything still in flight arrives stale and is dropped.
        self.socket_epoch += 1;
        self.connect_epoch += 1;
        self.heartbeat_epoch += 1;
        if let Some(socket) = self.socket.take() {
            tokio::spawn(async move { socket.close().await });
        }
    }

    fn arm_connect_timeout(&mut self) {
        self.connect_epoch += 1;
        let epoch = self.connect_epoch;
        let timeout = self.config.connect_timeout;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(Msg::ConnectTimeout(epoch));
        });
    }

    fn arm_heartbeat(&mut self, delay: Duration) {
        self.heartbeat_epoch += 1;
        let epoch = self.heartbeat_epoch;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Msg::HeartbeatCheck(epoch));
        });
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!(target: "Transport", "{:?} -> {:?}", self.state, next);
        }
        self.previous_state = self.state;
        self.state = next;
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

fn primary_backoff_config(uri_count: usize) -> BackoffConfig {
    // With a single edge there is nothing to spread load across, so retry
    // quickly; with several, randomize the floor so a fleet of clients does
    // not stampede a recovering edge.
    let min = if uri_count > 1 {
        let ms =
            rand::rng().random_range(PRIMARY_BACKOFF_MIN_FLOOR_MS..=PRIMARY_BACKOFF_MIN_CEIL_MS);
        Duration::from_millis(ms)
    } else {
        PRIMARY_BACKOFF_MIN
    };
    BackoffConfig::new(min, PRIMARY_BACKOFF_MAX)
}

fn parse_retry_after(frame: &str) -> Option<Duration> {
    let value: Value = serde_json::from_str(frame).ok()?;
    if value.get("type")?.as_str()? != "error" {
        return None;
    }
    let secs = value
        .get("payload")?
        .get("error")?
        .get("retryAfter")?
        .as_u64()?;
    Some(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_is_read_from_error_frames() {
        let frame = r#"{"type":"error","payload":{"error":{"code":31002,"message":"busy","retryAfter":30}},"version":"1.6"}"#;
        assert_eq!(parse_retry_after(frame), Some(Duration::from_secs(30)));
    }

    #[test]
    fn retry_after_ignores_other_frames() {
        assert_eq!(parse_retry_after(r#"{"type":"answer","payload":{}}"#), None);
        assert_eq!(
            parse_retry_after(r#"{"type":"error","payload":{"error":{"code":1}}}"#),
            None
        );
        assert_eq!(parse_retry_after("\n"), None);
    }

    #[test]
    fn primary_floor_is_randomized_only_with_several_edges() {
        assert_eq!(primary_backoff_config(1).min, PRIMARY_BACKOFF_MIN);
        for _ in 0..50 {
            let min = primary_backoff_config(3).min;
            assert!(min >= Duration::from_millis(PRIMARY_BACKOFF_MIN_FLOOR_MS));
            assert!(min <= Duration::from_millis(PRIMARY_BACKOFF_MIN_CEIL_MS));
        }
    }
}
