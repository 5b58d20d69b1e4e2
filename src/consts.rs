// src/consts.rs
use std::time::Duration;

/// Version string stamped on every outbound envelope.
pub const PROTOCOL_VERSION: &str = "1.6";

/// A bare newline frame is a liveness ping; the reply is the same frame.
pub const HEARTBEAT_FRAME: &str = "\n";

/// Abnormal closure (server unreachable or connection dropped).
pub const CLOSE_CODE_ABNORMAL: u16 = 1006;
/// TLS handshake failure.
pub const CLOSE_CODE_TLS_FAILURE: u16 = 1015;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(5_000);
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(15_000);
/// How long reconnection stays pinned to a preferred endpoint before the
/// primary list takes over.
pub const DEFAULT_MAX_PREFERRED_DURATION: Duration = Duration::from_millis(15_000);

pub const BACKOFF_FACTOR: f64 = 2.0;
pub const BACKOFF_JITTER: f64 = 0.4;

pub const PREFERRED_BACKOFF_MIN: Duration = Duration::from_millis(100);
pub const PREFERRED_BACKOFF_MAX: Duration = Duration::from_millis(1_000);
/// Cap used instead of `PREFERRED_BACKOFF_MAX` once the server supplied a
/// retry-after hint.
pub const RETRY_AFTER_BACKOFF_MAX: Duration = Duration::from_millis(60_000);

pub const PRIMARY_BACKOFF_MIN: Duration = Duration::from_millis(100);
pub const PRIMARY_BACKOFF_MAX: Duration = Duration::from_millis(20_000);
/// With several candidate edges the primary floor is randomized in this
/// window so a fleet of clients does not stampede a recovering edge.
pub const PRIMARY_BACKOFF_MIN_FLOOR_MS: u64 = 1_000;
pub const PRIMARY_BACKOFF_MIN_CEIL_MS: u64 = 5_000;

/// Upper bound on the advisory reconnect window sent in the `listen` frame.
pub const MAX_RECONNECT_TIMEOUT_SECS: u64 = 30;
