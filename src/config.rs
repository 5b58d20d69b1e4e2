use std::time::Duration;

use crate::consts::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_HEARTBEAT_TIMEOUT, DEFAULT_MAX_PREFERRED_DURATION,
};

/// Tunables for the socket lifecycle manager.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// How long a connection attempt may sit in `Connecting` before the
    /// endpoint is rotated and the attempt abandoned.
    pub connect_timeout: Duration,
    /// The connection is recycled when no traffic at all (heartbeat pings
    /// included) arrives within this window.
    pub heartbeat_timeout: Duration,
    /// How long reconnection may stay pinned to the preferred URI before
    /// falling back to the primary list.
    pub max_preferred_duration: Duration,
    /// Total time spent on the primary list before giving up for good.
    /// `None` keeps retrying forever.
    pub max_primary_duration: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            max_preferred_duration: DEFAULT_MAX_PREFERRED_DURATION,
            max_primary_duration: None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ClientConfig {
    pub transport: TransportConfig,
}
