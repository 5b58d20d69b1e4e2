use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::SignalingError;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

/// Connection metadata reported by the gateway in its `connected` frame.
#[derive(Debug, Clone, Default)]
pub struct GatewayInfo {
    pub gateway: Option<String>,
    pub region: Option<String>,
}

/// The signaling channel is open and authenticated traffic may flow.
#[derive(Debug, Clone)]
pub struct Opened;

/// The gateway acknowledged the handshake; calls can be placed.
#[derive(Debug, Clone)]
pub struct Ready {
    pub gateway: GatewayInfo,
}

/// The channel dropped; reconnection is running in the background.
#[derive(Debug, Clone)]
pub struct Offline;

/// The client was torn down for good.
#[derive(Debug, Clone)]
pub struct Closed;

/// An inbound signaling frame, split into its verb and payload. Lifecycle
/// and error frames are routed to their own channels and never show up here.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub kind: String,
    pub payload: Value,
}

// Macro to generate EventBus fields and constructor
macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus with a separate broadcast channel per event kind.
        /// Subscribers that lag simply miss events; nothing blocks the
        /// signaling path.
        #[derive(Debug)]
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }

        impl Default for EventBus {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}

define_event_bus! {
    // Lifecycle
    (open, Arc<Opened>),
    (ready, Arc<Ready>),
    (offline, Arc<Offline>),
    (close, Arc<Closed>),

    // Protocol
    (error, Arc<SignalingError>),
    (message, Arc<IncomingMessage>),
}
