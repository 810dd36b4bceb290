use crate::pool::collaborators::ConnectionStatus;
use crate::pool::manager::PoolMetrics;
use crate::pool::memory::MemoryUsage;
use crate::pool::protocol::InboundMessage;
use crate::session::SessionKey;
use serde::Serialize;

/// Buffered events per subscriber before the slowest one starts lagging.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events broadcast by the connection pool.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum PoolEvent {
    CapacityReached {
        current: usize,
        max: usize,
    },
    MemoryThresholdExceeded {
        usage: MemoryUsage,
        threshold: f64,
    },
    #[serde(rename = "websocket:created")]
    WebsocketCreated {
        key: SessionKey,
    },
    #[serde(rename = "websocket:closed")]
    WebsocketClosed {
        key: SessionKey,
        reason: String,
    },
    QrGenerated {
        key: SessionKey,
        qr: String,
        expires_in_ms: u64,
    },
    ConnectionUpdate {
        key: SessionKey,
        status: ConnectionStatus,
        reason: Option<String>,
    },
    MessageReceived {
        key: SessionKey,
        message: InboundMessage,
    },
    Error {
        key: Option<SessionKey>,
        message: String,
    },
    HealthCheck {
        metrics: PoolMetrics,
    },
}

impl PoolEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            PoolEvent::CapacityReached { .. } => "capacity-reached",
            PoolEvent::MemoryThresholdExceeded { .. } => "memory-threshold-exceeded",
            PoolEvent::WebsocketCreated { .. } => "websocket:created",
            PoolEvent::WebsocketClosed { .. } => "websocket:closed",
            PoolEvent::QrGenerated { .. } => "qr-generated",
            PoolEvent::ConnectionUpdate { .. } => "connection-update",
            PoolEvent::MessageReceived { .. } => "message-received",
            PoolEvent::Error { .. } => "error",
            PoolEvent::HealthCheck { .. } => "health-check",
        }
    }
}
