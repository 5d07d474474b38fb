use std::time::Duration;

use nextpaste_core::{CodecError, DEFAULT_FRAGMENT_PAYLOAD, MAX_TRANSFER_BYTES};
use thiserror::Error;

pub mod connection;
pub mod direct;
pub mod relay;
pub mod rooms;

pub use connection::{ConnectionHandle, ConnectionId, ConnectionSummary, EnqueueError, PeerInfo};
pub use direct::DirectServer;
pub use relay::{AppState, Namespace, build_router, serve};
pub use rooms::{BroadcastReport, Room, RoomRegistry, RoomStats};

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode clipboard content: {0}")]
    Codec(#[from] CodecError),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Capacity of each connection's outbound queue, in messages.
    pub queue_capacity: usize,
    pub idle_timeout: Duration,
    pub keepalive_interval: Duration,
    pub write_timeout: Duration,
    pub max_message_bytes: usize,
    /// Payload budget when the direct server fragments outgoing transfers.
    pub fragment_payload: usize,
    pub max_transfer_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            fragment_payload: DEFAULT_FRAGMENT_PAYLOAD,
            max_transfer_bytes: MAX_TRANSFER_BYTES,
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn timings(&self) -> connection::LoopTimings {
        connection::LoopTimings {
            idle_timeout: self.idle_timeout,
            keepalive_interval: self.keepalive_interval,
            write_timeout: self.write_timeout,
        }
    }
}
