use nextpaste_core::CodecError;
use thiserror::Error;

mod client;
pub mod config;
pub mod sink;

pub use client::{ConnectedHook, ConnectionStatus, SyncClient};
pub use config::{ClientConfig, load_config_from_path, save_config_to_path};
pub use sink::DirectorySink;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client is already connected or connecting")]
    AlreadyConnected,
    #[error("client is not connected")]
    NotConnected,
    #[error("invalid server url: {0}")]
    InvalidUrl(String),
    #[error("failed to encode clipboard content: {0}")]
    Codec(#[from] CodecError),
    #[error("config file too large: {size} bytes (max {max})")]
    ConfigTooLarge { size: u64, max: u64 },
    #[error("config file io error: {0}")]
    ConfigIo(#[from] std::io::Error),
    #[error("config file parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),
}
