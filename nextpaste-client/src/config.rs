use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use nextpaste_core::{DEFAULT_FRAGMENT_PAYLOAD, MAX_TRANSFER_BYTES};
use serde::{Deserialize, Serialize};

use crate::ClientError;

/// The config file is expected to be tiny; anything larger is refused unread.
pub const MAX_CONFIG_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    /// e.g. `ws://relay.example:8080/v11/ws/my-room`
    pub server_url: Option<String>,
    pub device_name: String,
    pub platform: String,
    pub heartbeat_interval_ms: u64,
    pub reconnect_delay_ms: u64,
    pub connect_timeout_ms: u64,
    pub write_timeout_ms: u64,
    /// How long `disconnect()` waits for the session to wind down before aborting it.
    pub disconnect_grace_ms: u64,
    pub queue_capacity: usize,
    pub fragment_payload: usize,
    pub max_transfer_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            device_name: default_device_name(),
            platform: std::env::consts::OS.to_owned(),
            heartbeat_interval_ms: 30_000,
            reconnect_delay_ms: 5_000,
            connect_timeout_ms: 12_000,
            write_timeout_ms: 10_000,
            disconnect_grace_ms: 2_000,
            queue_capacity: 256,
            fragment_payload: DEFAULT_FRAGMENT_PAYLOAD,
            max_transfer_bytes: MAX_TRANSFER_BYTES,
        }
    }
}

impl ClientConfig {
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    #[must_use]
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    #[must_use]
    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }
}

fn default_device_name() -> String {
    ["NEXTPASTE_DEVICE_NAME", "HOSTNAME", "COMPUTERNAME"]
        .iter()
        .find_map(|key| std::env::var(key).ok().filter(|value| !value.trim().is_empty()))
        .unwrap_or_else(|| "nextpaste".to_owned())
}

pub fn default_config_path() -> PathBuf {
    if let Some(dir) = std::env::var_os("NEXTPASTE_CONFIG_DIR") {
        return PathBuf::from(dir).join("config.json");
    }

    let base = std::env::var_os("APPDATA")
        .or_else(|| std::env::var_os("XDG_CONFIG_HOME"))
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("nextpaste").join("config.json")
}

pub fn parse_config_json(data: &str) -> Result<ClientConfig, ClientError> {
    Ok(serde_json::from_str(data)?)
}

pub fn load_config_from_path(path: &Path) -> Result<ClientConfig, ClientError> {
    let meta = fs::metadata(path)?;
    if meta.len() > MAX_CONFIG_BYTES {
        return Err(ClientError::ConfigTooLarge {
            size: meta.len(),
            max: MAX_CONFIG_BYTES,
        });
    }

    let data = fs::read_to_string(path)?;
    parse_config_json(&data)
}

/// Writes through a temporary file so a crash never leaves a half-written config.
pub fn save_config_to_path(path: &Path, config: &ClientConfig) -> Result<(), ClientError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    let payload = serde_json::to_string_pretty(config)?;
    fs::write(&tmp, payload.as_bytes())?;

    if path.exists() {
        let _ = fs::remove_file(path);
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config = parse_config_json(r#"{"device_name":"desk","reconnect_delay_ms":250}"#)
            .expect("parse partial config");
        assert_eq!(config.device_name, "desk");
        assert_eq!(config.reconnect_delay(), Duration::from_millis(250));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.connect_timeout(), Duration::from_secs(12));
        assert_eq!(config.fragment_payload, DEFAULT_FRAGMENT_PAYLOAD);
        assert_eq!(config.server_url, None);
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let err = parse_config_json("{not json").expect_err("should fail");
        assert!(matches!(err, ClientError::ConfigParse(_)));
    }
}
