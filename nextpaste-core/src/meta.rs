use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::PROTOCOL_MINOR;

/// Metadata carried at the front of the first fragment of an image or file transfer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Lowercase hex SHA-256 of the complete payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

impl TransferMeta {
    pub fn image(mime: &str, size: usize) -> Self {
        Self {
            mime: Some(mime.to_owned()),
            size: Some(size as u64),
            ..Self::default()
        }
    }

    pub fn file(name: &str, mime: &str, data: &[u8]) -> Self {
        Self {
            name: Some(name.to_owned()),
            mime: Some(mime.to_owned()),
            size: Some(data.len() as u64),
            hash: Some(sha256_hex(data)),
            ..Self::default()
        }
    }

    /// Declared size, if any, as a usize.
    pub fn declared_size(&self) -> Option<usize> {
        self.size.and_then(|size| usize::try_from(size).ok())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeInfo {
    pub name: String,
    pub os: String,
    #[serde(rename = "ver")]
    pub protocol_minor: u32,
}

impl HandshakeInfo {
    pub fn new(name: impl Into<String>, os: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            os: os.into(),
            protocol_minor: PROTOCOL_MINOR,
        }
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
