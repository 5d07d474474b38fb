use std::fmt;

use serde::{Deserialize, Serialize};

mod codec;
mod meta;
mod reassembly;

pub use codec::{CodecError, Flags, Frame, FrameCodec, MessageType, encode_frame, split_metadata};
pub use meta::{HandshakeInfo, TransferMeta, sha256_hex};
pub use reassembly::{CompletedTransfer, Reassembler, ReassemblyError};

/// ASCII "NP".
pub const PROTOCOL_MAGIC: u16 = 0x4E50;
pub const PROTOCOL_VERSION: u8 = 0x01;
/// Minor identifier advertised in handshakes (V1.1).
pub const PROTOCOL_MINOR: u32 = 11;
pub const HEADER_LEN: usize = 33;
pub const DEVICE_ID_LEN: usize = 16;
pub const DEFAULT_FRAGMENT_PAYLOAD: usize = 64 * 1024;
/// Hard ceiling for a single reassembled transfer, whatever size the sender declares.
pub const MAX_TRANSFER_BYTES: usize = 100 * 1024 * 1024;
pub const MIME_TEXT_PLAIN: &str = "text/plain";
pub const MIME_IMAGE_PNG: &str = "image/png";
pub const MIME_OCTET_STREAM: &str = "application/octet-stream";

pub type RoomId = String;

/// Per-process device identity, embedded as `sender_id` in every outgoing frame.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId([u8; DEVICE_ID_LEN]);

impl DeviceId {
    #[must_use]
    pub fn random() -> Self {
        Self(rand::random())
    }

    #[must_use]
    pub const fn from_bytes(bytes: [u8; DEVICE_ID_LEN]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; DEVICE_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", hex::encode(self.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClipboardKind {
    Text,
    Image,
    File,
}

impl ClipboardKind {
    #[must_use]
    pub const fn message_type(self) -> MessageType {
        match self {
            ClipboardKind::Text => MessageType::Text,
            ClipboardKind::Image => MessageType::Image,
            ClipboardKind::File => MessageType::File,
        }
    }
}

impl fmt::Display for ClipboardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClipboardKind::Text => f.write_str("text"),
            ClipboardKind::Image => f.write_str("image"),
            ClipboardKind::File => f.write_str("file"),
        }
    }
}

/// A logical clipboard payload as exchanged with the local clipboard collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipboardContent {
    pub kind: ClipboardKind,
    pub mime: String,
    pub name: Option<String>,
    pub bytes: Vec<u8>,
}

impl ClipboardContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: ClipboardKind::Text,
            mime: MIME_TEXT_PLAIN.to_owned(),
            name: None,
            bytes: text.into().into_bytes(),
        }
    }

    pub fn image(bytes: Vec<u8>, mime: impl Into<String>) -> Self {
        Self {
            kind: ClipboardKind::Image,
            mime: mime.into(),
            name: None,
            bytes,
        }
    }

    pub fn file(name: impl Into<String>, bytes: Vec<u8>, mime: impl Into<String>) -> Self {
        Self {
            kind: ClipboardKind::File,
            mime: mime.into(),
            name: Some(name.into()),
            bytes,
        }
    }

    /// Encodes this content into one or more frames ready for the wire.
    pub fn encode(
        &self,
        codec: &FrameCodec,
        max_fragment_payload: usize,
    ) -> Result<Vec<bytes::Bytes>, CodecError> {
        match self.kind {
            ClipboardKind::Text => {
                let text =
                    std::str::from_utf8(&self.bytes).map_err(|_| CodecError::InvalidText)?;
                Ok(vec![codec.encode_text(text)?])
            }
            ClipboardKind::Image => {
                codec.encode_image(&self.bytes, &self.mime, max_fragment_payload)
            }
            ClipboardKind::File => codec.encode_file(
                self.name.as_deref().unwrap_or("file.bin"),
                &self.bytes,
                &self.mime,
                max_fragment_payload,
            ),
        }
    }
}

impl From<CompletedTransfer> for ClipboardContent {
    fn from(transfer: CompletedTransfer) -> Self {
        let kind = match transfer.kind {
            MessageType::File => ClipboardKind::File,
            _ => ClipboardKind::Image,
        };
        let default_mime = match kind {
            ClipboardKind::File => MIME_OCTET_STREAM,
            _ => MIME_IMAGE_PNG,
        };
        Self {
            kind,
            mime: transfer
                .meta
                .mime
                .clone()
                .filter(|mime| !mime.is_empty())
                .unwrap_or_else(|| default_mime.to_owned()),
            name: transfer.meta.name.clone(),
            bytes: transfer.data,
        }
    }
}

/// Local clipboard writer. Implementations must not block the caller for long:
/// it is invoked from connection read paths.
pub trait ClipboardSink: Send + Sync {
    fn write(&self, content: ClipboardContent);
}

/// Sink that discards everything; useful for pure relays and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ClipboardSink for NullSink {
    fn write(&self, _content: ClipboardContent) {}
}
