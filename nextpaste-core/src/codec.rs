use std::{
    ops::{BitOr, BitOrAssign, Range},
    sync::atomic::{AtomicU32, Ordering},
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::{
    DEVICE_ID_LEN, DeviceId, HEADER_LEN, PROTOCOL_MAGIC, PROTOCOL_VERSION,
    meta::{HandshakeInfo, TransferMeta},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Heartbeat = 0x0,
    Handshake = 0x1,
    Text = 0x2,
    Image = 0x3,
    File = 0x4,
}

impl MessageType {
    /// Whether frames of this type may be fragmented and go through reassembly.
    #[must_use]
    pub const fn is_transfer(self) -> bool {
        matches!(self, MessageType::Image | MessageType::File)
    }
}

impl TryFrom<u8> for MessageType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(MessageType::Heartbeat),
            0x1 => Ok(MessageType::Handshake),
            0x2 => Ok(MessageType::Text),
            0x3 => Ok(MessageType::Image),
            0x4 => Ok(MessageType::File),
            other => Err(CodecError::UnknownMessageType(other)),
        }
    }
}

/// Frame flag bitset. Unknown bits are preserved as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Flags(u8);

impl Flags {
    pub const NONE: Flags = Flags(0x00);
    pub const MORE_FRAGMENTS: Flags = Flags(0x01);
    pub const HAS_METADATA: Flags = Flags(0x02);

    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame too short: {0} bytes, header is 33")]
    TooShort(usize),
    #[error("bad protocol magic 0x{0:04X}")]
    BadMagic(u16),
    #[error("unknown message type 0x{0:02X}")]
    UnknownMessageType(u8),
    #[error("truncated frame: payload length {declared}, {available} bytes available")]
    Truncated { declared: usize, available: usize },
    #[error("frame was sent by this device")]
    Loopback,
    #[error("input must not be empty")]
    EmptyInput,
    #[error("transfer metadata of {meta_len} bytes does not fit a {budget}-byte fragment")]
    MetadataTooLarge { meta_len: usize, budget: usize },
    #[error("transfer metadata is corrupt: {0}")]
    MetadataCorrupt(String),
    #[error("payload exceeds the u32 length field")]
    PayloadTooLarge,
    #[error("text payload is not valid utf-8")]
    InvalidText,
    #[error("invalid handshake payload: {0}")]
    InvalidHandshake(String),
    #[error("expected a {expected:?} frame, got {actual:?}")]
    UnexpectedType {
        expected: MessageType,
        actual: MessageType,
    },
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// One decoded wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub kind: MessageType,
    pub flags: Flags,
    pub message_id: u32,
    pub sequence: u32,
    pub sender: DeviceId,
    pub payload: Bytes,
}

impl Frame {
    /// Parses a frame without any notion of a local identity.
    ///
    /// Layout (big-endian):
    /// - 0..2   magic
    /// - 2      version (high nibble) | type (low nibble)
    /// - 3      flags
    /// - 4      reserved
    /// - 5..9   message_id
    /// - 9..13  sequence
    /// - 13..29 sender_id
    /// - 29..33 payload_length
    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        Self::parse_with(data, |range| Bytes::copy_from_slice(&data[range]))
    }

    /// Like [`Frame::parse`], but the payload shares `data`'s buffer instead of copying it.
    pub fn parse_bytes(data: &Bytes) -> Result<Self, CodecError> {
        Self::parse_with(data, |range| data.slice(range))
    }

    fn parse_with(
        data: &[u8],
        payload: impl FnOnce(Range<usize>) -> Bytes,
    ) -> Result<Self, CodecError> {
        if data.len() < HEADER_LEN {
            return Err(CodecError::TooShort(data.len()));
        }

        let mut cursor = data;
        let magic = cursor.get_u16();
        if magic != PROTOCOL_MAGIC {
            return Err(CodecError::BadMagic(magic));
        }

        let version_type = cursor.get_u8();
        let version = version_type >> 4;
        let kind = MessageType::try_from(version_type & 0x0F)?;
        let flags = Flags::from_bits(cursor.get_u8());
        let _reserved = cursor.get_u8();
        let message_id = cursor.get_u32();
        let sequence = cursor.get_u32();
        let mut sender = [0_u8; DEVICE_ID_LEN];
        cursor.copy_to_slice(&mut sender);
        let declared = cursor.get_u32() as usize;

        if declared > cursor.len() {
            return Err(CodecError::Truncated {
                declared,
                available: cursor.len(),
            });
        }

        Ok(Self {
            version,
            kind,
            flags,
            message_id,
            sequence,
            sender: DeviceId::from_bytes(sender),
            payload: payload(HEADER_LEN..HEADER_LEN + declared),
        })
    }

    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let payload_len =
            u32::try_from(self.payload.len()).map_err(|_| CodecError::PayloadTooLarge)?;
        let mut out = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        put_header(
            &mut out,
            self.version,
            self.kind,
            self.flags,
            self.message_id,
            self.sequence,
            &self.sender,
            payload_len,
        );
        out.extend_from_slice(&self.payload);
        Ok(out.freeze())
    }

    #[must_use]
    pub fn more_fragments(&self) -> bool {
        self.flags.contains(Flags::MORE_FRAGMENTS)
    }

    #[must_use]
    pub fn has_metadata(&self) -> bool {
        self.flags.contains(Flags::HAS_METADATA)
    }

    pub fn text(&self) -> Result<&str, CodecError> {
        self.expect_kind(MessageType::Text)?;
        std::str::from_utf8(&self.payload).map_err(|_| CodecError::InvalidText)
    }

    pub fn handshake(&self) -> Result<HandshakeInfo, CodecError> {
        self.expect_kind(MessageType::Handshake)?;
        serde_json::from_slice(&self.payload)
            .map_err(|err| CodecError::InvalidHandshake(err.to_string()))
    }

    fn expect_kind(&self, expected: MessageType) -> Result<(), CodecError> {
        if self.kind == expected {
            Ok(())
        } else {
            Err(CodecError::UnexpectedType {
                expected,
                actual: self.kind,
            })
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn put_header(
    out: &mut BytesMut,
    version: u8,
    kind: MessageType,
    flags: Flags,
    message_id: u32,
    sequence: u32,
    sender: &DeviceId,
    payload_len: u32,
) {
    out.put_u16(PROTOCOL_MAGIC);
    out.put_u8((version << 4) | (kind as u8 & 0x0F));
    out.put_u8(flags.bits());
    out.put_u8(0);
    out.put_u32(message_id);
    out.put_u32(sequence);
    out.put_slice(sender.as_bytes());
    out.put_u32(payload_len);
}

/// Builds a complete frame with the current protocol version.
pub fn encode_frame(
    sender: &DeviceId,
    kind: MessageType,
    flags: Flags,
    message_id: u32,
    sequence: u32,
    payload: &[u8],
) -> Result<Bytes, CodecError> {
    let payload_len = u32::try_from(payload.len()).map_err(|_| CodecError::PayloadTooLarge)?;
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    put_header(
        &mut out,
        PROTOCOL_VERSION,
        kind,
        flags,
        message_id,
        sequence,
        sender,
        payload_len,
    );
    out.extend_from_slice(payload);
    Ok(out.freeze())
}

/// Splits a `HAS_METADATA` payload into its metadata record and the raw bytes after it.
pub fn split_metadata(payload: &[u8]) -> Result<(TransferMeta, &[u8]), CodecError> {
    if payload.len() < 2 {
        return Err(CodecError::MetadataCorrupt(
            "missing metadata length prefix".to_owned(),
        ));
    }

    let meta_len = usize::from(u16::from_be_bytes([payload[0], payload[1]]));
    let rest = &payload[2..];
    if rest.len() < meta_len {
        return Err(CodecError::MetadataCorrupt(format!(
            "metadata length {meta_len} exceeds {} remaining bytes",
            rest.len()
        )));
    }

    let (meta_json, data) = rest.split_at(meta_len);
    let meta: TransferMeta = serde_json::from_slice(meta_json)
        .map_err(|err| CodecError::MetadataCorrupt(err.to_string()))?;
    Ok((meta, data))
}

/// Encoder/decoder bound to one device identity.
///
/// Message ids come from a monotonically increasing counter that wraps at 32 bits;
/// they only need to tell apart transfers that are in flight at the same time.
#[derive(Debug)]
pub struct FrameCodec {
    device_id: DeviceId,
    message_counter: AtomicU32,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::with_device_id(DeviceId::random())
    }

    #[must_use]
    pub fn with_device_id(device_id: DeviceId) -> Self {
        Self {
            device_id,
            message_counter: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn next_message_id(&self) -> u32 {
        self.message_counter
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1)
    }

    pub fn encode(
        &self,
        kind: MessageType,
        flags: Flags,
        message_id: u32,
        sequence: u32,
        payload: &[u8],
    ) -> Result<Bytes, CodecError> {
        encode_frame(&self.device_id, kind, flags, message_id, sequence, payload)
    }

    /// Decodes a frame, rejecting frames this device sent itself with `Loopback`.
    pub fn decode(&self, data: &[u8]) -> Result<Frame, CodecError> {
        let frame = Frame::parse(data)?;
        if frame.sender == self.device_id {
            return Err(CodecError::Loopback);
        }
        Ok(frame)
    }

    pub fn encode_handshake(&self, device_name: &str, os_name: &str) -> Result<Bytes, CodecError> {
        let payload = serde_json::to_vec(&HandshakeInfo::new(device_name, os_name))
            .map_err(|err| CodecError::Serialization(err.to_string()))?;
        self.encode(
            MessageType::Handshake,
            Flags::NONE,
            self.next_message_id(),
            0,
            &payload,
        )
    }

    pub fn encode_heartbeat(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(HEADER_LEN);
        put_header(
            &mut out,
            PROTOCOL_VERSION,
            MessageType::Heartbeat,
            Flags::NONE,
            self.next_message_id(),
            0,
            &self.device_id,
            0,
        );
        out.freeze()
    }

    pub fn encode_text(&self, text: &str) -> Result<Bytes, CodecError> {
        if text.is_empty() {
            return Err(CodecError::EmptyInput);
        }
        self.encode(
            MessageType::Text,
            Flags::NONE,
            self.next_message_id(),
            0,
            text.as_bytes(),
        )
    }

    pub fn encode_image(
        &self,
        data: &[u8],
        mime: &str,
        max_fragment_payload: usize,
    ) -> Result<Vec<Bytes>, CodecError> {
        let meta = TransferMeta::image(mime, data.len());
        self.encode_transfer(MessageType::Image, &meta, data, max_fragment_payload)
    }

    pub fn encode_image_with_dimensions(
        &self,
        data: &[u8],
        mime: &str,
        (width, height): (u32, u32),
        max_fragment_payload: usize,
    ) -> Result<Vec<Bytes>, CodecError> {
        let meta = TransferMeta {
            width: Some(width),
            height: Some(height),
            ..TransferMeta::image(mime, data.len())
        };
        self.encode_transfer(MessageType::Image, &meta, data, max_fragment_payload)
    }

    pub fn encode_file(
        &self,
        name: &str,
        data: &[u8],
        mime: &str,
        max_fragment_payload: usize,
    ) -> Result<Vec<Bytes>, CodecError> {
        let meta = TransferMeta::file(name, mime, data);
        self.encode_transfer(MessageType::File, &meta, data, max_fragment_payload)
    }

    /// Splits `data` into fragments of at most `budget` payload bytes.
    ///
    /// The first fragment carries the length-prefixed metadata and `HAS_METADATA`;
    /// every fragment but the last carries `MORE_FRAGMENTS`.
    fn encode_transfer(
        &self,
        kind: MessageType,
        meta: &TransferMeta,
        data: &[u8],
        budget: usize,
    ) -> Result<Vec<Bytes>, CodecError> {
        if data.is_empty() {
            return Err(CodecError::EmptyInput);
        }

        let meta_json =
            serde_json::to_vec(meta).map_err(|err| CodecError::Serialization(err.to_string()))?;
        let too_large = || CodecError::MetadataTooLarge {
            meta_len: meta_json.len(),
            budget,
        };
        let meta_len = u16::try_from(meta_json.len()).map_err(|_| too_large())?;
        let prefix_len = 2 + meta_json.len();
        if prefix_len >= budget {
            return Err(too_large());
        }

        let first_capacity = budget - prefix_len;
        let (first, rest) = data.split_at(first_capacity.min(data.len()));
        let message_id = self.next_message_id();

        let mut first_payload = BytesMut::with_capacity(prefix_len + first.len());
        first_payload.put_u16(meta_len);
        first_payload.extend_from_slice(&meta_json);
        first_payload.extend_from_slice(first);

        let mut first_flags = Flags::HAS_METADATA;
        if !rest.is_empty() {
            first_flags |= Flags::MORE_FRAGMENTS;
        }

        let total_rest = rest.len().div_ceil(budget);
        let mut frames = Vec::with_capacity(1 + total_rest);
        frames.push(self.encode(kind, first_flags, message_id, 0, &first_payload)?);

        for (index, chunk) in rest.chunks(budget).enumerate() {
            let sequence = u32::try_from(index + 1).map_err(|_| CodecError::PayloadTooLarge)?;
            let flags = if index + 1 == total_rest {
                Flags::NONE
            } else {
                Flags::MORE_FRAGMENTS
            };
            frames.push(self.encode(kind, flags, message_id, sequence, chunk)?);
        }

        Ok(frames)
    }
}
