use thiserror::Error;
use tracing::warn;

use crate::{
    MAX_TRANSFER_BYTES,
    codec::{Frame, MessageType, split_metadata},
    meta::{TransferMeta, sha256_hex},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedTransfer {
    pub kind: MessageType,
    pub message_id: u32,
    pub meta: TransferMeta,
    pub data: Vec<u8>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReassemblyError {
    #[error("{0:?} frames are not reassembled")]
    NotATransfer(MessageType),
    #[error("transfer metadata is corrupt: {0}")]
    MetadataCorrupt(String),
    #[error("continuation fragment {sequence} of message {message_id} has no pending transfer")]
    Orphan { message_id: u32, sequence: u32 },
    #[error("fragment of message {got} does not match pending message {expected}")]
    MessageIdMismatch { expected: u32, got: u32 },
    #[error("message {message_id} skipped from fragment {expected} to {got}")]
    SequenceGap {
        message_id: u32,
        expected: u32,
        got: u32,
    },
    #[error("message {message_id} exceeds the {limit}-byte transfer limit")]
    TooLarge { message_id: u32, limit: usize },
    #[error("message {message_id} declared {declared} bytes but carried {actual}")]
    SizeMismatch {
        message_id: u32,
        declared: u64,
        actual: usize,
    },
    #[error("message {message_id} failed its content hash check")]
    HashMismatch { message_id: u32 },
}

#[derive(Debug)]
struct PendingTransfer {
    message_id: u32,
    kind: MessageType,
    next_sequence: u32,
    buffer: Vec<u8>,
    meta: TransferMeta,
}

/// Accumulates the fragments of one transfer at a time.
///
/// Owned by a single read path; nothing here blocks or locks. Every error leaves the
/// reassembler usable for the next transfer.
#[derive(Debug)]
pub struct Reassembler {
    pending: Option<PendingTransfer>,
    max_transfer_bytes: usize,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembler {
    #[must_use]
    pub fn new() -> Self {
        Self::with_limit(MAX_TRANSFER_BYTES)
    }

    #[must_use]
    pub fn with_limit(max_transfer_bytes: usize) -> Self {
        Self {
            pending: None,
            max_transfer_bytes,
        }
    }

    #[must_use]
    pub fn pending_message_id(&self) -> Option<u32> {
        self.pending.as_ref().map(|pending| pending.message_id)
    }

    pub fn reset(&mut self) {
        self.pending = None;
    }

    pub fn ingest(&mut self, frame: &Frame) -> Result<Option<CompletedTransfer>, ReassemblyError> {
        if !frame.kind.is_transfer() {
            return Err(ReassemblyError::NotATransfer(frame.kind));
        }

        if frame.has_metadata() {
            self.start(frame)?;
        } else {
            self.append(frame)?;
        }

        if frame.more_fragments() {
            return Ok(None);
        }

        match self.pending.take() {
            Some(done) => finish(done).map(Some),
            None => Ok(None),
        }
    }

    fn start(&mut self, frame: &Frame) -> Result<(), ReassemblyError> {
        let (meta, data) = split_metadata(&frame.payload)
            .map_err(|err| ReassemblyError::MetadataCorrupt(err.to_string()))?;

        if let Some(stale) = self.pending.take() {
            warn!(
                stale_message_id = stale.message_id,
                stale_bytes = stale.buffer.len(),
                message_id = frame.message_id,
                "new transfer started before the previous one finished; discarding it"
            );
        }

        if data.len() > self.max_transfer_bytes {
            return Err(ReassemblyError::TooLarge {
                message_id: frame.message_id,
                limit: self.max_transfer_bytes,
            });
        }

        let capacity = meta
            .declared_size()
            .unwrap_or(data.len())
            .min(self.max_transfer_bytes);
        let mut buffer = Vec::with_capacity(capacity);
        buffer.extend_from_slice(data);

        self.pending = Some(PendingTransfer {
            message_id: frame.message_id,
            kind: frame.kind,
            next_sequence: frame.sequence.wrapping_add(1),
            buffer,
            meta,
        });
        Ok(())
    }

    fn append(&mut self, frame: &Frame) -> Result<(), ReassemblyError> {
        let Some(pending) = self.pending.as_mut() else {
            return Err(ReassemblyError::Orphan {
                message_id: frame.message_id,
                sequence: frame.sequence,
            });
        };

        let expected_id = pending.message_id;
        let expected_sequence = pending.next_sequence;
        let overflow = pending.buffer.len() + frame.payload.len() > self.max_transfer_bytes;

        if frame.message_id != expected_id {
            self.pending = None;
            return Err(ReassemblyError::MessageIdMismatch {
                expected: expected_id,
                got: frame.message_id,
            });
        }
        if frame.sequence != expected_sequence {
            self.pending = None;
            return Err(ReassemblyError::SequenceGap {
                message_id: expected_id,
                expected: expected_sequence,
                got: frame.sequence,
            });
        }
        if overflow {
            self.pending = None;
            return Err(ReassemblyError::TooLarge {
                message_id: expected_id,
                limit: self.max_transfer_bytes,
            });
        }

        pending.buffer.extend_from_slice(&frame.payload);
        pending.next_sequence = pending.next_sequence.wrapping_add(1);
        Ok(())
    }
}

fn finish(done: PendingTransfer) -> Result<CompletedTransfer, ReassemblyError> {
    if let Some(declared) = done.meta.size
        && declared != done.buffer.len() as u64
    {
        return Err(ReassemblyError::SizeMismatch {
            message_id: done.message_id,
            declared,
            actual: done.buffer.len(),
        });
    }

    if let Some(expected) = done.meta.hash.as_deref()
        && !expected.eq_ignore_ascii_case(&sha256_hex(&done.buffer))
    {
        return Err(ReassemblyError::HashMismatch {
            message_id: done.message_id,
        });
    }

    Ok(CompletedTransfer {
        kind: done.kind,
        message_id: done.message_id,
        meta: done.meta,
        data: done.buffer,
    })
}
