//! Framing for sync messages on a byte stream.
//!
//! Each frame is a one-byte [`MessageType`] tag, a big-endian `u32` payload
//! length, and a JSON payload. Frames follow each other with no delimiter.

use crate::error::{SyncError, SyncResult};
use crate::protocol::{MessageType, SyncMessage, WireMessage};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Maximum payload size (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 5;

/// Stateless codec for [`SyncMessage`] frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncCodec;

impl SyncCodec {
    /// Appends one frame to `dst`.
    pub fn encode_message<M: WireMessage>(&mut self, message: &M, dst: &mut BytesMut) -> SyncResult<()> {
        let payload = serde_json::to_vec(message)?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(SyncError::Protocol(format!(
                "message too large: {} bytes",
                payload.len()
            )));
        }
        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u8(M::TYPE.tag());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }

    /// Appends one frame per message to `dst` and returns how many were
    /// encoded.
    pub fn encode_batch<M: WireMessage>(&mut self, messages: &[M], dst: &mut BytesMut) -> SyncResult<usize> {
        for message in messages {
            self.encode_message(message, dst)?;
        }
        Ok(messages.len())
    }
}

impl Decoder for SyncCodec {
    type Item = SyncMessage;
    type Error = SyncError;

    fn decode(&mut self, src: &mut BytesMut) -> SyncResult<Option<SyncMessage>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let tag = src[0];
        let kind = MessageType::from_tag(tag)
            .ok_or_else(|| SyncError::Protocol(format!("unknown message type: {tag}")))?;
        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(SyncError::Protocol(format!("message too large: {len} bytes")));
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len);
        let message = match kind {
            MessageType::Hello => SyncMessage::Hello(serde_json::from_slice(&payload)?),
            MessageType::Setup => SyncMessage::Setup(serde_json::from_slice(&payload)?),
            MessageType::Update => SyncMessage::Update(serde_json::from_slice(&payload)?),
            MessageType::Checkpoint => SyncMessage::Checkpoint(serde_json::from_slice(&payload)?),
        };
        Ok(Some(message))
    }
}

impl Encoder<SyncMessage> for SyncCodec {
    type Error = SyncError;

    fn encode(&mut self, item: SyncMessage, dst: &mut BytesMut) -> SyncResult<()> {
        match item {
            SyncMessage::Hello(m) => self.encode_message(&m, dst),
            SyncMessage::Setup(m) => self.encode_message(&m, dst),
            SyncMessage::Update(m) => self.encode_message(&m, dst),
            SyncMessage::Checkpoint(m) => self.encode_message(&m, dst),
        }
    }
}
