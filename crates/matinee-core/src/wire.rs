//! Matinee wire format.
//!
//! One frame on the wire is `[u32 length LE][i32 tag LE][payload]` where
//! `length = 4 + payload.len()`. A frame payload is bounded by the channel's
//! maximum frame size; the channel layer splits anything larger into a
//! `FRAME_SPLIT` control frame plus N part frames. Changing anything in this
//! module is a breaking protocol change.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::packet::Packet;

/// Bytes preceding the payload: u32 length + i32 tag.
pub const FRAME_HEADER: usize = 8;

/// Default ceiling for a single frame's payload.
pub const DEFAULT_MAX_FRAME_PAYLOAD: usize = 64 * 1024;

/// Default session-level split threshold. Application messages above this are
/// fragmented by the session manager, independent of frame-level splitting.
pub const DEFAULT_SPLIT_THRESHOLD: usize = 512 * 1024;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("frame length {len} exceeds maximum {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("frame length {0} is shorter than the tag field")]
    FrameTooShort(u32),

    #[error("truncated control payload for tag {0}")]
    TruncatedControl(i32),
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Append one frame to `out`. The caller is responsible for keeping the
/// payload within the negotiated frame ceiling.
pub fn encode_frame(packet: &Packet, out: &mut BytesMut) {
    out.reserve(FRAME_HEADER + packet.len());
    out.put_u32_le((4 + packet.len()) as u32);
    out.put_i32_le(packet.tag());
    out.put_slice(packet.payload());
}

// ── Incremental decoding ──────────────────────────────────────────────────────

/// Accumulates raw socket bytes and yields complete frames.
///
/// The decoder enforces the frame ceiling: a declared length beyond
/// `max_payload` is a protocol violation, terminal for the connection.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_payload: usize,
}

impl FrameDecoder {
    pub fn new(max_payload: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_payload,
        }
    }

    /// Feed bytes read from the socket.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Packet>, WireError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_le_bytes(self.buf[0..4].try_into().unwrap());
        if len < 4 {
            return Err(WireError::FrameTooShort(len));
        }
        let payload_len = len as usize - 4;
        if payload_len > self.max_payload {
            return Err(WireError::FrameTooLarge {
                len: payload_len,
                max: self.max_payload,
            });
        }
        if self.buf.len() < 4 + len as usize {
            return Ok(None);
        }
        self.buf.advance(4);
        let tag = self.buf.get_i32_le();
        let payload = self.buf.split_to(payload_len).freeze();
        Ok(Some(Packet::new(tag, payload)))
    }
}

// ── Frame-level split control ─────────────────────────────────────────────────

/// Payload of a `FRAME_SPLIT` control frame: the original tag, how many part
/// frames follow, and the total reassembled size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSplit {
    pub tag: i32,
    pub parts: u32,
    pub total: u32,
}

impl FrameSplit {
    pub fn encode(&self) -> Bytes {
        let mut b = BytesMut::with_capacity(12);
        b.put_i32_le(self.tag);
        b.put_u32_le(self.parts);
        b.put_u32_le(self.total);
        b.freeze()
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self, WireError> {
        if payload.len() < 12 {
            return Err(WireError::TruncatedControl(crate::tags::FRAME_SPLIT));
        }
        Ok(Self {
            tag: payload.get_i32_le(),
            parts: payload.get_u32_le(),
            total: payload.get_u32_le(),
        })
    }
}

/// Encode a `MULTI_PACKET` grouping control payload.
pub fn encode_multi(count: u32) -> Bytes {
    Bytes::copy_from_slice(&count.to_le_bytes())
}

pub fn decode_multi(payload: &[u8]) -> Result<u32, WireError> {
    payload
        .get(0..4)
        .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
        .ok_or(WireError::TruncatedControl(crate::tags::MULTI_PACKET))
}

// ── Binary payload helpers ────────────────────────────────────────────────────

/// Encode a `USER_ID` destination-prefix payload: i64 LE per peer id.
pub fn encode_user_ids(ids: &[i64]) -> Bytes {
    let mut b = BytesMut::with_capacity(8 * ids.len());
    for id in ids {
        b.put_i64_le(*id);
    }
    b.freeze()
}

pub fn decode_user_ids(payload: &[u8]) -> Result<Vec<i64>, WireError> {
    if payload.len() % 8 != 0 {
        return Err(WireError::TruncatedControl(crate::tags::USER_ID));
    }
    Ok(payload
        .chunks_exact(8)
        .map(|c| i64::from_le_bytes(c.try_into().unwrap()))
        .collect())
}

/// Encode a `SPLIT_PART` payload: u64 LE split id followed by the chunk.
pub fn encode_split_part(split_id: u64, chunk: &[u8]) -> Bytes {
    let mut b = BytesMut::with_capacity(8 + chunk.len());
    b.put_u64_le(split_id);
    b.put_slice(chunk);
    b.freeze()
}

/// Split a `SPLIT_PART` payload into (split id, chunk bytes).
pub fn decode_split_part(payload: &Bytes) -> Result<(u64, Bytes), WireError> {
    if payload.len() < 8 {
        return Err(WireError::TruncatedControl(crate::tags::SPLIT_PART));
    }
    let split_id = u64::from_le_bytes(payload[0..8].try_into().unwrap());
    Ok((split_id, payload.slice(8..)))
}

/// Encode a bare u64 payload (byte confirmations, probe timestamps, abort ids).
pub fn encode_u64(value: u64) -> Bytes {
    Bytes::copy_from_slice(&value.to_le_bytes())
}

pub fn decode_u64(tag: i32, payload: &[u8]) -> Result<u64, WireError> {
    payload
        .get(0..8)
        .map(|b| u64::from_le_bytes(b.try_into().unwrap()))
        .ok_or(WireError::TruncatedControl(tag))
}
