//! Binary control frames exchanged between operators and crane agents.
//!
//! Layout (40 bytes, big-endian, purely positional):
//!
//! ```text
//! u8 user_id | i64 timestamp | u8 command_type | i16 x3 | f64 x3
//! ```
//!
//! Frames travelling operator -> agent carry one extra leading [`BINARY_FLAG`]
//! byte added by the relay. Only the agent strips it.

use bytes::{Buf, BufMut, BytesMut};

/// Marker the relay prepends to operator binary payloads.
pub const BINARY_FLAG: u8 = 0x04;

/// Size of an unflagged control frame.
pub const FRAME_LEN: usize = 1 + 8 + 1 + 2 * 3 + 8 * 3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlFrame {
    pub user_id: u8,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub command_type: u8,
    pub ints: [i16; 3],
    pub values: [f64; 3],
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("control frame truncated: got {0} of {} bytes", FRAME_LEN)]
    Truncated(usize),
    #[error("control frame carries {0} trailing bytes")]
    Trailing(usize),
    #[error("expected flag byte 0x04, found {0:#04x}")]
    MissingFlag(u8),
}

impl ControlFrame {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FRAME_LEN);
        buf.put_u8(self.user_id);
        buf.put_i64(self.timestamp);
        buf.put_u8(self.command_type);
        for v in self.ints {
            buf.put_i16(v);
        }
        for v in self.values {
            buf.put_f64(v);
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < FRAME_LEN {
            return Err(FrameError::Truncated(bytes.len()));
        }
        if bytes.len() > FRAME_LEN {
            return Err(FrameError::Trailing(bytes.len() - FRAME_LEN));
        }
        let mut buf = bytes;
        let user_id = buf.get_u8();
        let timestamp = buf.get_i64();
        let command_type = buf.get_u8();
        let ints = [buf.get_i16(), buf.get_i16(), buf.get_i16()];
        let values = [buf.get_f64(), buf.get_f64(), buf.get_f64()];
        Ok(Self {
            user_id,
            timestamp,
            command_type,
            ints,
            values,
        })
    }

    /// Decode a frame as an agent receives it, flag byte first.
    pub fn decode_flagged(bytes: &[u8]) -> Result<Self, FrameError> {
        match bytes.split_first() {
            Some((&BINARY_FLAG, rest)) => Self::decode(rest),
            Some((&other, _)) => Err(FrameError::MissingFlag(other)),
            None => Err(FrameError::Truncated(0)),
        }
    }
}

/// Prefix an opaque operator payload with [`BINARY_FLAG`].
pub fn with_flag(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 1);
    out.push(BINARY_FLAG);
    out.extend_from_slice(payload);
    out
}
