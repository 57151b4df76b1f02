//! Length-prefixed framing.
//!
//! A frame is a length field (optionally preceded by a fixed prefix) followed
//! by the payload. The layout is described by [`FrameParams`]:
//!
//! ```text
//! +----------------------+--------------+-------------------------------+
//! | prefix               | length field | payload                       |
//! | length_field_offset  | field_length | value + length_adjustment     |
//! +----------------------+--------------+-------------------------------+
//! |<-- initial_bytes_to_strip -->|  (removed from decoded frames)
//! ```
//!
//! With the defaults (offset 0, 4-byte field, adjustment 0, strip 4) a frame
//! is a big-endian `u32` payload length followed by the payload.

use crate::error::ProtocolError;
use crate::DEFAULT_MAX_FRAME_LENGTH;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Frame layout parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameParams {
    /// Largest accepted frame, header included.
    pub max_frame_length: usize,
    /// Bytes before the length field.
    pub length_field_offset: usize,
    /// Width of the length field: 1, 2, 3, 4 or 8 bytes.
    pub length_field_length: usize,
    /// Added to the length field value to get the number of bytes after the field.
    pub length_adjustment: i64,
    /// Bytes removed from the front of every decoded frame.
    pub initial_bytes_to_strip: usize,
}

impl Default for FrameParams {
    fn default() -> Self {
        Self {
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            length_field_offset: 0,
            length_field_length: 4,
            length_adjustment: 0,
            initial_bytes_to_strip: 4,
        }
    }
}

impl FrameParams {
    /// Offset of the first byte after the length field.
    pub fn header_len(&self) -> usize {
        self.length_field_offset + self.length_field_length
    }

    /// Header bytes still present at the front of a decoded frame.
    pub fn residual_header(&self) -> usize {
        self.header_len().saturating_sub(self.initial_bytes_to_strip)
    }

    /// Checks that the parameters describe a usable layout.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if !matches!(self.length_field_length, 1 | 2 | 3 | 4 | 8) {
            return Err(ProtocolError::InvalidFrameParams(format!(
                "length_field_length must be 1, 2, 3, 4 or 8, got {}",
                self.length_field_length
            )));
        }
        if self.max_frame_length <= self.header_len() {
            return Err(ProtocolError::InvalidFrameParams(format!(
                "max_frame_length {} does not leave room for a {}-byte header",
                self.max_frame_length,
                self.header_len()
            )));
        }
        if self.initial_bytes_to_strip > self.header_len() {
            return Err(ProtocolError::InvalidFrameParams(format!(
                "initial_bytes_to_strip {} exceeds header length {}",
                self.initial_bytes_to_strip,
                self.header_len()
            )));
        }
        Ok(())
    }

    /// Largest value the length field can carry.
    fn max_field_value(&self) -> u64 {
        if self.length_field_length == 8 {
            u64::MAX
        } else {
            (1u64 << (self.length_field_length * 8)) - 1
        }
    }

    /// Encodes `payload` into a complete frame.
    pub fn encode(&self, payload: &[u8]) -> Result<BytesMut, ProtocolError> {
        let total = self.header_len() + payload.len();
        if total > self.max_frame_length {
            return Err(ProtocolError::FrameTooLarge {
                size: total,
                max: self.max_frame_length,
            });
        }

        let value = (payload.len() as i64)
            .checked_sub(self.length_adjustment)
            .ok_or(ProtocolError::InvalidLength(i64::MAX))?;
        if value < 0 || value as u64 > self.max_field_value() {
            return Err(ProtocolError::InvalidLength(value));
        }

        let mut buf = BytesMut::with_capacity(total);
        buf.put_bytes(0, self.length_field_offset);
        match self.length_field_length {
            1 => buf.put_u8(value as u8),
            2 => buf.put_u16(value as u16),
            3 => {
                buf.put_u8((value >> 16) as u8);
                buf.put_u16(value as u16);
            }
            4 => buf.put_u32(value as u32),
            _ => buf.put_u64(value as u64),
        }
        buf.put_slice(payload);
        Ok(buf)
    }

    /// Decodes one frame from the front of `buf`.
    ///
    /// Returns `Ok(Some(frame))` with the stripped frame, `Ok(None)` if more
    /// data is needed, or `Err` if the length field is unusable.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
        let header_len = self.header_len();
        if buf.len() < header_len {
            return Ok(None);
        }

        let field = &buf[self.length_field_offset..header_len];
        let value = field.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64);
        if value > i64::MAX as u64 {
            return Err(ProtocolError::InvalidLength(i64::MAX));
        }

        let frame_len = (value as i64)
            .checked_add(self.length_adjustment)
            .and_then(|v| v.checked_add(header_len as i64))
            .ok_or(ProtocolError::InvalidLength(i64::MAX))?;
        if frame_len < header_len as i64 {
            return Err(ProtocolError::InvalidLength(frame_len));
        }
        let frame_len = frame_len as usize;
        if frame_len > self.max_frame_length {
            return Err(ProtocolError::FrameTooLarge {
                size: frame_len,
                max: self.max_frame_length,
            });
        }

        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        let mut frame = buf.split_to(frame_len);
        frame.advance(self.initial_bytes_to_strip);
        Ok(Some(frame.freeze()))
    }
}
