//! Encoder and decoder for framed messages.
//!
//! Payload layout: a big-endian `u16` message identifier followed by the
//! message body.

use crate::error::ProtocolError;
use crate::frame::FrameParams;
use crate::message::{Message, MessageId};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the identifier at the start of every payload.
pub const MESSAGE_ID_SIZE: usize = 2;

/// A decoded frame: identifier plus undecoded body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub id: MessageId,
    pub body: Bytes,
}

impl RawMessage {
    /// Decodes the body as `M`, checking that the identifier matches.
    pub fn decode<M: Message>(&self) -> Result<M, ProtocolError> {
        if self.id != M::ID {
            return Err(ProtocolError::Decode {
                id: self.id,
                reason: format!("expected message {:#06x}", M::ID),
            });
        }
        M::decode_body(&self.body)
    }
}

/// Encodes messages into frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct Encoder {
    params: FrameParams,
}

impl Encoder {
    pub fn new(params: FrameParams) -> Self {
        Self { params }
    }

    /// Encodes a message into a complete frame.
    pub fn encode<M: Message>(&self, message: &M) -> Result<BytesMut, ProtocolError> {
        let mut payload = BytesMut::with_capacity(64);
        payload.put_u16(M::ID);
        message.encode_body(&mut payload)?;
        self.params.encode(&payload)
    }

    pub fn params(&self) -> &FrameParams {
        &self.params
    }
}

/// Accumulates bytes from the wire and splits them into messages.
pub struct Decoder {
    params: FrameParams,
    buffer: BytesMut,
}

impl Decoder {
    pub fn new(params: FrameParams) -> Self {
        Self {
            params,
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next message from the buffer.
    pub fn decode_frame(&mut self) -> Result<Option<RawMessage>, ProtocolError> {
        let mut frame = match self.params.decode(&mut self.buffer)? {
            Some(frame) => frame,
            None => return Ok(None),
        };

        let skip = self.params.residual_header();
        let needed = skip + MESSAGE_ID_SIZE;
        if frame.len() < needed {
            return Err(ProtocolError::Truncated {
                needed,
                available: frame.len(),
            });
        }
        frame.advance(skip);
        let id = frame.get_u16();

        Ok(Some(RawMessage { id, body: frame }))
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(FrameParams::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Challenge, ChallengeEcho, HeartbeatReply, ValidationSuccess};
    use proptest::prelude::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct PlayerMove {
        player: u64,
        x: f32,
        y: f32,
        tag: String,
        path: Vec<(i32, i32)>,
    }

    impl Message for PlayerMove {
        const ID: MessageId = 0x0101;
    }

    /// Hand-written layout instead of bincode.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct RawScore {
        score: u32,
    }

    impl Message for RawScore {
        const ID: MessageId = 0x0102;

        fn encode_body(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
            buf.put_u32_le(self.score);
            Ok(())
        }

        fn decode_body(body: &[u8]) -> Result<Self, ProtocolError> {
            let bytes: [u8; 4] = body.try_into().map_err(|_| ProtocolError::Truncated {
                needed: 4,
                available: body.len(),
            })?;
            Ok(Self {
                score: u32::from_le_bytes(bytes),
            })
        }
    }

    #[test]
    fn test_encoder_decoder_roundtrip() {
        let encoder = Encoder::default();
        let msg = ChallengeEcho { value: 42 };
        let encoded = encoder.encode(&msg).unwrap();

        let mut decoder = Decoder::default();
        decoder.extend(&encoded);
        let raw = decoder.decode_frame().unwrap().unwrap();
        assert_eq!(raw.id, ChallengeEcho::ID);
        assert_eq!(raw.decode::<ChallengeEcho>().unwrap(), msg);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_custom_body_layout() {
        let encoder = Encoder::default();
        let encoded = encoder.encode(&RawScore { score: 7 }).unwrap();
        // 4 length + 2 id + 4 body
        assert_eq!(encoded.len(), 10);
        assert_eq!(&encoded[6..], &[7, 0, 0, 0]);

        let mut decoder = Decoder::default();
        decoder.extend(&encoded);
        let raw = decoder.decode_frame().unwrap().unwrap();
        assert_eq!(raw.decode::<RawScore>().unwrap().score, 7);
    }

    #[test]
    fn test_partial_frame_decoding() {
        let encoded = Encoder::default()
            .encode(&Challenge {
                ciphertext: vec![1, 2, 3, 4, 5],
            })
            .unwrap();

        let mut decoder = Decoder::default();
        decoder.extend(&encoded[..5]);
        assert!(decoder.decode_frame().unwrap().is_none());

        decoder.extend(&encoded[5..]);
        let raw = decoder.decode_frame().unwrap().unwrap();
        assert_eq!(raw.decode::<Challenge>().unwrap().ciphertext, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_payload_without_identifier() {
        let params = FrameParams::default();
        let mut decoder = Decoder::new(params);
        decoder.extend(&params.encode(&[0x01]).unwrap());
        assert!(matches!(
            decoder.decode_frame(),
            Err(ProtocolError::Truncated {
                needed: 2,
                available: 1
            })
        ));
    }

    #[test]
    fn test_wrong_type_decode() {
        let encoded = Encoder::default().encode(&ValidationSuccess).unwrap();
        let mut decoder = Decoder::default();
        decoder.extend(&encoded);
        let raw = decoder.decode_frame().unwrap().unwrap();
        assert!(raw.decode::<HeartbeatReply>().is_err());
    }

    #[test]
    fn test_residual_header_is_skipped() {
        let params = FrameParams {
            length_field_offset: 2,
            length_field_length: 2,
            initial_bytes_to_strip: 0,
            ..Default::default()
        };
        let encoded = Encoder::new(params)
            .encode(&ChallengeEcho { value: 9 })
            .unwrap();

        let mut decoder = Decoder::new(params);
        decoder.extend(&encoded);
        let raw = decoder.decode_frame().unwrap().unwrap();
        assert_eq!(raw.decode::<ChallengeEcho>().unwrap().value, 9);
    }

    #[test]
    fn test_decoder_clear() {
        let mut decoder = Decoder::default();
        decoder.extend(b"junk");
        assert_eq!(decoder.buffered(), 4);
        decoder.clear();
        assert_eq!(decoder.buffered(), 0);
    }

    proptest! {
        #[test]
        fn prop_message_roundtrip(
            player in any::<u64>(),
            x in -1.0e6f32..1.0e6,
            y in -1.0e6f32..1.0e6,
            tag in ".{0,24}",
            path in proptest::collection::vec((any::<i32>(), any::<i32>()), 0..16),
        ) {
            let msg = PlayerMove { player, x, y, tag, path };
            let encoded = Encoder::default().encode(&msg).unwrap();

            let mut decoder = Decoder::default();
            decoder.extend(&encoded);
            let raw = decoder.decode_frame().unwrap().unwrap();
            prop_assert_eq!(raw.id, PlayerMove::ID);
            prop_assert_eq!(raw.decode::<PlayerMove>().unwrap(), msg);
        }
    }
}
