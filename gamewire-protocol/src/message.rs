//! Message trait and the inner (handshake/heartbeat) messages.

use crate::error::ProtocolError;
use bytes::{BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric tag at the start of every payload.
pub type MessageId = u16;

/// First identifier reserved for protocol-internal messages.
pub const INNER_ID_BASE: MessageId = 0xFF00;

/// Returns whether `id` belongs to a protocol-internal message.
pub fn is_inner(id: MessageId) -> bool {
    id >= INNER_ID_BASE
}

/// A typed message with a stable identifier.
///
/// The body is encoded with bincode by default; a message may override
/// [`Message::encode_body`] and [`Message::decode_body`] to use its own layout.
/// Decoded messages are built fresh for every inbound frame.
pub trait Message: Serialize + DeserializeOwned + fmt::Debug + Send + 'static {
    /// Stable identifier of this message type.
    const ID: MessageId;

    /// Writes the message body (everything after the identifier).
    fn encode_body(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_slice(&bincode::serialize(self)?);
        Ok(())
    }

    /// Reads the message body.
    fn decode_body(body: &[u8]) -> Result<Self, ProtocolError> {
        bincode::deserialize(body).map_err(|e| ProtocolError::Decode {
            id: Self::ID,
            reason: e.to_string(),
        })
    }
}

/// Server to client: the encrypted challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    pub ciphertext: Vec<u8>,
}

impl Message for Challenge {
    const ID: MessageId = 0xFF01;
}

/// Client to server: the decrypted challenge value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeEcho {
    pub value: u64,
}

impl Message for ChallengeEcho {
    const ID: MessageId = 0xFF02;
}

/// Server to client: the handshake completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationSuccess;

impl Message for ValidationSuccess {
    const ID: MessageId = 0xFF03;
}

/// Client to server keepalive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat;

impl Message for Heartbeat {
    const ID: MessageId = 0xFF04;
}

/// Server to client keepalive reply carrying the server clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatReply {
    pub server_time_millis: i64,
}

impl Message for HeartbeatReply {
    const ID: MessageId = 0xFF05;
}
