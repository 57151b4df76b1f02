//! # gamewire-protocol
//!
//! Wire protocol and connection engine for gamewire.
//!
//! This crate provides:
//! - Configurable length-prefixed framing
//! - The `Message` trait and the inner handshake/heartbeat messages
//! - A message registry mapping identifiers to handlers
//! - The handshake challenge cipher
//! - A connection handle and the per-connection read/dispatch loop

pub mod address;
pub mod cipher;
pub mod codec;
pub mod connection;
pub mod error;
pub mod frame;
pub mod message;
pub mod registry;

pub use address::AddressPair;
pub use cipher::ChallengeCipher;
pub use codec::{Decoder, Encoder, RawMessage};
pub use connection::{Connection, ConnectionHandle, ConnectionState, FrameHandler};
pub use error::{HandlerError, ProtocolError, RegistryError};
pub use frame::FrameParams;
pub use message::{
    is_inner, Challenge, ChallengeEcho, Heartbeat, HeartbeatReply, Message, MessageId,
    ValidationSuccess, INNER_ID_BASE,
};
pub use registry::{Delivery, MessageContext, MessageRegistry};

/// Maximum frame length, header included (1 MiB).
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 1024 * 1024;
