//! Message registry: identifier to (decoder, handler).
//!
//! Handlers are registered once at startup. The registry is then shared
//! read-only (behind an `Arc`) by every connection.

use crate::codec::RawMessage;
use crate::connection::ConnectionHandle;
use crate::error::{HandlerError, ProtocolError, RegistryError};
use crate::message::{is_inner, Message, MessageId};
use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// Per-delivery context handed to a handler.
pub struct MessageContext {
    connection: ConnectionHandle,
}

impl MessageContext {
    pub fn new(connection: ConnectionHandle) -> Self {
        Self { connection }
    }

    /// The connection the message arrived on.
    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    /// Sends a message back on the originating connection.
    pub fn reply<M: Message>(&self, message: &M) -> Result<(), ProtocolError> {
        self.connection.send(message)
    }
}

type Job = Box<dyn FnOnce(&MessageContext) -> Result<(), HandlerError> + Send>;
type Resolver = Arc<dyn Fn(&[u8]) -> Result<Job, ProtocolError> + Send + Sync>;

struct Entry {
    type_id: TypeId,
    type_name: &'static str,
    resolve: Resolver,
}

/// A decoded message bound to its handler, ready to run.
pub struct Delivery {
    id: MessageId,
    type_name: &'static str,
    job: Job,
}

impl Delivery {
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Rust type name of the decoded message.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn is_inner(&self) -> bool {
        is_inner(self.id)
    }

    /// Runs the handler.
    pub fn handle(self, ctx: &MessageContext) -> Result<(), HandlerError> {
        (self.job)(ctx)
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("id", &format_args!("{:#06x}", self.id))
            .field("type_name", &self.type_name)
            .finish()
    }
}

/// Maps message identifiers to their type and handler.
#[derive(Default)]
pub struct MessageRegistry {
    entries: HashMap<MessageId, Entry>,
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `handler` to message type `M`.
    ///
    /// Registering a second handler for the same type is a no-op and keeps the
    /// first one. Binding `M::ID` when it already belongs to another type
    /// fails with [`RegistryError::DuplicateIdentifier`].
    pub fn register<M, F>(&mut self, handler: F) -> Result<(), RegistryError>
    where
        M: Message,
        F: Fn(M, &MessageContext) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        if let Some(existing) = self.entries.get(&M::ID) {
            if existing.type_id == TypeId::of::<M>() {
                tracing::debug!(
                    "Message {:#06x} ({}) already registered",
                    M::ID,
                    existing.type_name
                );
                return Ok(());
            }
            return Err(RegistryError::DuplicateIdentifier {
                id: M::ID,
                existing: existing.type_name,
                attempted: type_name::<M>(),
            });
        }

        let handler = Arc::new(handler);
        let resolve: Resolver = Arc::new(move |body: &[u8]| {
            let message = M::decode_body(body)?;
            let handler = handler.clone();
            Ok(Box::new(move |ctx: &MessageContext| (*handler)(message, ctx)) as Job)
        });

        self.entries.insert(
            M::ID,
            Entry {
                type_id: TypeId::of::<M>(),
                type_name: type_name::<M>(),
                resolve,
            },
        );
        Ok(())
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered identifiers, sorted.
    pub fn ids(&self) -> Vec<MessageId> {
        let mut ids: Vec<_> = self.entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Decodes a frame into a fresh message bound to its handler.
    ///
    /// Fails with [`ProtocolError::UnknownMessage`] if nothing is registered
    /// for the identifier and [`ProtocolError::Decode`] if the body is
    /// malformed.
    pub fn resolve(&self, frame: &RawMessage) -> Result<Delivery, ProtocolError> {
        let entry = self
            .entries
            .get(&frame.id)
            .ok_or(ProtocolError::UnknownMessage(frame.id))?;
        let job = (entry.resolve)(&frame.body)?;
        Ok(Delivery {
            id: frame.id,
            type_name: entry.type_name,
            job,
        })
    }
}

impl std::fmt::Debug for MessageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRegistry")
            .field("ids", &self.ids())
            .finish()
    }
}
