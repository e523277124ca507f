//! Pub/sub backend seam.
//!
//! The relay only needs three primitives from a backend client: connect with a
//! connection string, subscribe to a channel, and close. Implementations:
//!
//! - [`NatsBackend`] (feature `nats`): a NATS server via `async-nats`
//! - [`MemoryBackend`]: an in-process bus for local runs and tests

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;

use crate::Result;

pub mod memory;
#[cfg(feature = "nats")]
pub mod nats;

pub use memory::MemoryBackend;
#[cfg(feature = "nats")]
pub use nats::NatsBackend;

/// A message received on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Channel the message arrived on.
    pub channel: String,
    /// Opaque payload, forwarded to sessions as-is.
    pub payload: Bytes,
}

impl Message {
    /// Create a message.
    pub fn new(channel: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

/// Stream of messages for one subscription. Ends when the backend goes away.
pub type MessageStream = Pin<Box<dyn Stream<Item = Message> + Send>>;

/// Factory for backend connections.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Human-readable name for logging (e.g. "nats", "memory").
    fn name(&self) -> &'static str;

    /// Open a connection.
    async fn connect(&self, connection_string: &str) -> Result<Arc<dyn Connection>>;
}

/// An open backend connection.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Subscribe to `channel`.
    async fn subscribe(&self, channel: &str) -> Result<MessageStream>;

    /// Flush and close the connection.
    async fn close(&self) -> Result<()>;
}
