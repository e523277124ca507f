//! In-process pub/sub bus.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use super::{Backend, Connection, Message, MessageStream};
use crate::{Error, Result};

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Broadcast bus keyed by channel name.
///
/// Cloning shares the bus, so a test can keep one handle to publish while the
/// relay connects through another.
#[derive(Clone)]
pub struct MemoryBackend {
    channels: Arc<DashMap<String, broadcast::Sender<Message>>>,
    capacity: usize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Set the per-channel buffer. Default: 1024.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Publish `payload` on `channel`, returning how many subscribers saw it.
    pub fn publish(&self, channel: &str, payload: impl Into<Bytes>) -> usize {
        let message = Message::new(channel, payload);
        self.sender(channel).send(message).unwrap_or(0)
    }

    /// Number of live subscriptions on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Message> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self, connection_string: &str) -> Result<Arc<dyn Connection>> {
        debug!(connection_string, "memory backend connected");
        Ok(Arc::new(MemoryConnection {
            bus: self.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryConnection {
    bus: MemoryBackend,
    closed: AtomicBool,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn subscribe(&self, channel: &str) -> Result<MessageStream> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::subscribe(channel, "connection closed"));
        }
        let rx = self.bus.sender(channel).subscribe();
        let channel = channel.to_string();
        let stream = BroadcastStream::new(rx)
            .filter_map(move |msg| {
                let channel = channel.clone();
                async move {
                    match msg {
                        Ok(msg) => Some(msg),
                        Err(e) => {
                            warn!(%channel, error = %e, "memory subscription lagged");
                            None
                        }
                    }
                }
            })
            .boxed();
        Ok(stream)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_messages_in_order() {
        let bus = MemoryBackend::new();
        let conn = bus.connect("memory://").await.unwrap();
        let mut stream = conn.subscribe("updates").await.unwrap();

        assert_eq!(bus.publish("updates", "a"), 1);
        assert_eq!(bus.publish("updates", "b"), 1);
        assert_eq!(bus.publish("other", "c"), 0);

        assert_eq!(stream.next().await.unwrap().payload, Bytes::from("a"));
        assert_eq!(stream.next().await.unwrap().payload, Bytes::from("b"));
    }

    #[tokio::test]
    async fn closed_connection_rejects_subscribe() {
        let bus = MemoryBackend::new();
        let conn = bus.connect("memory://").await.unwrap();
        conn.close().await.unwrap();
        assert!(matches!(
            conn.subscribe("updates").await,
            Err(Error::Subscribe { .. })
        ));
    }
}
