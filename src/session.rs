//! Connected sessions and their outbound buffers.
//!
//! Each session owns a bounded ring: the relay side ([`SessionSink`]) never
//! waits, and once a session falls `capacity` messages behind, its oldest
//! undelivered messages are overwritten. The receiving side
//! ([`SessionOutbox`]) counts what was lost.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

/// Identifier assigned to a session on registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Raw numeric id.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Result of enqueueing one payload for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Payload is buffered for the session.
    Queued,
    /// The session's receiving side is gone; nothing was enqueued.
    Gone,
}

/// Sending half of a session buffer. Cheap to clone.
#[derive(Clone)]
pub struct SessionSink {
    id: SessionId,
    tx: broadcast::Sender<Bytes>,
}

impl SessionSink {
    /// Session this sink feeds.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Enqueue `payload` without waiting.
    pub fn send(&self, payload: Bytes) -> Delivery {
        match self.tx.send(payload) {
            Ok(_) => Delivery::Queued,
            Err(_) => Delivery::Gone,
        }
    }
}

impl fmt::Debug for SessionSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSink").field("id", &self.id).finish()
    }
}

/// Receiving half of a session buffer.
pub struct SessionOutbox {
    id: SessionId,
    rx: broadcast::Receiver<Bytes>,
    dropped: u64,
}

impl SessionOutbox {
    /// Session this outbox drains.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Next payload, or `None` once the sink side is gone.
    ///
    /// Messages overwritten while this session lagged are skipped and added
    /// to [`dropped`](Self::dropped).
    pub async fn recv(&mut self) -> Option<Bytes> {
        loop {
            match self.rx.recv().await {
                Ok(payload) => return Some(payload),
                Err(RecvError::Lagged(n)) => {
                    self.dropped += n;
                    warn!(session = %self.id, skipped = n, "session lagged, oldest messages dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Bytes> {
        use broadcast::error::TryRecvError;
        loop {
            match self.rx.try_recv() {
                Ok(payload) => return Some(payload),
                Err(TryRecvError::Lagged(n)) => self.dropped += n,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Total messages dropped for this session so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Concurrent map of connected sessions.
///
/// Mutated only by the transport side ([`register`](Self::register) /
/// [`remove`](Self::remove)); the relay reads [`snapshot`](Self::snapshot).
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<SessionId, SessionSink>>,
    next_id: Arc<AtomicU64>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session whose buffer holds `capacity` messages.
    pub fn register(&self, capacity: usize) -> SessionOutbox {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = broadcast::channel(capacity.max(1));
        self.sessions.insert(id, SessionSink { id, tx });
        debug!(session = %id, capacity, "session registered");
        SessionOutbox { id, rx, dropped: 0 }
    }

    /// Remove a session. Removing an unknown id is a no-op.
    pub fn remove(&self, id: SessionId) -> bool {
        let removed = self.sessions.remove(&id).is_some();
        if removed {
            debug!(session = %id, "session removed");
        }
        removed
    }

    /// Copy of the current sinks.
    pub fn snapshot(&self) -> Vec<SessionSink> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Unregister every session. Their outboxes close once drained.
    pub fn clear(&self) {
        let count = self.sessions.len();
        self.sessions.clear();
        debug!(count, "all sessions removed");
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is registered.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
