//! Entry point for the real-time transport layer.
//!
//! ```no_run
//! use cluster_relay::{backend::MemoryBackend, hub::RelayHub, relay::RelayConfig};
//!
//! # async fn run() {
//! let hub = RelayHub::builder(MemoryBackend::new(), "memory://")
//!     .config(RelayConfig::new("updates"))
//!     .build();
//!
//! // one per accepted client connection
//! let mut session = hub.connect().await;
//! while let Some(payload) = session.recv().await {
//!     // write payload to the client
//! #   let _ = payload;
//! }
//! hub.shutdown().await.ok();
//! # }
//! ```

use std::sync::Arc;

use bytes::Bytes;
use tracing::warn;

use crate::backend::Backend;
use crate::bootstrap::{ConnectionBootstrap, ConnectionState};
use crate::relay::RelayConfig;
use crate::session::{SessionId, SessionOutbox, SessionRegistry};
use crate::Result;

/// Builder for [`RelayHub`].
pub struct RelayHubBuilder {
    backend: Arc<dyn Backend>,
    connection_string: String,
    config: RelayConfig,
    registry: SessionRegistry,
}

impl RelayHubBuilder {
    /// Set the relay configuration.
    pub fn config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    /// Use an existing session registry.
    pub fn registry(mut self, registry: SessionRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Build the hub. Nothing connects until the first session arrives.
    pub fn build(self) -> RelayHub {
        let session_buffer = self.config.session_buffer;
        let bootstrap = ConnectionBootstrap::from_arc(
            self.backend,
            self.connection_string,
            self.config,
            self.registry.clone(),
        );
        RelayHub {
            bootstrap,
            registry: self.registry,
            session_buffer,
        }
    }
}

/// Hands out sessions and owns the shared relay connection.
#[derive(Clone)]
pub struct RelayHub {
    bootstrap: ConnectionBootstrap,
    registry: SessionRegistry,
    session_buffer: usize,
}

impl RelayHub {
    /// Start building a hub over `backend`.
    pub fn builder<B: Backend>(backend: B, connection_string: impl Into<String>) -> RelayHubBuilder {
        RelayHubBuilder {
            backend: Arc::new(backend),
            connection_string: connection_string.into(),
            config: RelayConfig::default(),
            registry: SessionRegistry::new(),
        }
    }

    /// Register a client session and make sure the relay is running.
    ///
    /// A backend that cannot be reached does not fail the session: it just
    /// receives no live updates until a later connect succeeds.
    ///
    /// The session is unregistered again if this future is dropped before
    /// it completes.
    pub async fn connect(&self) -> Session {
        let session = Session {
            outbox: self.registry.register(self.session_buffer),
            registry: self.registry.clone(),
        };
        if let Err(e) = self.bootstrap.ensure_started().await {
            warn!(session = %session.id(), error = %e, "live updates unavailable for session");
        }
        session
    }

    /// The underlying bootstrap.
    pub fn bootstrap(&self) -> &ConnectionBootstrap {
        &self.bootstrap
    }

    /// Current relay connection state.
    pub fn state(&self) -> ConnectionState {
        self.bootstrap.state()
    }

    /// Number of connected sessions.
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Stop relaying and close the backend connection.
    ///
    /// Every session is unregistered, so pending [`Session::recv`] calls
    /// return `None` once their buffered payloads are drained.
    pub async fn shutdown(&self) -> Result<()> {
        let closed = self.bootstrap.close().await;
        self.registry.clear();
        closed
    }
}

/// A connected client. Dropping it unregisters the session.
pub struct Session {
    outbox: SessionOutbox,
    registry: SessionRegistry,
}

impl Session {
    /// Session id.
    pub fn id(&self) -> SessionId {
        self.outbox.id()
    }

    /// Next relayed payload; `None` after [`RelayHub::shutdown`].
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.outbox.recv().await
    }

    /// Next payload if one is already buffered.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.outbox.try_recv()
    }

    /// Messages dropped because this session fell behind.
    pub fn dropped(&self) -> u64 {
        self.outbox.dropped()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.registry.remove(self.outbox.id());
    }
}
