//! Single-start connection to the pub/sub backend.
//!
//! The first caller of [`ConnectionBootstrap::ensure_started`] spawns one
//! connect+subscribe attempt and records it as a shared future; every caller
//! that arrives while the attempt is in flight awaits the same future. The
//! state lock is only held to inspect or replace that record, never across
//! the connect itself.
//!
//! ```text
//! Unstarted ──► Starting ──► Ready
//!                  │  ▲
//!                  ▼  │ (next caller retries)
//!                 Failed
//! ```
//!
//! A failed attempt is not cached: the next caller starts a fresh one.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use crate::backend::{Backend, Connection, MessageStream};
use crate::relay::{FanoutRelay, RelayConfig};
use crate::session::SessionRegistry;
use crate::{Error, Result};

/// Observable lifecycle of the shared connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Nobody asked for the connection yet.
    Unstarted,
    /// A connect+subscribe attempt is in flight.
    Starting,
    /// Connected and subscribed; the relay is running.
    Ready,
    /// The last attempt failed; the next caller retries.
    Failed,
    /// Shut down with [`ConnectionBootstrap::close`].
    Closed,
}

/// The established connection and its relay subscription.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    connection: Arc<dyn Connection>,
    channel: String,
    attempt: u64,
}

impl ConnectionHandle {
    /// Channel the relay is subscribed to.
    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    /// Which start attempt produced this connection (1-based).
    pub fn attempt(&self) -> u64 {
        self.inner.attempt
    }

    /// The underlying backend connection.
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.inner.connection
    }

    /// Whether two handles refer to the same connection.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("channel", &self.inner.channel)
            .field("attempt", &self.inner.attempt)
            .finish()
    }
}

type StartResult = std::result::Result<ConnectionHandle, Arc<Error>>;
type StartFuture = Shared<BoxFuture<'static, StartResult>>;

enum State {
    Unstarted,
    Starting { attempt: u64, fut: StartFuture },
    Ready(ConnectionHandle),
    Failed(Arc<Error>),
    Closed,
}

impl State {
    fn public(&self) -> ConnectionState {
        match self {
            State::Unstarted => ConnectionState::Unstarted,
            State::Starting { .. } => ConnectionState::Starting,
            State::Ready(_) => ConnectionState::Ready,
            State::Failed(_) => ConnectionState::Failed,
            State::Closed => ConnectionState::Closed,
        }
    }
}

struct Inner {
    backend: Arc<dyn Backend>,
    connection_string: String,
    config: RelayConfig,
    relay: FanoutRelay,
    state: Mutex<State>,
    attempts: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// Lazily creates the one backend connection and relay subscription.
#[derive(Clone)]
pub struct ConnectionBootstrap {
    inner: Arc<Inner>,
}

impl ConnectionBootstrap {
    /// Create a bootstrap that relays `config.channel` into `registry`.
    ///
    /// Nothing is connected until the first [`ensure_started`](Self::ensure_started).
    pub fn new<B: Backend>(
        backend: B,
        connection_string: impl Into<String>,
        config: RelayConfig,
        registry: SessionRegistry,
    ) -> Self {
        Self::from_arc(Arc::new(backend), connection_string, config, registry)
    }

    /// Like [`new`](Self::new) for an already shared backend.
    pub fn from_arc(
        backend: Arc<dyn Backend>,
        connection_string: impl Into<String>,
        config: RelayConfig,
        registry: SessionRegistry,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(Inner {
                backend,
                connection_string: connection_string.into(),
                config,
                relay: FanoutRelay::new(registry),
                state: Mutex::new(State::Unstarted),
                attempts: AtomicU64::new(0),
                shutdown_tx,
                pump: Mutex::new(None),
            }),
        }
    }

    /// Return the shared connection, starting it if nobody has yet.
    ///
    /// Concurrent callers share one attempt and observe the same outcome.
    /// A failure is returned as [`Error::StartFailed`] carrying the same
    /// cause for every waiter.
    pub async fn ensure_started(&self) -> Result<ConnectionHandle> {
        let fut = {
            let mut state = self.inner.lock_state();
            match &*state {
                State::Ready(handle) => return Ok(handle.clone()),
                State::Closed => return Err(Error::Closed),
                State::Starting { fut, .. } => fut.clone(),
                State::Unstarted | State::Failed(_) => {
                    let (attempt, fut) = Inner::begin(&self.inner);
                    *state = State::Starting {
                        attempt,
                        fut: fut.clone(),
                    };
                    fut
                }
            }
        };
        fut.await.map_err(Error::StartFailed)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.lock_state().public()
    }

    /// Number of connect attempts issued so far.
    pub fn attempts(&self) -> u64 {
        self.inner.attempts.load(Ordering::Relaxed)
    }

    /// Cause of the last failed attempt, while in [`ConnectionState::Failed`].
    pub fn last_error(&self) -> Option<Arc<Error>> {
        match &*self.inner.lock_state() {
            State::Failed(e) => Some(Arc::clone(e)),
            _ => None,
        }
    }

    /// The fanout relay fed by this connection.
    pub fn relay(&self) -> &FanoutRelay {
        &self.inner.relay
    }

    /// Stop the relay and close the connection. Later starts fail with
    /// [`Error::Closed`].
    pub async fn close(&self) -> Result<()> {
        let previous = {
            let mut state = self.inner.lock_state();
            std::mem::replace(&mut *state, State::Closed)
        };
        let _ = self.inner.shutdown_tx.send(());

        let pump = self
            .inner
            .pump
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(pump) = pump {
            if let Err(e) = pump.await {
                warn!("relay pump task failed: {e}");
            }
        }

        if let State::Ready(handle) = previous {
            info!(channel = handle.channel(), "closing relay connection");
            handle.connection().close().await?;
        }
        Ok(())
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn one attempt. Called with the state lock held; does not block.
    fn begin(this: &Arc<Self>) -> (u64, StartFuture) {
        let attempt = this.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        let span = tracing::debug_span!(
            "relay_start",
            attempt,
            backend = this.backend.name(),
            channel = %this.config.channel
        );
        let task = tokio::spawn(Arc::clone(this).start(attempt).instrument(span));

        let weak: Weak<Self> = Arc::downgrade(this);
        let fut = async move {
            match task.await {
                Ok(res) => res,
                Err(e) => {
                    warn!(attempt, "relay start task ended abnormally: {e}");
                    let err = Arc::new(Error::StartAborted);
                    if let Some(inner) = weak.upgrade() {
                        inner.settle(attempt, State::Failed(Arc::clone(&err)));
                    }
                    Err(err)
                }
            }
        }
        .boxed()
        .shared();
        (attempt, fut)
    }

    async fn start(self: Arc<Self>, attempt: u64) -> StartResult {
        debug!("starting relay connection");
        match self.connect_and_subscribe(attempt).await {
            Ok((handle, stream)) => {
                let accepted = {
                    let mut state = self.lock_state();
                    if matches!(*state, State::Closed) {
                        false
                    } else {
                        let shutdown = self.shutdown_tx.subscribe();
                        let pump = tokio::spawn(self.relay.clone().pump(
                            self.config.channel.clone(),
                            stream,
                            shutdown,
                        ));
                        *self.pump.lock().unwrap_or_else(|e| e.into_inner()) = Some(pump);
                        *state = State::Ready(handle.clone());
                        true
                    }
                };
                if !accepted {
                    debug!("closed while starting, discarding connection");
                    let _ = handle.connection().close().await;
                    return Err(Arc::new(Error::Closed));
                }
                info!(channel = handle.channel(), "relay connection ready");
                Ok(handle)
            }
            Err(e) => {
                warn!(error = %e, "relay start failed");
                let err = Arc::new(e);
                self.settle(attempt, State::Failed(Arc::clone(&err)));
                Err(err)
            }
        }
    }

    async fn connect_and_subscribe(
        &self,
        attempt: u64,
    ) -> Result<(ConnectionHandle, MessageStream)> {
        let connection = self.backend.connect(&self.connection_string).await?;
        let stream = match connection.subscribe(&self.config.channel).await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = connection.close().await;
                return Err(e);
            }
        };
        let handle = ConnectionHandle {
            inner: Arc::new(HandleInner {
                connection,
                channel: self.config.channel.clone(),
                attempt,
            }),
        };
        Ok((handle, stream))
    }

    /// Leave `Starting` for `next`, unless a different attempt or a close
    /// has replaced it meanwhile.
    fn settle(&self, attempt: u64, next: State) {
        let mut state = self.lock_state();
        if matches!(&*state, State::Starting { attempt: current, .. } if *current == attempt) {
            *state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    #[tokio::test]
    async fn starts_lazily_and_reuses_the_connection() {
        let bootstrap = ConnectionBootstrap::new(
            MemoryBackend::new(),
            "memory://",
            RelayConfig::new("updates"),
            SessionRegistry::new(),
        );
        assert_eq!(bootstrap.state(), ConnectionState::Unstarted);
        assert_eq!(bootstrap.attempts(), 0);

        let first = bootstrap.ensure_started().await.unwrap();
        let second = bootstrap.ensure_started().await.unwrap();
        assert!(ConnectionHandle::ptr_eq(&first, &second));
        assert_eq!(first.channel(), "updates");
        assert_eq!(bootstrap.state(), ConnectionState::Ready);
        assert_eq!(bootstrap.attempts(), 1);
    }

    #[tokio::test]
    async fn close_is_terminal() {
        let bus = MemoryBackend::new();
        let bootstrap = ConnectionBootstrap::new(
            bus.clone(),
            "memory://",
            RelayConfig::new("updates"),
            SessionRegistry::new(),
        );
        bootstrap.ensure_started().await.unwrap();
        assert_eq!(bus.subscriber_count("updates"), 1);

        bootstrap.close().await.unwrap();
        assert_eq!(bootstrap.state(), ConnectionState::Closed);
        assert_eq!(bus.subscriber_count("updates"), 0);
        assert!(matches!(bootstrap.ensure_started().await, Err(Error::Closed)));
    }
}
