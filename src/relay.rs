//! Fanout of backend messages to connected sessions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::broadcast;
use tracing::Instrument;

use crate::backend::{Message, MessageStream};
use crate::session::{Delivery, SessionRegistry};

/// Relay settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Channel the relay subscribes to.
    pub channel: String,
    /// Per-session buffer; beyond this the oldest messages are dropped.
    pub session_buffer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            channel: "relay.updates".to_string(),
            session_buffer: 256,
        }
    }
}

impl RelayConfig {
    /// Config for `channel` with default buffering.
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            ..Self::default()
        }
    }

    /// Set the per-session buffer. Default: 256.
    pub fn session_buffer(mut self, n: usize) -> Self {
        self.session_buffer = n.max(1);
        self
    }
}

/// Counters for one fanout pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    /// Sessions the payload was queued for.
    pub delivered: usize,
    /// Sessions that had already gone away.
    pub gone: usize,
}

/// Forwards every received message to every registered session.
#[derive(Clone)]
pub struct FanoutRelay {
    registry: SessionRegistry,
    forwarded: Arc<AtomicU64>,
}

impl FanoutRelay {
    /// Create a relay reading from `registry`.
    pub fn new(registry: SessionRegistry) -> Self {
        Self {
            registry,
            forwarded: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Enqueue `message` for each session in the current registry snapshot.
    ///
    /// Never waits on a session. Sessions that vanished since the snapshot
    /// are counted as gone and otherwise ignored.
    pub fn fanout(&self, message: &Message) -> FanoutReport {
        let mut report = FanoutReport::default();
        for sink in self.registry.snapshot() {
            match sink.send(message.payload.clone()) {
                Delivery::Queued => report.delivered += 1,
                Delivery::Gone => {
                    tracing::trace!(session = %sink.id(), "session gone during fanout");
                    report.gone += 1;
                }
            }
        }
        self.forwarded.fetch_add(1, Ordering::Relaxed);
        report
    }

    /// Messages fanned out since creation.
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Drive `stream` until it ends or `shutdown` fires.
    pub(crate) async fn pump(
        self,
        channel: String,
        mut stream: MessageStream,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let span = tracing::debug_span!("relay_pump", %channel);
        async move {
            tracing::debug!("relay pump started");
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        tracing::debug!("relay pump received shutdown signal");
                        break;
                    }
                    msg = stream.next() => {
                        match msg {
                            Some(msg) => {
                                let report = self.fanout(&msg);
                                tracing::trace!(
                                    len = msg.payload.len(),
                                    delivered = report.delivered,
                                    gone = report.gone,
                                    "fanout"
                                );
                            }
                            None => {
                                tracing::warn!("relay subscription ended");
                                break;
                            }
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn fanout_reaches_every_session_and_skips_gone_ones() {
        let registry = SessionRegistry::new();
        let mut a = registry.register(8);
        let b = registry.register(8);
        drop(b);

        let relay = FanoutRelay::new(registry.clone());
        let report = relay.fanout(&Message::new("updates", "hello"));

        assert_eq!(report, FanoutReport { delivered: 1, gone: 1 });
        assert_eq!(a.recv().await.unwrap(), Bytes::from("hello"));
        assert_eq!(relay.forwarded(), 1);
    }

    #[tokio::test]
    async fn pump_stops_on_shutdown() {
        let registry = SessionRegistry::new();
        let relay = FanoutRelay::new(registry);
        let (tx, rx) = broadcast::channel(1);
        let stream: MessageStream = Box::pin(futures_util::stream::pending::<Message>());

        let task = tokio::spawn(relay.pump("updates".into(), stream, rx));
        tx.send(()).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .expect("pump should stop")
            .unwrap();
    }
}
