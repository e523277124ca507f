//! NATS backend built on `async-nats`.

use std::sync::Arc;
use std::time::Duration;

use async_nats::{Client, ConnectOptions};
use async_trait::async_trait;
use futures_util::StreamExt;
use tracing::info;

use super::{Backend, Connection, Message, MessageStream};
use crate::{Error, Result};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(120);

/// Connects to a NATS server; the connection string is a NATS URL.
#[derive(Debug, Clone)]
pub struct NatsBackend {
    client_name: String,
    connect_timeout: Duration,
    credentials: Option<(String, String)>,
}

impl Default for NatsBackend {
    fn default() -> Self {
        Self::new("cluster-relay")
    }
}

impl NatsBackend {
    /// Create a backend that identifies itself to the server as `client_name`.
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            credentials: None,
        }
    }

    /// Set the connection timeout. Default: 5s.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Authenticate with a user and password.
    pub fn user_and_password(
        mut self,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some((user.into(), password.into()));
        self
    }
}

#[async_trait]
impl Backend for NatsBackend {
    fn name(&self) -> &'static str {
        "nats"
    }

    async fn connect(&self, connection_string: &str) -> Result<Arc<dyn Connection>> {
        info!(url = connection_string, "connecting to NATS");

        // No retry_on_initial_connect: a failed start is surfaced to waiters
        // and retried by the next caller instead.
        let mut options = ConnectOptions::new()
            .name(&self.client_name)
            .ping_interval(DEFAULT_PING_INTERVAL)
            .connection_timeout(self.connect_timeout);
        if let Some((user, password)) = &self.credentials {
            options = options.user_and_password(user.clone(), password.clone());
        }

        let client = options
            .connect(connection_string)
            .await
            .map_err(|e| Error::connect(format!("{connection_string}: {e}")))?;

        info!(url = connection_string, "connected to NATS");
        Ok(Arc::new(NatsConnection { client }))
    }
}

struct NatsConnection {
    client: Client,
}

#[async_trait]
impl Connection for NatsConnection {
    async fn subscribe(&self, channel: &str) -> Result<MessageStream> {
        let subscriber = self
            .client
            .subscribe(channel.to_string())
            .await
            .map_err(|e| Error::subscribe(channel, e.to_string()))?;
        let stream = subscriber
            .map(|msg| Message {
                channel: msg.subject.to_string(),
                payload: msg.payload,
            })
            .boxed();
        Ok(stream)
    }

    async fn close(&self) -> Result<()> {
        self.client
            .flush()
            .await
            .map_err(|e| Error::connect(format!("flush on close failed: {e}")))
    }
}
