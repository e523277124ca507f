//! Ordered fallback over the discovery strategies.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn, Instrument};

use super::cluster_api::{ApiClientStrategy, ClusterApi, KubeApiClient, IN_CLUSTER_API};
use super::direct_http::DirectHttpStrategy;
use super::dns::DnsStrategy;
use super::strategy::Strategy;
use super::{DiscoveryResult, UnavailableReason};
use crate::credentials::{CredentialBundle, CredentialPaths, Credentials};
use crate::env::ClusterEnvironment;
use crate::Result;

/// Timeouts and switches for the chain.
#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    /// Upper bound on one strategy attempt, network included.
    pub strategy_timeout: Duration,
    /// Timeout applied to each HTTP request.
    pub request_timeout: Duration,
    /// Build the typed cluster API client when credentials are present.
    pub use_in_cluster_client: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            strategy_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(4),
            use_in_cluster_client: true,
        }
    }
}

impl DiscoveryConfig {
    /// Set the per-strategy timeout. Default: 5s.
    pub fn strategy_timeout(mut self, timeout: Duration) -> Self {
        self.strategy_timeout = timeout;
        self
    }

    /// Set the per-request timeout. Default: 4s.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Enable or disable the typed cluster API client. Default: enabled.
    pub fn use_in_cluster_client(mut self, enabled: bool) -> Self {
        self.use_in_cluster_client = enabled;
        self
    }
}

enum ApiClientChoice {
    InCluster,
    Custom(Arc<dyn ClusterApi>),
    Disabled,
}

/// Builder for [`DiscoveryChain`].
pub struct DiscoveryChainBuilder {
    env: ClusterEnvironment,
    credentials: Option<CredentialBundle>,
    api_client: ApiClientChoice,
    extra: Vec<Box<dyn Strategy>>,
    config: DiscoveryConfig,
}

impl DiscoveryChainBuilder {
    /// Credentials for the cluster API strategies.
    pub fn credentials(mut self, credentials: Option<CredentialBundle>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Use `client` for the first strategy instead of building one.
    pub fn api_client(mut self, client: Arc<dyn ClusterApi>) -> Self {
        self.api_client = ApiClientChoice::Custom(client);
        self
    }

    /// Leave the first strategy without a client.
    pub fn without_api_client(mut self) -> Self {
        self.api_client = ApiClientChoice::Disabled;
        self
    }

    /// Append a strategy after the built-in ones.
    pub fn strategy<S: Strategy>(mut self, strategy: S) -> Self {
        self.extra.push(Box::new(strategy));
        self
    }

    /// Replace the configuration.
    pub fn config(mut self, config: DiscoveryConfig) -> Self {
        self.config = config;
        self
    }

    /// Assemble the chain: cluster API, direct HTTP, DNS, then any extras.
    pub fn build(self) -> DiscoveryChain {
        let Self {
            mut env,
            credentials,
            api_client,
            extra,
            config,
        } = self;

        if env.namespace.is_none() {
            env.namespace = credentials
                .as_ref()
                .and_then(|c| c.namespace())
                .map(str::to_string);
        }

        let api = match api_client {
            ApiClientChoice::Custom(client) => ApiClientStrategy::new(client),
            ApiClientChoice::Disabled => ApiClientStrategy::unavailable(),
            ApiClientChoice::InCluster => match &credentials {
                Some(bundle) if config.use_in_cluster_client => {
                    let base_url = env
                        .api_base_url()
                        .unwrap_or_else(|| IN_CLUSTER_API.to_string());
                    match KubeApiClient::with_base_url(bundle, base_url, config.request_timeout) {
                        Ok(client) => ApiClientStrategy::new(Arc::new(client)),
                        Err(e) => {
                            warn!(error = %e, "cluster API client unavailable");
                            ApiClientStrategy::unavailable()
                        }
                    }
                }
                _ => ApiClientStrategy::unavailable(),
            },
        };

        let direct = match &credentials {
            Some(bundle) => match bundle.http_client(config.request_timeout) {
                Ok(http) => DirectHttpStrategy::new(http),
                Err(e) => {
                    warn!(error = %e, "failed to build HTTP client from credentials");
                    DirectHttpStrategy::unavailable()
                }
            },
            None => DirectHttpStrategy::unavailable(),
        };

        let mut strategies: Vec<Box<dyn Strategy>> =
            vec![Box::new(api), Box::new(direct), Box::new(DnsStrategy)];
        strategies.extend(extra);

        DiscoveryChain {
            env,
            strategies,
            config,
        }
    }
}

/// Tries each applicable strategy in order until one finds peers.
///
/// Results are never cached: every [`discover_peers`](Self::discover_peers)
/// call goes back to the network.
pub struct DiscoveryChain {
    env: ClusterEnvironment,
    strategies: Vec<Box<dyn Strategy>>,
    config: DiscoveryConfig,
}

impl fmt::Debug for DiscoveryChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryChain")
            .field("env", &self.env)
            .field("strategies", &self.strategy_names())
            .field("config", &self.config)
            .finish()
    }
}

impl DiscoveryChain {
    /// Start building a chain for `env`.
    pub fn builder(env: ClusterEnvironment) -> DiscoveryChainBuilder {
        DiscoveryChainBuilder {
            env,
            credentials: None,
            api_client: ApiClientChoice::InCluster,
            extra: Vec::new(),
            config: DiscoveryConfig::default(),
        }
    }

    /// Chain for the current process: environment variables plus the
    /// mounted service-account credentials, if any.
    pub fn from_environment() -> Self {
        Self::with_credentials(
            ClusterEnvironment::from_env(),
            CredentialBundle::load(&CredentialPaths::default()),
        )
    }

    /// Chain for `env` with the outcome of a credential load.
    ///
    /// Credentials that exist but cannot be read are logged and treated as
    /// absent, so the chain still falls back to DNS.
    pub fn with_credentials(env: ClusterEnvironment, credentials: Result<Credentials>) -> Self {
        let bundle = match credentials {
            Ok(credentials) => credentials.into_bundle(),
            Err(e) => {
                warn!(error = %e, "ignoring unreadable cluster credentials");
                None
            }
        };
        Self::builder(env).credentials(bundle).build()
    }

    /// The environment the strategies see.
    pub fn environment(&self) -> &ClusterEnvironment {
        &self.env
    }

    /// The active configuration.
    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Strategy names in the order they are tried.
    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Locate peers.
    ///
    /// Returns the first strategy's successful list. When every applicable
    /// strategy fails, the last failure is reported; when none applies, the
    /// reason is [`UnavailableReason::NotInClusterEnvironment`].
    pub async fn discover_peers(&self) -> DiscoveryResult {
        let mut last_failure = None;

        for strategy in &self.strategies {
            let name = strategy.name();
            if !strategy.is_applicable(&self.env) {
                trace!(strategy = name, "not applicable");
                continue;
            }

            let started = Instant::now();
            let span = tracing::debug_span!("discovery_attempt", strategy = name);
            let attempt = tokio::time::timeout(
                self.config.strategy_timeout,
                strategy.discover(&self.env),
            )
            .instrument(span)
            .await;
            let outcome = attempt.unwrap_or(Err(UnavailableReason::Timeout));

            match outcome {
                Ok(endpoints) => {
                    debug!(
                        strategy = name,
                        peers = endpoints.len(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "peers discovered"
                    );
                    return DiscoveryResult::Found {
                        source: name,
                        endpoints,
                    };
                }
                Err(reason) => {
                    debug!(strategy = name, %reason, "strategy failed, trying next");
                    last_failure = Some(reason);
                }
            }
        }

        let reason = last_failure.unwrap_or(UnavailableReason::NotInClusterEnvironment);
        info!(%reason, "peer discovery unavailable");
        DiscoveryResult::Unavailable { reason }
    }
}
