//! The strategy seam of the discovery chain.

use async_trait::async_trait;

use super::{EndpointDescriptor, UnavailableReason};
use crate::env::ClusterEnvironment;

/// What one strategy reports.
pub type StrategyResult = std::result::Result<Vec<EndpointDescriptor>, UnavailableReason>;

/// A way of enumerating peers.
///
/// The chain calls [`is_applicable`](Strategy::is_applicable) first and only
/// then [`discover`](Strategy::discover); a strategy that is not applicable
/// must not touch the network.
#[async_trait]
pub trait Strategy: Send + Sync + 'static {
    /// Human-readable name for logging and results (e.g. "dns").
    fn name(&self) -> &'static str;

    /// Whether the environment supports this strategy.
    fn is_applicable(&self, env: &ClusterEnvironment) -> bool;

    /// Enumerate peers.
    async fn discover(&self, env: &ClusterEnvironment) -> StrategyResult;
}
