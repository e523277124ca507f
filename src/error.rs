//! Error types for cluster-relay.

use std::path::PathBuf;
use std::sync::Arc;

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
///
/// Discovery never fails with this type: an unreachable control plane or an
/// empty DNS answer is reported as
/// [`DiscoveryResult::Unavailable`](crate::discovery::DiscoveryResult).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Pub/sub backend could not be reached.
    #[error("backend connect failed: {0}")]
    Connect(String),

    /// Subscribing to the relay channel failed.
    #[error("subscribe to channel `{channel}` failed: {reason}")]
    Subscribe {
        /// Channel that was being subscribed.
        channel: String,
        /// Backend-provided reason.
        reason: String,
    },

    /// A shared start attempt failed; every waiter receives the same cause.
    #[error("relay start failed: {0}")]
    StartFailed(Arc<Error>),

    /// The start task ended without producing a result.
    #[error("relay start attempt aborted")]
    StartAborted,

    /// The bootstrap has been shut down.
    #[error("relay connection closed")]
    Closed,

    /// Credential files exist but could not be parsed.
    #[error("failed to load credential file {}: {reason}", path.display())]
    CredentialLoad {
        /// Offending file.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a connect error.
    pub fn connect<S: Into<String>>(msg: S) -> Self {
        Self::Connect(msg.into())
    }

    /// Create a subscribe error.
    pub fn subscribe<C: Into<String>, S: Into<String>>(channel: C, reason: S) -> Self {
        Self::Subscribe {
            channel: channel.into(),
            reason: reason.into(),
        }
    }

    /// Create a credential load error for `path`.
    pub fn credential_load<P: Into<PathBuf>, S: Into<String>>(path: P, reason: S) -> Self {
        Self::CredentialLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
