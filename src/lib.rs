//! Real-time relay and peer discovery for services running in a cluster.
//!
//! Two independent halves:
//!
//! - [`hub`]: one lazily started pub/sub subscription per process, fanned
//!   out to every connected client session ([`bootstrap`], [`relay`],
//!   [`session`], [`backend`]).
//! - [`discovery`]: find sibling instances through the cluster API, a raw
//!   HTTP call to the control plane, or headless-service DNS, in that order
//!   ([`env`], [`credentials`]).

#![warn(missing_docs)]

pub mod backend;
pub mod bootstrap;
pub mod credentials;
pub mod discovery;
pub mod env;
pub mod error;
pub mod hub;
pub mod relay;
pub mod session;

// Re-export key types
pub use backend::{Backend, Connection, MemoryBackend, Message};
#[cfg(feature = "nats")]
pub use backend::NatsBackend;
pub use bootstrap::{ConnectionBootstrap, ConnectionHandle, ConnectionState};
pub use credentials::{CredentialBundle, CredentialPaths, Credentials};
pub use discovery::{DiscoveryChain, DiscoveryResult, EndpointDescriptor, UnavailableReason};
pub use env::ClusterEnvironment;
pub use error::{Error, Result};
pub use hub::{RelayHub, Session};
pub use relay::RelayConfig;
pub use session::SessionRegistry;
