//! Configuration discovery, merging, and trust gating (§4.1).

pub mod loader;
pub mod model;
pub mod trust;

pub use loader::{ConfigLoader, ConfigSource, LoadedServers};
pub use model::{OAuthConfig, OAuthFlow, RemoteKind, ScopeList, ServerDefinition, Transport};
pub use trust::{TrustEntry, TrustStatus, TrustStore};
