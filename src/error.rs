//! Broker error hierarchy.
//!
//! Mirrors the error kinds a downstream tool call can observe: configuration
//! problems, OAuth/auth problems, timeouts, upstream failures, and missing
//! runtime dependencies. Every variant that crosses the broker-tool boundary
//! is sanitized first via [`BrokerError::sanitize`].

use std::fmt;

/// Result type alias used throughout the broker.
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Errors surfaced by the broker's components.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum BrokerError {
    /// Malformed config, unknown upstream, missing `$ICA_HOME` on write,
    /// forbidden URL scheme.
    #[error("configuration error: {message}")]
    Configuration {
        /// Human-readable description.
        message: String,
        /// Offending config key, if known.
        key: Option<String>,
    },

    /// Missing OAuth fields, bad PKCE state, provider-reported error.
    #[error("auth error ({server:?}): {message}")]
    Auth {
        /// Human-readable description.
        message: String,
        /// Upstream server name, if the error is scoped to one.
        server: Option<String>,
    },

    /// Redirect wait, device-code poll, or upstream request timed out.
    #[error("timeout during {operation} after {timeout_secs}s")]
    Timeout {
        /// What was being waited on.
        operation: String,
        /// Configured timeout that elapsed.
        timeout_secs: u64,
    },

    /// A connected upstream MCP server reported a failure.
    #[error("upstream error ({server}): {message}")]
    Upstream {
        /// Human-readable description.
        message: String,
        /// Upstream server name.
        server: String,
    },

    /// A required runtime dependency (transport, crate feature) is
    /// unavailable.
    #[error("dependency error: {message}")]
    Dependency {
        /// Human-readable description.
        message: String,
    },

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem or process I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client failure (OAuth/OIDC requests).
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Error returned by the MCP client/protocol layer.
    #[error("protocol error: {0}")]
    Protocol(Box<turbomcp_protocol::Error>),
}

impl BrokerError {
    /// Build a [`BrokerError::Configuration`].
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            key: None,
        }
    }

    /// Build a [`BrokerError::Configuration`] naming the offending key.
    pub fn configuration_key(message: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            key: Some(key.into()),
        }
    }

    /// Build a [`BrokerError::Auth`] with no server scope.
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth {
            message: message.into(),
            server: None,
        }
    }

    /// Build a [`BrokerError::Auth`] scoped to `server`.
    pub fn auth_for(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Auth {
            message: message.into(),
            server: Some(server.into()),
        }
    }

    /// Build a [`BrokerError::Timeout`].
    pub fn timeout(operation: impl Into<String>, timeout_secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_secs,
        }
    }

    /// Build a [`BrokerError::Upstream`].
    pub fn upstream(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Upstream {
            message: message.into(),
            server: server.into(),
        }
    }

    /// Build a [`BrokerError::Dependency`].
    pub fn dependency(message: impl Into<String>) -> Self {
        Self::Dependency {
            message: message.into(),
        }
    }

    /// True for the error kinds §5/§7 describe as retry-safe (the caller
    /// may reissue the request; the worker or session has already been
    /// reset).
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Upstream { .. } | Self::Http(_)
        )
    }

    /// True for configuration/trust failures, as opposed to transient
    /// runtime ones.
    #[must_use]
    pub fn is_configuration_error(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }

    /// Strip internal detail before the message crosses the broker-tool
    /// boundary (downstream MCP clients only ever see this string).
    #[must_use]
    pub fn sanitize(&self) -> String {
        match self {
            Self::Configuration { message, .. } => format!("configuration error: {message}"),
            Self::Auth { message, .. } => format!("authentication error: {message}"),
            Self::Timeout { operation, .. } => format!("timed out waiting for {operation}"),
            Self::Upstream { server, message } => format!("upstream '{server}' error: {message}"),
            Self::Dependency { message } => format!("dependency error: {message}"),
            Self::Serialization(_) => "invalid JSON payload".to_string(),
            Self::Io(_) => "local I/O error".to_string(),
            Self::Http(_) => "network error contacting authorization server".to_string(),
            Self::Protocol(e) => e.to_string(),
        }
    }
}

impl From<Box<turbomcp_protocol::Error>> for BrokerError {
    fn from(e: Box<turbomcp_protocol::Error>) -> Self {
        Self::Protocol(e)
    }
}

impl From<turbomcp_protocol::Error> for BrokerError {
    fn from(e: turbomcp_protocol::Error) -> Self {
        Self::Protocol(Box::new(e))
    }
}

/// Extension trait adding human-friendly context to fallible calls, the
/// way [`Result::map_err`] plus a formatted string would, but named for
/// the three places the broker most often needs it.
pub trait BrokerErrorExt<T> {
    /// Wrap an error as a [`BrokerError::Configuration`] naming `key`.
    fn config_context(self, key: &str) -> BrokerResult<T>;

    /// Wrap an error as a [`BrokerError::Upstream`] scoped to `server`.
    fn upstream_context(self, server: &str) -> BrokerResult<T>;
}

impl<T, E> BrokerErrorExt<T> for std::result::Result<T, E>
where
    E: fmt::Display,
{
    fn config_context(self, key: &str) -> BrokerResult<T> {
        self.map_err(|e| BrokerError::configuration_key(e.to_string(), key))
    }

    fn upstream_context(self, server: &str) -> BrokerResult<T> {
        self.map_err(|e| BrokerError::upstream(server, e.to_string()))
    }
}
