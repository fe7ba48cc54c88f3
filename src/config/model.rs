//! Typed server and OAuth configuration.
//!
//! The wire configuration format is an open map of options; here it is
//! modeled as tagged variants plus an `extra_params` tail, validated once at
//! load time rather than re-checked on every call.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A single upstream server definition, as decoded from `.mcp.json` /
/// `mcp-servers.json` / the `MCP_CONFIG` override.
///
/// The wire format is a flat JSON object; `#[serde(flatten)]` on
/// [`Transport`] lets `command`/`url` style fields live at the top level
/// the way the source configuration expects, while still giving us a
/// closed, validated type internally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDefinition {
    /// How to reach the upstream.
    #[serde(flatten)]
    pub transport: Transport,

    /// OAuth configuration, if this upstream requires authenticated calls.
    #[serde(default)]
    pub oauth: Option<OAuthConfig>,

    /// Fields present in the source JSON that this type doesn't recognize.
    /// Carried through so config round-trips losslessly and so future
    /// transport/auth fields degrade gracefully instead of failing to parse.
    #[serde(flatten)]
    pub extra_params: HashMap<String, serde_json::Value>,
}

/// Transport-specific connection details for an upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Transport {
    /// Subprocess upstream, spoken to over stdio.
    Stdio {
        /// Executable to spawn.
        command: String,
        /// Arguments passed to `command`.
        #[serde(default)]
        args: Vec<String>,
        /// Environment overlay applied on top of the broker's own
        /// environment (see [`crate::session::factory`]).
        #[serde(default)]
        env: HashMap<String, String>,
        /// Working directory for the child process.
        #[serde(default)]
        cwd: Option<String>,
    },
    /// Remote upstream reachable over HTTP.
    Remote {
        /// Base URL of the upstream MCP endpoint.
        url: String,
        /// Explicit transport kind; inferred from `url` when absent (see
        /// [`RemoteKind::infer`]).
        #[serde(rename = "type", default)]
        kind: Option<RemoteKind>,
        /// Static headers sent with every request.
        #[serde(default)]
        headers: HashMap<String, String>,
        /// Pre-shared API key, injected as a bearer token when no OAuth
        /// config and no explicit `Authorization` header are present.
        #[serde(default)]
        api_key: Option<String>,
        /// Per-request timeout in seconds.
        #[serde(default)]
        timeout: Option<u64>,
    },
}

/// Remote transport kind, as named by the `type` field or inferred from
/// the URL's path suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteKind {
    /// Server-Sent Events transport.
    Sse,
    /// Plain HTTP transport.
    Http,
    /// Streamable HTTP transport (MCP 2025-03-26+).
    StreamableHttp,
}

impl RemoteKind {
    /// Infer the transport kind from a URL when `type` is absent: a
    /// `/mcp` suffix means streamable-HTTP, a `/sse` suffix or anything
    /// else defaults to SSE, matching §4.4.
    #[must_use]
    pub fn infer(url: &str) -> Self {
        if url.ends_with("/mcp") {
            Self::StreamableHttp
        } else {
            Self::Sse
        }
    }
}

impl ServerDefinition {
    /// The transport kind this definition resolves to, inferring from
    /// the URL suffix when `type` was not given explicitly.
    #[must_use]
    pub fn remote_kind(&self) -> Option<RemoteKind> {
        match &self.transport {
            Transport::Stdio { .. } => None,
            Transport::Remote { url, kind, .. } => Some(kind.unwrap_or_else(|| RemoteKind::infer(url))),
        }
    }

    /// True if this definition spawns a subprocess (and therefore is
    /// subject to the strict-trust gate and owned by a [`crate::worker::WorkerHandle`]).
    #[must_use]
    pub fn is_stdio(&self) -> bool {
        matches!(self.transport, Transport::Stdio { .. })
    }
}

/// OAuth flow configuration attached to a [`ServerDefinition`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
    /// Which OAuth flow to run.
    #[serde(rename = "type")]
    pub flow: OAuthFlow,

    /// OIDC issuer; when present, endpoints are resolved via discovery
    /// (see [`crate::oauth::discovery`]) instead of the explicit fields
    /// below.
    #[serde(default)]
    pub issuer: Option<String>,

    /// Explicit authorization endpoint (PKCE).
    #[serde(default)]
    pub authorization_url: Option<String>,
    /// Explicit token endpoint.
    #[serde(default)]
    pub token_url: Option<String>,
    /// Explicit device authorization endpoint (device-code flow).
    #[serde(default)]
    pub device_authorization_url: Option<String>,

    /// Client identifier.
    pub client_id: String,
    /// Client secret, required for client-credentials and optional
    /// elsewhere (confidential clients).
    #[serde(default)]
    pub client_secret: Option<String>,

    /// Requested scopes, accepted as either a JSON list or a
    /// space-delimited string (normalized by [`OAuthConfig::scopes_vec`]).
    #[serde(default)]
    pub scopes: ScopeList,

    /// Loopback redirect URI for the PKCE flow. Defaults to
    /// `http://127.0.0.1:8765/callback` when absent.
    #[serde(default)]
    pub redirect_uri: Option<String>,

    /// Extra parameters merged into the authorization request.
    #[serde(default)]
    pub extra_auth_params: HashMap<String, String>,
    /// Extra parameters merged into every token request.
    #[serde(default)]
    pub extra_token_params: HashMap<String, String>,

    /// Overrides the default PKCE redirect-wait timeout (300s).
    #[serde(default)]
    pub redirect_timeout_secs: Option<u64>,
}

impl OAuthConfig {
    /// Normalized scope list, regardless of whether the source JSON used
    /// a list or a space-delimited string.
    #[must_use]
    pub fn scopes_vec(&self) -> Vec<String> {
        self.scopes.0.clone()
    }

    /// The redirect URI to use, defaulted per §4.3.
    #[must_use]
    pub fn redirect_uri_or_default(&self) -> String {
        self.redirect_uri
            .clone()
            .unwrap_or_else(|| "http://127.0.0.1:8765/callback".to_string())
    }
}

/// Scopes as given in config: either a JSON array of strings or a single
/// space-delimited string. Always normalizes to a `Vec<String>`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScopeList(pub Vec<String>);

impl<'de> Deserialize<'de> for ScopeList {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            List(Vec<String>),
            Spaced(String),
        }
        Ok(match Repr::deserialize(deserializer)? {
            Repr::List(v) => ScopeList(v),
            Repr::Spaced(s) => ScopeList(s.split_whitespace().map(str::to_string).collect()),
        })
    }
}

/// Which OAuth flow a [`OAuthConfig`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OAuthFlow {
    /// Authorization-code + PKCE against explicit endpoints.
    Pkce,
    /// Authorization-code + PKCE against OIDC-discovered endpoints.
    OidcPkce,
    /// RFC 8628 device authorization grant against explicit endpoints.
    DeviceCode,
    /// RFC 8628 device authorization grant against OIDC-discovered
    /// endpoints.
    OidcDeviceCode,
    /// Client-credentials grant.
    ClientCredentials,
}

impl OAuthFlow {
    /// True when endpoints must be resolved via OIDC discovery rather
    /// than read directly off the config.
    #[must_use]
    pub fn uses_discovery(self) -> bool {
        matches!(self, Self::OidcPkce | Self::OidcDeviceCode)
    }

    /// True when this flow is the device-code family.
    #[must_use]
    pub fn is_device_code(self) -> bool {
        matches!(self, Self::DeviceCode | Self::OidcDeviceCode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_list_accepts_space_delimited_string() {
        let json = serde_json::json!("read write offline_access");
        let scopes: ScopeList = serde_json::from_value(json).unwrap();
        assert_eq!(scopes.0, vec!["read", "write", "offline_access"]);
    }

    #[test]
    fn scope_list_accepts_array() {
        let json = serde_json::json!(["read", "write"]);
        let scopes: ScopeList = serde_json::from_value(json).unwrap();
        assert_eq!(scopes.0, vec!["read", "write"]);
    }

    #[test]
    fn remote_kind_infers_streamable_http_from_mcp_suffix() {
        assert_eq!(RemoteKind::infer("https://example.com/mcp"), RemoteKind::StreamableHttp);
    }

    #[test]
    fn remote_kind_defaults_to_sse() {
        assert_eq!(RemoteKind::infer("https://example.com/sse"), RemoteKind::Sse);
        assert_eq!(RemoteKind::infer("https://example.com/anything"), RemoteKind::Sse);
    }

    #[test]
    fn stdio_definition_round_trips() {
        let json = serde_json::json!({
            "command": "python",
            "args": ["server.py"],
            "env": {"FOO": "bar"},
        });
        let def: ServerDefinition = serde_json::from_value(json).unwrap();
        assert!(def.is_stdio());
        assert!(def.remote_kind().is_none());
    }
}
