//! Detects the transport a [`ServerDefinition`] describes and opens an
//! initialized MCP client session for it.
//!
//! [`AnySession`] is a type-erased client wrapper, one variant per
//! transport, so callers never need to know which kind of session
//! they're holding. Env overlay for subprocess upstreams follows
//! `turbomcp-transport::child_process::ChildProcessConfig`'s own
//! `cmd.env(key, value)` semantics, which already layers onto the
//! inherited process environment rather than replacing it.

use std::time::Duration;

use serde_json::Value;
use url::Url;

use turbomcp_client::Client;
use turbomcp_protocol::types::Tool;
use turbomcp_transport::streamable_http_client::{StreamableHttpClientConfig, StreamableHttpClientTransport};
use turbomcp_transport::{ChildProcessConfig, ChildProcessTransport, Transport as _};

use crate::config::model::{RemoteKind, ServerDefinition, Transport};
use crate::error::{BrokerError, BrokerErrorExt, BrokerResult};
use crate::oauth::OAuthEngine;

/// A type-erased, initialized MCP client session for exactly one
/// upstream. Dropping it tears down the underlying transport (the child
/// process on `kill_on_drop`, the HTTP client's connection pool).
pub enum AnySession {
    /// Subprocess upstream reached over stdio.
    Stdio(Client<ChildProcessTransport>),
    /// Remote upstream reached over HTTP (SSE or streamable-HTTP).
    Remote(Client<StreamableHttpClientTransport>),
}

macro_rules! dispatch_session {
    ($self:expr, $method:ident($($args:expr),*)) => {
        match $self {
            AnySession::Stdio(c) => c.$method($($args),*).await,
            AnySession::Remote(c) => c.$method($($args),*).await,
        }
    };
}

impl AnySession {
    /// List the tools this upstream currently advertises.
    pub async fn list_tools(&mut self, server: &str) -> BrokerResult<Vec<Tool>> {
        dispatch_session!(self, list_tools()).upstream_context(server)
    }

    /// Invoke `tool` on this upstream with the given arguments.
    pub async fn call_tool(
        &mut self,
        server: &str,
        tool: &str,
        arguments: Option<std::collections::HashMap<String, Value>>,
    ) -> BrokerResult<Value> {
        dispatch_session!(self, call_tool(tool, arguments)).upstream_context(server)
    }
}

/// Opens scoped MCP client sessions for upstream [`ServerDefinition`]s,
/// detecting transport and injecting OAuth/API-key headers for remote
/// upstreams along the way.
pub struct SessionFactory<'a> {
    oauth: &'a OAuthEngine,
}

impl<'a> SessionFactory<'a> {
    /// Build a factory that resolves headers through `oauth`.
    #[must_use]
    pub fn new(oauth: &'a OAuthEngine) -> Self {
        Self { oauth }
    }

    /// Open and initialize a session for `name`'s definition. The
    /// session is always returned fully initialized or not at all — on
    /// any failure the partially-constructed transport is dropped
    /// (§4.4: "the session is always closed on every exit path").
    pub async fn open(&self, name: &str, def: &ServerDefinition) -> BrokerResult<AnySession> {
        match &def.transport {
            Transport::Stdio { command, args, env, cwd } => self.open_stdio(command, args, env, cwd.as_deref()).await,
            Transport::Remote { .. } => self.open_remote(name, def).await,
        }
    }

    async fn open_stdio(
        &self,
        command: &str,
        args: &[String],
        env: &std::collections::HashMap<String, String>,
        cwd: Option<&str>,
    ) -> BrokerResult<AnySession> {
        let config = ChildProcessConfig {
            command: command.to_string(),
            args: args.to_vec(),
            working_directory: cwd.map(str::to_string),
            environment: if env.is_empty() {
                None
            } else {
                Some(env.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            },
            ..Default::default()
        };

        let transport = ChildProcessTransport::new(config);
        transport
            .connect()
            .await
            .map_err(|e| BrokerError::upstream(command, format!("failed to spawn subprocess: {e}")))?;

        let mut client = Client::new(transport);
        client.initialize().await.upstream_context(command)?;
        Ok(AnySession::Stdio(client))
    }

    async fn open_remote(&self, name: &str, def: &ServerDefinition) -> BrokerResult<AnySession> {
        let Transport::Remote { url, timeout, .. } = &def.transport else {
            unreachable!("open_remote only called for Transport::Remote")
        };
        let kind = def.remote_kind().unwrap_or(RemoteKind::Sse);
        let (base_url, endpoint_path) = split_origin_and_path(url)?;
        let headers = self.oauth.inject_headers(name, def).await?;

        let config = StreamableHttpClientConfig {
            base_url,
            endpoint_path,
            timeout: Duration::from_secs(timeout.unwrap_or(30)),
            headers,
            ..Default::default()
        };
        // `kind` currently only affects endpoint-path inference upstream in
        // `RemoteKind::infer`; SSE and streamable-HTTP both speak the same
        // request/response shape over this transport, so no further branch
        // is needed here.
        let _ = kind;

        let transport = StreamableHttpClientTransport::new(config);
        transport
            .connect()
            .await
            .map_err(|e| BrokerError::upstream(name, format!("failed to connect: {e}")))?;

        let mut client = Client::new(transport);
        client.initialize().await.upstream_context(name)?;
        Ok(AnySession::Remote(client))
    }
}

/// Split a full upstream URL into `(origin, path)`, since
/// [`StreamableHttpClientConfig`] wants the two separately.
fn split_origin_and_path(url_str: &str) -> BrokerResult<(String, String)> {
    let parsed = Url::parse(url_str).map_err(|e| BrokerError::configuration(format!("invalid url '{url_str}': {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| BrokerError::configuration(format!("url '{url_str}' has no host")))?;
    let mut origin = format!("{}://{host}", parsed.scheme());
    if let Some(port) = parsed.port() {
        origin.push_str(&format!(":{port}"));
    }
    let path = parsed.path();
    let path = if path.is_empty() { "/".to_string() } else { path.to_string() };
    Ok((origin, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_origin_and_path_separates_host_from_path() {
        let (origin, path) = split_origin_and_path("https://example.com:9000/mcp").unwrap();
        assert_eq!(origin, "https://example.com:9000");
        assert_eq!(path, "/mcp");
    }

    #[test]
    fn split_origin_and_path_defaults_to_root() {
        let (origin, path) = split_origin_and_path("https://example.com").unwrap();
        assert_eq!(origin, "https://example.com");
        assert_eq!(path, "/");
    }

    #[test]
    fn split_origin_and_path_rejects_garbage() {
        assert!(split_origin_and_path("not a url").is_err());
    }
}
