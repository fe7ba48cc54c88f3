//! Catalogue types and truncation caps (§4.6 "Caps and truncation").

use std::collections::HashMap;

use serde::Serialize;
use turbomcp_protocol::types::Tool;

/// Tunable caps applied, in order, while building a catalogue.
#[derive(Debug, Clone, Copy)]
pub struct MirrorCaps {
    /// Max number of servers whose tools are mirrored.
    pub max_servers: usize,
    /// Max tools taken from any single server.
    pub max_tools_per_server: usize,
    /// Max tools across the whole catalogue.
    pub max_total_tools: usize,
    /// Max minified-JSON byte size for a mirrored tool's input schema.
    pub max_schema_bytes: usize,
}

impl Default for MirrorCaps {
    fn default() -> Self {
        Self {
            max_servers: 25,
            max_tools_per_server: 200,
            max_total_tools: 2000,
            max_schema_bytes: 65_536,
        }
    }
}

/// One upstream tool exposed under its mirrored, collision-safe name.
#[derive(Debug, Clone)]
pub struct MirroredTool {
    /// The name downstream clients see and call through `proxy.call` or
    /// directly via `call_tool`.
    pub proxy_name: String,
    /// Originating upstream server name.
    pub upstream_server: String,
    /// Tool name as advertised by the upstream.
    pub upstream_tool: String,
    /// The tool definition clients see, with `_meta.ica_proxy` attached
    /// and the schema possibly replaced by the permissive fallback.
    pub tool: Tool,
}

/// Snapshot of the last catalogue build, returned by `proxy.mirror_status`.
#[derive(Debug, Clone, Serialize)]
pub struct MirrorStatus {
    /// Servers actually mirrored (after the server cap).
    pub servers_mirrored: usize,
    /// Tools actually mirrored (after all caps).
    pub tools_mirrored: usize,
    /// True if any cap caused truncation.
    pub truncated: bool,
    /// Human-readable reasons, one per cap that fired.
    pub reasons: Vec<String>,
    /// Per-server tool-list failures encountered during this build,
    /// keyed by server name.
    pub server_errors: HashMap<String, String>,
    /// Unix timestamp this build completed.
    pub built_at: i64,
}

/// The full set of tools a `list_tools` call returns: broker tools plus
/// every mirrored tool, along with the lookup needed to resolve a proxy
/// name back to its `(server, tool)` pair.
#[derive(Debug, Clone, Default)]
pub struct Catalogue {
    /// Broker (`proxy.*`) tool definitions, always present.
    pub broker_tools: Vec<Tool>,
    /// Mirrored upstream tools, in build order.
    pub mirrored: Vec<MirroredTool>,
    /// `proxy_name -> (server, tool)`, for `call_tool` dispatch.
    pub by_proxy_name: HashMap<String, (String, String)>,
    /// `sanitize(server) -> server`, for the sanitized-prefix dispatch
    /// fallback (§4.7).
    pub sanitized_servers: HashMap<String, String>,
}

impl Catalogue {
    /// All tool definitions a `list_tools` call returns: broker tools
    /// first, then mirrored tools in build order.
    #[must_use]
    pub fn all_tools(&self) -> Vec<Tool> {
        let mut out = self.broker_tools.clone();
        out.extend(self.mirrored.iter().map(|m| m.tool.clone()));
        out
    }

    /// Resolve a proxy tool name to `(server, tool)`, either via the
    /// exact mirror map or, failing that, by splitting on the first `.`
    /// and matching the prefix against a sanitized server name (§4.7).
    #[must_use]
    pub fn resolve(&self, proxy_name: &str) -> Option<(String, String)> {
        if let Some(hit) = self.by_proxy_name.get(proxy_name) {
            return Some(hit.clone());
        }
        let (prefix, rest) = proxy_name.split_once('.')?;
        let server = self.sanitized_servers.get(prefix)?;
        Some((server.clone(), rest.to_string()))
    }
}
