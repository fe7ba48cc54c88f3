//! Static definitions of the eight `proxy.*` broker tools (§4.6 "Broker
//! tools"). These are always prepended to the catalogue and never
//! subject to any cap.

use serde_json::json;
use turbomcp_protocol::types::{Tool, ToolInputSchema};

fn object_schema(properties: &[(&str, serde_json::Value)], required: &[&str]) -> ToolInputSchema {
    ToolInputSchema {
        schema_type: "object".to_string(),
        properties: Some(properties.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect()),
        required: if required.is_empty() {
            None
        } else {
            Some(required.iter().map(|s| (*s).to_string()).collect())
        },
        additional_properties: Some(false),
    }
}

fn tool(name: &str, description: &str, schema: ToolInputSchema) -> Tool {
    Tool {
        name: name.to_string(),
        title: None,
        description: Some(description.to_string()),
        input_schema: schema,
        output_schema: None,
        annotations: None,
        meta: None,
    }
}

/// The fixed set of broker tools, in the order `list_tools` should
/// present them.
#[must_use]
pub fn broker_tools() -> Vec<Tool> {
    vec![
        tool(
            "proxy.list_servers",
            "List configured upstream servers, their config sources, and any blocked by the trust gate.",
            object_schema(&[], &[]),
        ),
        tool(
            "proxy.list_tools",
            "List one upstream server's tools, optionally including full input schemas.",
            object_schema(
                &[
                    ("server", json!({"type": "string"})),
                    ("include_schema", json!({"type": "boolean"})),
                ],
                &["server"],
            ),
        ),
        tool(
            "proxy.call",
            "Call a tool on a named upstream server.",
            object_schema(
                &[
                    ("server", json!({"type": "string"})),
                    ("tool", json!({"type": "string"})),
                    ("args", json!({"type": "object"})),
                ],
                &["server", "tool"],
            ),
        ),
        tool(
            "proxy.mirror_status",
            "Report the last catalogue build's server/tool counts and truncation reasons.",
            object_schema(&[], &[]),
        ),
        tool(
            "proxy.auth_start",
            "Run the OAuth flow configured for a server (or an explicit override) and cache the resulting credentials.",
            object_schema(
                &[
                    ("server", json!({"type": "string"})),
                    (
                        "flow",
                        json!({"type": "string", "enum": ["pkce", "oidc_pkce", "device_code", "oidc_device_code", "client_credentials"]}),
                    ),
                ],
                &["server"],
            ),
        ),
        tool(
            "proxy.auth_status",
            "Report whether credentials are cached for a server, and their expiry/scope.",
            object_schema(&[("server", json!({"type": "string"}))], &["server"]),
        ),
        tool(
            "proxy.auth_refresh",
            "Force a refresh (or re-mint, for client-credentials) of a server's cached credentials.",
            object_schema(&[("server", json!({"type": "string"}))], &["server"]),
        ),
        tool(
            "proxy.auth_logout",
            "Delete a server's cached credentials.",
            object_schema(&[("server", json!({"type": "string"}))], &["server"]),
        ),
    ]
}

/// `true` for any name the broker server routes to itself rather than to
/// the mirror map (§4.7: "if the requested name begins with `proxy.`").
#[must_use]
pub fn is_broker_tool_name(name: &str) -> bool {
    name.starts_with("proxy.")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defines_exactly_eight_tools() {
        assert_eq!(broker_tools().len(), 8);
    }

    #[test]
    fn all_names_begin_with_proxy() {
        assert!(broker_tools().iter().all(|t| is_broker_tool_name(&t.name)));
    }
}
