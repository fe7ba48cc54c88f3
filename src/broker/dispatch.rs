//! Routes a decoded `tools/call` request to either a `proxy.*` handler
//! or a mirrored upstream tool (§4.6 broker tools, §4.7 dispatch).

use std::collections::HashMap;

use serde_json::{json, Value};

use crate::config::loader::ConfigLoader;
use crate::config::model::OAuthFlow;
use crate::error::{BrokerError, BrokerResult};
use crate::mirror::MirrorBuilder;
use crate::oauth::OAuthEngine;

/// Everything a `proxy.*`/mirrored tool call needs: the freshest config
/// view, the mirror/worker cache, and the OAuth engine.
pub struct Dispatcher<'a> {
    pub loader: &'a ConfigLoader,
    pub mirror: &'a MirrorBuilder,
    pub oauth: &'a OAuthEngine,
}

impl<'a> Dispatcher<'a> {
    /// Handle `tools/call` for `name` with `arguments`, routing to a
    /// broker tool or an upstream mirrored tool as appropriate.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> BrokerResult<Value> {
        if crate::mirror::is_broker_tool_name(name) {
            return self.call_broker_tool(name, arguments).await;
        }

        let loaded = self.loader.load()?;
        let catalogue = self.mirror.build(&loaded).await;
        let (server, tool) = catalogue
            .resolve(name)
            .ok_or_else(|| BrokerError::configuration(format!("unknown tool '{name}'")))?;
        let def = loaded
            .servers
            .get(&server)
            .ok_or_else(|| BrokerError::configuration(format!("unknown server '{server}'")))?;
        let args = arguments.as_object().map(|m| m.clone().into_iter().collect::<HashMap<_, _>>());
        self.mirror.call(&server, def, &tool, args).await
    }

    async fn call_broker_tool(&self, name: &str, arguments: Value) -> BrokerResult<Value> {
        match name {
            "proxy.list_servers" => self.list_servers(),
            "proxy.list_tools" => self.list_tools(&arguments).await,
            "proxy.call" => self.call(&arguments).await,
            "proxy.mirror_status" => Ok(self.mirror_status()),
            "proxy.auth_start" => self.auth_start(&arguments).await,
            "proxy.auth_status" => self.auth_status(&arguments),
            "proxy.auth_refresh" => self.auth_refresh(&arguments).await,
            "proxy.auth_logout" => self.auth_logout(&arguments),
            other => Err(BrokerError::configuration(format!("unknown broker tool '{other}'"))),
        }
    }

    fn list_servers(&self) -> BrokerResult<Value> {
        let loaded = self.loader.load()?;
        let mut names: Vec<&String> = loaded.servers.keys().collect();
        names.sort();
        Ok(json!({
            "servers": names,
            "sources": loaded.sources.iter().map(|s| s.tag()).collect::<Vec<_>>(),
            "blocked_servers": loaded.blocked_servers,
        }))
    }

    async fn list_tools(&self, arguments: &Value) -> BrokerResult<Value> {
        let server = required_str(arguments, "server")?;
        let include_schema = arguments.get("include_schema").and_then(Value::as_bool).unwrap_or(true);

        let loaded = self.loader.load()?;
        let def = loaded
            .servers
            .get(server)
            .ok_or_else(|| BrokerError::configuration(format!("unknown server '{server}'")))?;
        let tools = self.mirror.list_server_tools(server, def).await?;

        let tools: Vec<Value> = tools
            .into_iter()
            .map(|t| {
                if include_schema {
                    serde_json::to_value(&t).unwrap_or(Value::Null)
                } else {
                    json!({"name": t.name, "description": t.description})
                }
            })
            .collect();
        Ok(json!({"server": server, "tools": tools}))
    }

    async fn call(&self, arguments: &Value) -> BrokerResult<Value> {
        let server = required_str(arguments, "server")?;
        let tool = required_str(arguments, "tool")?;
        let args = arguments
            .get("args")
            .and_then(Value::as_object)
            .map(|m| m.clone().into_iter().collect::<HashMap<_, _>>());

        let loaded = self.loader.load()?;
        let def = loaded
            .servers
            .get(server)
            .ok_or_else(|| BrokerError::configuration(format!("unknown server '{server}'")))?;
        self.mirror.call(server, def, tool, args).await
    }

    fn mirror_status(&self) -> Value {
        match self.mirror.status() {
            Some(status) => serde_json::to_value(status).unwrap_or(Value::Null),
            None => json!({"servers_mirrored": 0, "tools_mirrored": 0, "truncated": false, "reasons": [], "server_errors": {}, "built_at": 0}),
        }
    }

    async fn auth_start(&self, arguments: &Value) -> BrokerResult<Value> {
        let server = required_str(arguments, "server")?;
        let flow = match arguments.get("flow").and_then(Value::as_str) {
            Some(s) => Some(parse_flow(s)?),
            None => None,
        };

        let loaded = self.loader.load()?;
        let def = loaded
            .servers
            .get(server)
            .ok_or_else(|| BrokerError::configuration(format!("unknown server '{server}'")))?;
        let oauth = def
            .oauth
            .as_ref()
            .ok_or_else(|| BrokerError::configuration(format!("server '{server}' has no oauth configuration")))?;

        self.oauth.start_flow(server, oauth, flow).await?;
        self.mirror.invalidate(server);
        Ok(json!({"server": server, "status": "authenticated"}))
    }

    fn auth_status(&self, arguments: &Value) -> BrokerResult<Value> {
        let server = required_str(arguments, "server")?;
        match self.oauth.status(server) {
            Some(entry) => Ok(json!({
                "server": server,
                "cached": true,
                "expires_at": entry.expires_at,
                "scope": entry.scope,
                "grant_type": entry.grant_type,
                "token_type": entry.token_type,
            })),
            None => Ok(json!({"server": server, "cached": false})),
        }
    }

    async fn auth_refresh(&self, arguments: &Value) -> BrokerResult<Value> {
        let server = required_str(arguments, "server")?;
        let loaded = self.loader.load()?;
        let def = loaded
            .servers
            .get(server)
            .ok_or_else(|| BrokerError::configuration(format!("unknown server '{server}'")))?;
        let oauth = def
            .oauth
            .as_ref()
            .ok_or_else(|| BrokerError::configuration(format!("server '{server}' has no oauth configuration")))?;

        self.oauth.force_refresh(server, oauth).await?;
        self.mirror.invalidate(server);
        Ok(json!({"server": server, "status": "refreshed"}))
    }

    fn auth_logout(&self, arguments: &Value) -> BrokerResult<Value> {
        let server = required_str(arguments, "server")?;
        self.oauth.logout(server)?;
        self.mirror.invalidate(server);
        Ok(json!({"server": server, "status": "logged_out"}))
    }
}

fn required_str<'v>(arguments: &'v Value, key: &str) -> BrokerResult<&'v str> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| BrokerError::configuration(format!("missing required field '{key}'")))
}

fn parse_flow(s: &str) -> BrokerResult<OAuthFlow> {
    match s {
        "pkce" => Ok(OAuthFlow::Pkce),
        "oidc_pkce" => Ok(OAuthFlow::OidcPkce),
        "device_code" => Ok(OAuthFlow::DeviceCode),
        "oidc_device_code" => Ok(OAuthFlow::OidcDeviceCode),
        "client_credentials" => Ok(OAuthFlow::ClientCredentials),
        other => Err(BrokerError::configuration(format!("unknown oauth flow '{other}'"))),
    }
}
