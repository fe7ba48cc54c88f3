//! Broker Server (§4.7): the stdio MCP server role. Reads JSON-RPC
//! requests from stdin line by line, dispatches `tools/list`/`tools/call`,
//! writes responses to stdout. Logs go to stderr; stdout carries only
//! protocol frames.

use std::io::Write;
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, trace, warn};
use turbomcp_protocol::jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, JsonRpcResponsePayload, JsonRpcVersion, ResponseId};
use turbomcp_protocol::types::RequestId;

use crate::broker::dispatch::Dispatcher;
use crate::config::loader::ConfigLoader;
use crate::error::BrokerResult;
use crate::mirror::MirrorBuilder;
use crate::oauth::OAuthEngine;

/// Maximum accepted request line.
const MAX_LINE_SIZE: usize = 10 * 1024 * 1024;

/// Server name and capability string reported in `initialize` responses
/// (§6 "Downstream MCP").
const SERVER_NAME: &str = "ica-mcp-proxy";

/// Owns the merged config view, the mirror/worker cache, and the OAuth
/// engine, and runs the stdio request/response loop until EOF.
pub struct BrokerServer {
    loader: ConfigLoader,
    mirror: MirrorBuilder,
    oauth: Arc<OAuthEngine>,
}

impl BrokerServer {
    /// Build a server from its already-constructed components.
    #[must_use]
    pub fn new(loader: ConfigLoader, mirror: MirrorBuilder, oauth: Arc<OAuthEngine>) -> Self {
        Self { loader, mirror, oauth }
    }

    /// Run the stdio event loop until EOF on stdin, then shut down every
    /// upstream worker before returning.
    pub async fn run(&self) -> BrokerResult<()> {
        debug!("starting broker stdio event loop");

        let stdin = tokio::io::stdin();
        let mut reader = BufReader::new(stdin);
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    debug!("received EOF on stdin, shutting down");
                    break;
                }
                Ok(_) => {
                    if line.len() > MAX_LINE_SIZE {
                        error!(bytes = line.len(), "request line exceeds maximum size");
                        self.write_error_response(ResponseId::null(), -32700, "Request too large", None)?;
                        continue;
                    }

                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    trace!(line = trimmed, "received request");

                    match serde_json::from_str::<JsonRpcRequest>(trimmed) {
                        Ok(request) => self.handle_request(request).await,
                        Err(e) => {
                            warn!(error = %e, "failed to parse JSON-RPC request");
                            self.write_error_response(ResponseId::null(), -32700, "Parse error", None)?;
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "error reading from stdin");
                    return Err(crate::error::BrokerError::Io(e));
                }
            }
        }

        self.mirror.shutdown_all().await;
        debug!("broker stdio event loop completed");
        Ok(())
    }

    async fn handle_request(&self, request: JsonRpcRequest) {
        let id = request.id.clone();
        let result = self.dispatch(&request).await;
        match result {
            Ok(value) => {
                if let Err(e) = self.write_success_response(id, value) {
                    error!(error = %e, "failed to write response");
                }
            }
            Err(e) => {
                if let Err(write_err) = self.write_error_response(ResponseId::from_request(id), -32603, &e.sanitize(), None) {
                    error!(error = %write_err, "failed to write error response");
                }
            }
        }
    }

    async fn dispatch(&self, request: &JsonRpcRequest) -> BrokerResult<Value> {
        match request.method.as_str() {
            "initialize" => Ok(serde_json::json!({
                "protocolVersion": "2025-06-18",
                "serverInfo": {"name": SERVER_NAME, "version": std::env::var("ICA_VERSION").unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string())},
                "capabilities": {"tools": {"listChanged": false}},
            })),
            "tools/list" => self.tools_list().await,
            "tools/call" => {
                let params = request
                    .params
                    .clone()
                    .ok_or_else(|| crate::error::BrokerError::configuration("missing params for tools/call"))?;
                let name = params
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| crate::error::BrokerError::configuration("missing 'name' in tools/call"))?
                    .to_string();
                let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
                self.dispatcher().call_tool(&name, arguments).await
            }
            other => Err(crate::error::BrokerError::configuration(format!("unknown method '{other}'"))),
        }
    }

    async fn tools_list(&self) -> BrokerResult<Value> {
        let loaded = self.loader.load()?;
        let catalogue = self.mirror.build(&loaded).await;
        Ok(serde_json::json!({"tools": catalogue.all_tools()}))
    }

    fn dispatcher(&self) -> Dispatcher<'_> {
        Dispatcher {
            loader: &self.loader,
            mirror: &self.mirror,
            oauth: &self.oauth,
        }
    }

    fn write_success_response(&self, id: RequestId, result: Value) -> BrokerResult<()> {
        let response = JsonRpcResponse {
            jsonrpc: JsonRpcVersion,
            id: ResponseId::from_request(id),
            payload: JsonRpcResponsePayload::Success { result },
        };
        self.write_response(&response)
    }

    fn write_error_response(&self, id: ResponseId, code: i32, message: &str, data: Option<Value>) -> BrokerResult<()> {
        let response = JsonRpcResponse {
            jsonrpc: JsonRpcVersion,
            id,
            payload: JsonRpcResponsePayload::Error {
                error: JsonRpcError {
                    code,
                    message: message.to_string(),
                    data,
                },
            },
        };
        self.write_response(&response)
    }

    fn write_response(&self, response: &JsonRpcResponse) -> BrokerResult<()> {
        let json = serde_json::to_string(response)?;
        trace!(response = %json, "writing response");
        let mut stdout = std::io::stdout();
        writeln!(stdout, "{json}")?;
        stdout.flush()?;
        Ok(())
    }
}
