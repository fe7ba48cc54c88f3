//! Upstream worker: one task per upstream, owning a single long-lived
//! session, serializing `list_tools`/`call_tool` through a bounded FIFO
//! queue so only one request is in flight against a given upstream at a
//! time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sha1::{Digest, Sha1};
use tokio::sync::{mpsc, oneshot};
use turbomcp_protocol::types::Tool;

use crate::config::model::ServerDefinition;
use crate::error::{BrokerError, BrokerResult};
use crate::oauth::OAuthEngine;
use crate::session::{AnySession, SessionFactory};
use crate::util::canonical_json;

/// Default idle-recycle window (§6 `ICA_MCP_PROXY_UPSTREAM_IDLE_TTL_S`).
pub const DEFAULT_IDLE_TTL_SECS: u64 = 90;
/// Default per-request timeout (§6 `ICA_MCP_PROXY_UPSTREAM_REQUEST_TIMEOUT_S`).
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;

/// SHA-1 of a server definition's canonicalized JSON form, used to detect
/// config-change invalidation (§4.5 "Config-change invalidation").
#[must_use]
pub fn fingerprint(def: &ServerDefinition) -> String {
    let value = serde_json::to_value(def).unwrap_or(serde_json::Value::Null);
    let mut hasher = Sha1::new();
    hasher.update(canonical_json(&value).as_bytes());
    crate::util::hex_encode(hasher.finalize())
}

enum WorkerOp {
    ListTools,
    CallTool { tool: String, arguments: Option<HashMap<String, Value>> },
    Shutdown,
}

enum WorkerResponse {
    Tools(Vec<Tool>),
    CallResult(Value),
    ShutdownAck,
}

struct WorkerRequest {
    op: WorkerOp,
    reply: oneshot::Sender<BrokerResult<WorkerResponse>>,
}

/// Handle to a running upstream worker task. Cloning shares the same
/// underlying queue and task; the mirror/broker only ever need one clone
/// per registry entry.
#[derive(Clone)]
pub struct WorkerHandle {
    name: Arc<str>,
    fingerprint: Arc<str>,
    sender: mpsc::Sender<WorkerRequest>,
    request_timeout: Duration,
}

impl WorkerHandle {
    /// The fingerprint this worker was spawned with, for config-change
    /// comparison in the mirror builder's registry lookup.
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// List the upstream's tools, serialized behind the worker's queue.
    pub async fn list_tools(&self) -> BrokerResult<Vec<Tool>> {
        match self.submit(WorkerOp::ListTools).await? {
            WorkerResponse::Tools(tools) => Ok(tools),
            _ => unreachable!("ListTools always replies with WorkerResponse::Tools or an error"),
        }
    }

    /// Call `tool` on the upstream, serialized behind the worker's queue.
    pub async fn call_tool(&self, tool: &str, arguments: Option<HashMap<String, Value>>) -> BrokerResult<Value> {
        match self
            .submit(WorkerOp::CallTool {
                tool: tool.to_string(),
                arguments,
            })
            .await?
        {
            WorkerResponse::CallResult(value) => Ok(value),
            _ => unreachable!("CallTool always replies with WorkerResponse::CallResult or an error"),
        }
    }

    /// Send a `shutdown` request with a grace period, then return once the
    /// worker acknowledges or the grace period elapses (§5 "On broker
    /// shutdown each worker is sent a shutdown request with a 5s grace,
    /// then forcibly cancelled").
    pub async fn shutdown(&self, grace: Duration) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(WorkerRequest { op: WorkerOp::Shutdown, reply: tx }).await.is_err() {
            return;
        }
        let _ = tokio::time::timeout(grace, rx).await;
    }

    async fn submit(&self, op: WorkerOp) -> BrokerResult<WorkerResponse> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(WorkerRequest { op, reply: tx })
            .await
            .map_err(|_| BrokerError::upstream(self.name.as_ref(), "worker task is no longer running"))?;

        tokio::time::timeout(self.request_timeout, rx)
            .await
            .map_err(|_| BrokerError::timeout(format!("upstream '{}' request", self.name), self.request_timeout.as_secs()))?
            .map_err(|_| BrokerError::upstream(self.name.as_ref(), "worker dropped the reply without responding"))?
    }
}

/// Spawn a new worker task for `name`, owning `def` for its lifetime.
/// Returns a handle the mirror/broker use to submit requests; the task
/// itself runs detached and exits on `shutdown` or channel closure.
#[must_use]
pub fn spawn(
    name: String,
    def: ServerDefinition,
    oauth: Arc<OAuthEngine>,
    idle_ttl: Duration,
    request_timeout: Duration,
) -> WorkerHandle {
    let fp = fingerprint(&def);
    let (sender, receiver) = mpsc::channel(64);

    let handle = WorkerHandle {
        name: Arc::from(name.as_str()),
        fingerprint: Arc::from(fp.as_str()),
        sender,
        request_timeout,
    };

    tokio::spawn(run(name, def, oauth, idle_ttl, receiver));
    handle
}

async fn run(
    name: String,
    def: ServerDefinition,
    oauth: Arc<OAuthEngine>,
    idle_ttl: Duration,
    mut receiver: mpsc::Receiver<WorkerRequest>,
) {
    let factory = SessionFactory::new(&oauth);
    let mut session: Option<AnySession> = None;

    loop {
        let request = match tokio::time::timeout(idle_ttl, receiver.recv()).await {
            Ok(Some(request)) => request,
            Ok(None) => {
                tracing::debug!(server = %name, "worker queue closed, shutting down");
                break;
            }
            Err(_) => {
                if session.take().is_some() {
                    tracing::debug!(server = %name, "idle timeout elapsed, closing session");
                }
                continue;
            }
        };

        match request.op {
            WorkerOp::Shutdown => {
                session = None;
                let _ = request.reply.send(Ok(WorkerResponse::ShutdownAck));
                tracing::debug!(server = %name, "worker shut down on request");
                break;
            }
            WorkerOp::ListTools => {
                let result = with_session(&factory, &name, &def, &mut session, |s| {
                    let name = name.clone();
                    Box::pin(async move { s.list_tools(&name).await })
                })
                .await;
                let _ = request.reply.send(result.map(WorkerResponse::Tools));
            }
            WorkerOp::CallTool { tool, arguments } => {
                let result = with_session(&factory, &name, &def, &mut session, move |s| {
                    let name = name.clone();
                    let tool = tool.clone();
                    let arguments = arguments.clone();
                    Box::pin(async move { s.call_tool(&name, &tool, arguments).await })
                })
                .await;
                let _ = request.reply.send(result.map(WorkerResponse::CallResult));
            }
        }
    }
}

/// Lazily open the session if absent, run `op` against it, and on any
/// failure close the session so the next request reopens cleanly (§4.5
/// step 5).
async fn with_session<'a, T, F>(
    factory: &SessionFactory<'a>,
    name: &str,
    def: &ServerDefinition,
    session: &mut Option<AnySession>,
    op: F,
) -> BrokerResult<T>
where
    F: for<'s> FnOnce(&'s mut AnySession) -> std::pin::Pin<Box<dyn std::future::Future<Output = BrokerResult<T>> + 's>>,
{
    if session.is_none() {
        let opened = factory.open(name, def).await?;
        *session = Some(opened);
    }
    let result = op(session.as_mut().expect("just populated above")).await;
    if result.is_err() {
        *session = None;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::Transport;

    fn stdio_def(command: &str) -> ServerDefinition {
        ServerDefinition {
            transport: Transport::Stdio {
                command: command.to_string(),
                args: vec![],
                env: HashMap::new(),
                cwd: None,
            },
            oauth: None,
            extra_params: HashMap::new(),
        }
    }

    #[test]
    fn fingerprint_is_stable_across_equivalent_definitions() {
        let a = stdio_def("python");
        let b = stdio_def("python");
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn fingerprint_changes_with_command() {
        let a = stdio_def("python");
        let b = stdio_def("node");
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[tokio::test]
    async fn shutdown_of_unreachable_worker_does_not_hang() {
        let dir = tempfile::TempDir::new().unwrap();
        let oauth = Arc::new(OAuthEngine::new(crate::token_store::TokenStore::new(dir.path().join("t.json"))));
        let handle = spawn(
            "demo".to_string(),
            stdio_def("does-not-exist-binary-xyz"),
            oauth,
            Duration::from_secs(90),
            Duration::from_secs(1),
        );
        handle.shutdown(Duration::from_secs(1)).await;
    }
}
