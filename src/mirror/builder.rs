//! Builds and caches the tool catalogue (§4.6), and owns the worker
//! registry every mirrored/`proxy.call` dispatch goes through.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use turbomcp_protocol::types::Tool;

use crate::config::loader::LoadedServers;
use crate::config::model::ServerDefinition;
use crate::error::BrokerResult;
use crate::mirror::broker_tools::broker_tools;
use crate::mirror::catalogue::{Catalogue, MirrorCaps, MirrorStatus, MirroredTool};
use crate::mirror::sanitize::{proxy_name, sanitize};
use crate::oauth::OAuthEngine;
use crate::session::SessionFactory;
use crate::worker::{self, WorkerHandle};

struct CachedTools {
    tools: Vec<Tool>,
    fetched_at: Instant,
}

/// Builds catalogues on demand, caching per-server tool lists and
/// reusing (or recycling, on config change) per-server upstream workers.
pub struct MirrorBuilder {
    oauth: Arc<OAuthEngine>,
    caps: MirrorCaps,
    idle_ttl: Duration,
    request_timeout: Duration,
    cache_ttl: Duration,
    workers: DashMap<String, WorkerHandle>,
    cache: DashMap<String, CachedTools>,
    build_locks: DashMap<String, Arc<AsyncMutex<()>>>,
    call_locks: DashMap<String, Arc<AsyncMutex<()>>>,
    last_status: Mutex<Option<MirrorStatus>>,
}

impl MirrorBuilder {
    /// Build a catalogue cache backed by `oauth` for credential
    /// injection, applying `caps` and the given timeouts.
    #[must_use]
    pub fn new(oauth: Arc<OAuthEngine>, caps: MirrorCaps, idle_ttl: Duration, request_timeout: Duration, cache_ttl: Duration) -> Self {
        Self {
            oauth,
            caps,
            idle_ttl,
            request_timeout,
            cache_ttl,
            workers: DashMap::new(),
            cache: DashMap::new(),
            build_locks: DashMap::new(),
            call_locks: DashMap::new(),
            last_status: Mutex::new(None),
        }
    }

    fn lock_for(map: &DashMap<String, Arc<AsyncMutex<()>>>, name: &str) -> Arc<AsyncMutex<()>> {
        map.entry(name.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    /// The last completed build's status, for `proxy.mirror_status`.
    #[must_use]
    pub fn status(&self) -> Option<MirrorStatus> {
        self.last_status.lock().clone()
    }

    /// Get (spawning or recycling as needed) the worker for `name`,
    /// invalidating it first if `def`'s fingerprint no longer matches
    /// the running worker's (§4.5 "config-change invalidation").
    pub async fn worker_for(&self, name: &str, def: &ServerDefinition) -> WorkerHandle {
        let fingerprint = worker::fingerprint(def);
        if let Some(existing) = self.workers.get(name) {
            if existing.fingerprint() == fingerprint {
                return existing.clone();
            }
        }
        self.invalidate(name);
        let handle = worker::spawn(name.to_string(), def.clone(), Arc::clone(&self.oauth), self.idle_ttl, self.request_timeout);
        self.workers.insert(name.to_string(), handle.clone());
        handle
    }

    /// Drop the cached worker and tool list for `name`, if any, shutting
    /// the worker down in the background. Called on config-change
    /// detection and by the `proxy.auth_*` handlers after a credential
    /// change (§4.6 table).
    pub fn invalidate(&self, name: &str) {
        self.cache.remove(name);
        if let Some((_, old)) = self.workers.remove(name) {
            tokio::spawn(async move { old.shutdown(Duration::from_secs(5)).await });
        }
    }

    /// Call a tool on `name`'s upstream. Stdio upstreams (with pooling
    /// enabled) are serialized through the long-lived worker; every other
    /// upstream opens a fresh scoped session per call, serialized under a
    /// per-server lock (§4.5 "Non-stdio upstreams").
    pub async fn call(&self, name: &str, def: &ServerDefinition, tool: &str, args: Option<HashMap<String, Value>>) -> BrokerResult<Value> {
        if should_pool(def) {
            let worker = self.worker_for(name, def).await;
            return worker.call_tool(tool, args).await;
        }

        let lock = Self::lock_for(&self.call_locks, name);
        let _guard = lock.lock().await;
        let mut session = SessionFactory::new(&self.oauth).open(name, def).await?;
        session.call_tool(name, tool, args).await
    }

    /// List `name`'s tools directly (bypassing the catalogue cache
    /// ordering, but still served from the same per-server cache),
    /// for `proxy.list_tools`.
    pub async fn list_server_tools(&self, name: &str, def: &ServerDefinition) -> BrokerResult<Vec<Tool>> {
        self.cached_tools(name, def).await
    }

    async fn cached_tools(&self, name: &str, def: &ServerDefinition) -> BrokerResult<Vec<Tool>> {
        if let Some(entry) = self.cache.get(name) {
            if entry.fetched_at.elapsed() < self.cache_ttl {
                return Ok(entry.tools.clone());
            }
        }

        let lock = Self::lock_for(&self.build_locks, name);
        let _guard = lock.lock().await;

        if let Some(entry) = self.cache.get(name) {
            if entry.fetched_at.elapsed() < self.cache_ttl {
                return Ok(entry.tools.clone());
            }
        }

        let tools = if should_pool(def) {
            let handle = self.worker_for(name, def).await;
            handle.list_tools().await?
        } else {
            let mut session = SessionFactory::new(&self.oauth).open(name, def).await?;
            session.list_tools(name).await?
        };
        self.cache.insert(
            name.to_string(),
            CachedTools {
                tools: tools.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(tools)
    }

    /// Shut down every currently-running worker, for broker shutdown
    /// (§4.7 "On shutdown, shut down all workers").
    pub async fn shutdown_all(&self) {
        let handles: Vec<WorkerHandle> = self.workers.iter().map(|e| e.value().clone()).collect();
        for handle in handles {
            handle.shutdown(Duration::from_secs(5)).await;
        }
        self.workers.clear();
        self.cache.clear();
    }

    /// Build a fresh catalogue from `loaded`, applying the ordered caps
    /// of §4.6 and recording the build status for `proxy.mirror_status`.
    pub async fn build(&self, loaded: &LoadedServers) -> Catalogue {
        let mut reasons = Vec::new();
        let mut server_errors = HashMap::new();

        let mut names: Vec<&String> = loaded.servers.keys().collect();
        names.sort();

        let mut server_truncated = false;
        if names.len() > self.caps.max_servers {
            server_truncated = true;
            reasons.push(format!(
                "server cap ({}) reached: {} of {} configured servers mirrored",
                self.caps.max_servers,
                self.caps.max_servers,
                names.len()
            ));
            names.truncate(self.caps.max_servers);
        }

        let mut catalogue = Catalogue {
            broker_tools: broker_tools(),
            ..Catalogue::default()
        };
        let mut seen_names = HashSet::new();
        let mut total = 0usize;
        let mut servers_mirrored = 0usize;
        let mut global_cap_hit = false;

        'servers: for name in names {
            let def = &loaded.servers[name];
            catalogue.sanitized_servers.insert(sanitize(name), name.clone());

            let tools = match self.cached_tools(name, def).await {
                Ok(tools) => tools,
                Err(e) => {
                    server_errors.insert(name.clone(), e.sanitize());
                    continue;
                }
            };

            let mut server_tools = tools;
            if server_tools.len() > self.caps.max_tools_per_server {
                reasons.push(format!(
                    "per-server cap ({}) reached for '{name}': {} of {} tools mirrored",
                    self.caps.max_tools_per_server,
                    self.caps.max_tools_per_server,
                    server_tools.len()
                ));
                server_tools.truncate(self.caps.max_tools_per_server);
            }

            servers_mirrored += 1;
            for mut upstream_tool in server_tools {
                if total >= self.caps.max_total_tools {
                    global_cap_hit = true;
                    break 'servers;
                }

                let proxy = proxy_name(name, &upstream_tool.name, &mut seen_names);
                let original_len = serde_json::to_string(&upstream_tool.input_schema).map(|s| s.len()).unwrap_or(0);
                let schema_truncated = original_len > self.caps.max_schema_bytes;
                if schema_truncated {
                    upstream_tool.input_schema = turbomcp_protocol::types::ToolInputSchema {
                        schema_type: "object".to_string(),
                        properties: None,
                        required: None,
                        additional_properties: Some(true),
                    };
                    reasons.push(format!(
                        "schema cap ({}) reached for '{name}'.'{}': input schema replaced with a permissive passthrough ({original_len} bytes)",
                        self.caps.max_schema_bytes, upstream_tool.name
                    ));
                }

                let mut meta = upstream_tool.meta.take().unwrap_or_default();
                let mut ica_proxy = serde_json::Map::new();
                ica_proxy.insert("upstream_server".to_string(), Value::String(name.clone()));
                ica_proxy.insert("upstream_tool".to_string(), Value::String(upstream_tool.name.clone()));
                if schema_truncated {
                    ica_proxy.insert("schema_truncated".to_string(), Value::Bool(true));
                    ica_proxy.insert("original_schema_bytes".to_string(), Value::from(original_len));
                }
                meta.insert("ica_proxy".to_string(), Value::Object(ica_proxy));

                let tool_name = upstream_tool.name.clone();
                let mirrored = MirroredTool {
                    proxy_name: proxy.clone(),
                    upstream_server: name.clone(),
                    upstream_tool: tool_name.clone(),
                    tool: Tool {
                        name: proxy.clone(),
                        meta: Some(meta),
                        ..upstream_tool
                    },
                };
                catalogue.by_proxy_name.insert(proxy, (name.clone(), tool_name));
                catalogue.mirrored.push(mirrored);
                total += 1;
            }
        }

        if global_cap_hit {
            reasons.push(format!("global tool cap ({}) reached", self.caps.max_total_tools));
        }

        let truncated = server_truncated || global_cap_hit || !reasons.is_empty();
        let status = MirrorStatus {
            servers_mirrored,
            tools_mirrored: total,
            truncated,
            reasons,
            server_errors,
            built_at: SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0),
        };
        *self.last_status.lock() = Some(status);

        catalogue
    }
}

/// §4.5 `_should_pool`: pool only stdio upstreams, and only when pooling
/// hasn't been disabled outright. `ICA_MCP_PROXY_POOL_STDIO` defaults on;
/// `ICA_MCP_PROXY_DISABLE_POOLING` overrides it off regardless of transport.
fn should_pool(def: &ServerDefinition) -> bool {
    def.is_stdio() && env_flag_default_true("ICA_MCP_PROXY_POOL_STDIO") && !env_flag("ICA_MCP_PROXY_DISABLE_POOLING")
}

fn env_flag(name: &str) -> bool {
    matches!(std::env::var(name).as_deref(), Ok("1") | Ok("true") | Ok("True") | Ok("TRUE") | Ok("yes"))
}

fn env_flag_default_true(name: &str) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.as_str(), "1" | "true" | "True" | "TRUE" | "yes"),
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::catalogue::MirrorCaps;
    use crate::token_store::TokenStore;

    fn builder(caps: MirrorCaps) -> MirrorBuilder {
        let dir = tempfile::TempDir::new().unwrap();
        let oauth = Arc::new(OAuthEngine::new(TokenStore::new(dir.path().join("t.json"))));
        MirrorBuilder::new(oauth, caps, Duration::from_secs(90), Duration::from_secs(5), Duration::from_secs(300))
    }

    #[tokio::test]
    async fn build_on_empty_config_has_only_broker_tools() {
        let b = builder(MirrorCaps::default());
        let loaded = LoadedServers::default();
        let catalogue = b.build(&loaded).await;
        assert_eq!(catalogue.mirrored.len(), 0);
        assert_eq!(catalogue.all_tools().len(), 8);
        assert_eq!(b.status().unwrap().tools_mirrored, 0);
    }
}
