//! Crate-level end-to-end scenarios, matching the shape of
//! `turbomcp-proxy`'s `tests/integration_tests.rs`: exercise the public
//! surface (config loading, trust gating, catalogue building) the way a
//! real invocation would, without spawning the stdio server loop itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tempfile::TempDir;

use ica_mcp_proxy::config::loader::ConfigLoader;
use ica_mcp_proxy::config::trust::TrustStore;
use ica_mcp_proxy::mirror::{MirrorBuilder, MirrorCaps};
use ica_mcp_proxy::oauth::OAuthEngine;
use ica_mcp_proxy::token_store::TokenStore;

fn builder(caps: MirrorCaps) -> MirrorBuilder {
    let dir = TempDir::new().unwrap();
    let oauth = Arc::new(OAuthEngine::new(TokenStore::new(dir.path().join("tokens.json"))));
    MirrorBuilder::new(oauth, caps, Duration::from_secs(90), Duration::from_secs(5), Duration::from_secs(300))
}

/// Every environment-variable-driven scenario lives in this single test
/// function so they run sequentially within one process; `MCP_CONFIG`,
/// `ICA_MCP_STRICT_TRUST` and friends are process-global and would race
/// against each other if split across parallel `#[test]` functions.
#[tokio::test(flavor = "current_thread")]
async fn env_driven_scenarios_run_in_sequence() {
    empty_config_scenario().await;
    strict_trust_scenario().await;
}

/// §8 E2E scenario 1: an empty `MCP_CONFIG` yields no servers and a
/// catalogue containing exactly the eight broker tools.
async fn empty_config_scenario() {
    unsafe { std::env::set_var("MCP_CONFIG", r#"{"mcpServers":{}}"#) };
    unsafe { std::env::remove_var("MCP_CONFIG_PATH") };

    let loader = ConfigLoader::new(std::env::current_dir().unwrap());
    let loaded = loader.load().unwrap();

    assert!(loaded.servers.is_empty());
    assert_eq!(loaded.sources, vec![ica_mcp_proxy::config::loader::ConfigSource::EnvInline]);
    assert!(loaded.blocked_servers.is_empty());

    let mirror = builder(MirrorCaps::default());
    let catalogue = mirror.build(&loaded).await;
    assert_eq!(catalogue.mirrored.len(), 0);
    assert_eq!(catalogue.all_tools().len(), 8);
    for tool in catalogue.all_tools() {
        assert!(tool.name.starts_with("proxy."));
    }

    unsafe { std::env::remove_var("MCP_CONFIG") };
}

/// §8 E2E scenario 5: a project-sourced stdio server is blocked under
/// strict trust until the project root is explicitly trusted.
async fn strict_trust_scenario() {
    let project = TempDir::new().unwrap();
    let ica_home = TempDir::new().unwrap();
    std::fs::write(
        project.path().join(".mcp.json"),
        r#"{"mcpServers":{"x":{"command":"echo","args":["hi"]}}}"#,
    )
    .unwrap();

    unsafe { std::env::remove_var("MCP_CONFIG") };
    unsafe { std::env::remove_var("MCP_CONFIG_PATH") };
    unsafe { std::env::set_var("ICA_MCP_STRICT_TRUST", "1") };
    unsafe { std::env::remove_var("ICA_MCP_ALLOW_PROJECT_STDIO") };

    let loader = ConfigLoader::new(project.path().to_path_buf()).with_ica_home(ica_home.path().to_path_buf());
    let loaded = loader.load().unwrap();

    assert!(!loaded.servers.contains_key("x"));
    assert!(loaded.blocked_servers.contains_key("x"));

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs();
    let mut trust_store = TrustStore::open(loader.trust_path()).unwrap();
    trust_store.trust(project.path(), now).unwrap();

    let loaded_again = loader.load().unwrap();
    assert!(loaded_again.servers.contains_key("x"));
    assert!(loaded_again.blocked_servers.is_empty());

    unsafe { std::env::remove_var("ICA_MCP_STRICT_TRUST") };
}

/// A server definition that can never be reached still yields a usable
/// catalogue: the failure is recorded per-server rather than aborting
/// the whole build (§4.6 "errors are per-server, not fatal").
#[tokio::test(flavor = "current_thread")]
async fn unreachable_server_is_recorded_as_a_per_server_error_not_a_fatal_one() {
    let mut servers = HashMap::new();
    servers.insert(
        "bad".to_string(),
        serde_json::from_value::<ica_mcp_proxy::config::model::ServerDefinition>(serde_json::json!({
            "command": "/no/such/binary-ica-mcp-proxy-test",
            "args": [],
        }))
        .unwrap(),
    );
    let loaded = ica_mcp_proxy::config::loader::LoadedServers {
        servers,
        ..Default::default()
    };

    let mirror = builder(MirrorCaps::default());
    let catalogue = mirror.build(&loaded).await;

    assert_eq!(catalogue.mirrored.len(), 0);
    assert_eq!(catalogue.all_tools().len(), 8);
    let status = mirror.status().unwrap();
    assert!(status.server_errors.contains_key("bad"));
}

/// `proxy.mirror_status` reports zero servers/tools before any build
/// has run, matching the CLI's `mirror-status` output on a fresh
/// process (§6 "status before first build").
#[test]
fn mirror_status_is_none_before_the_first_build() {
    let builder = builder(MirrorCaps::default());
    assert!(builder.status().is_none());
}
