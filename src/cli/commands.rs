//! Subcommand implementations (§10.3).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::Subcommand;
use colored::Colorize;

use crate::broker::BrokerServer;
use crate::config::loader::ConfigLoader;
use crate::config::trust::TrustStore;
use crate::error::{BrokerError, BrokerResult};
use crate::mirror::{MirrorBuilder, MirrorCaps};
use crate::oauth::OAuthEngine;
use crate::token_store::TokenStore;

/// All subcommands (§10.3).
#[derive(Debug, Subcommand, PartialEq, Eq)]
pub enum Command {
    /// Run the broker's stdio MCP server loop (the default).
    Serve,

    /// Print the merged view of configured upstream servers.
    Servers,

    /// Grant trust to a project root, allowing its subprocess servers
    /// under the strict-trust gate.
    Trust {
        /// Project root to trust; defaults to the current directory.
        path: Option<PathBuf>,
    },

    /// Report whether a project root is currently trusted.
    TrustStatus {
        /// Project root to check; defaults to the current directory.
        path: Option<PathBuf>,
    },

    /// Revoke trust for a project root.
    Untrust {
        /// Project root to untrust; defaults to the current directory.
        path: Option<PathBuf>,
    },

    /// Build the tool catalogue once and print its status, without
    /// serving.
    MirrorStatus,

    /// Print the cached credentials for a server (access token redacted).
    Token {
        /// Server name as it appears in the merged config.
        server: String,
    },

    /// Delete the cached credentials for a server.
    Logout {
        /// Server name as it appears in the merged config.
        server: String,
    },
}

impl Command {
    /// Dispatch to this command's implementation.
    pub async fn execute(self) -> BrokerResult<()> {
        match self {
            Command::Serve => serve().await,
            Command::Servers => servers(),
            Command::Trust { path } => trust(path),
            Command::TrustStatus { path } => trust_status(path),
            Command::Untrust { path } => untrust(path),
            Command::MirrorStatus => mirror_status().await,
            Command::Token { server } => token(&server),
            Command::Logout { server } => logout(&server),
        }
    }
}

fn project_dir(path: Option<PathBuf>) -> BrokerResult<PathBuf> {
    match path {
        Some(p) => Ok(p),
        None => std::env::current_dir().map_err(BrokerError::from),
    }
}

fn loader_for(path: Option<PathBuf>) -> BrokerResult<ConfigLoader> {
    Ok(ConfigLoader::new(project_dir(path)?))
}

async fn serve() -> BrokerResult<()> {
    let loader = ConfigLoader::new(std::env::current_dir()?);
    let token_store = TokenStore::new(loader.token_path());
    let oauth = Arc::new(OAuthEngine::new(token_store));

    let caps = MirrorCaps {
        max_servers: env_usize("ICA_MCP_PROXY_MAX_SERVERS", 25),
        max_tools_per_server: env_usize("ICA_MCP_PROXY_MAX_TOOLS_PER_SERVER", 200),
        max_total_tools: env_usize("ICA_MCP_PROXY_MAX_TOTAL_TOOLS", 2000),
        max_schema_bytes: env_usize("ICA_MCP_PROXY_MAX_SCHEMA_BYTES", 65_536),
    };
    let idle_ttl = Duration::from_secs(env_u64("ICA_MCP_PROXY_UPSTREAM_IDLE_TTL_S", 90));
    let request_timeout = Duration::from_secs(env_u64("ICA_MCP_PROXY_UPSTREAM_REQUEST_TIMEOUT_S", 120));
    let cache_ttl = Duration::from_secs(env_u64("ICA_MCP_PROXY_TOOL_CACHE_TTL_S", 300));

    let mirror = MirrorBuilder::new(Arc::clone(&oauth), caps, idle_ttl, request_timeout, cache_ttl);
    let server = BrokerServer::new(loader, mirror, oauth);
    server.run().await
}

fn servers() -> BrokerResult<()> {
    let loader = ConfigLoader::new(std::env::current_dir()?);
    let loaded = loader.load()?;

    let mut names: Vec<&String> = loaded.servers.keys().collect();
    names.sort();
    println!("{}", "configured servers".bold());
    for name in names {
        let source = loaded.server_sources.get(name).map(|s| s.tag()).unwrap_or("unknown");
        println!("  {name}  ({source})");
    }
    if !loaded.blocked_servers.is_empty() {
        println!("{}", "blocked by trust gate".yellow().bold());
        for (name, reason) in &loaded.blocked_servers {
            println!("  {name}: {reason}");
        }
    }
    Ok(())
}

fn trust(path: Option<PathBuf>) -> BrokerResult<()> {
    let loader = loader_for(path.clone())?;
    let dir = project_dir(path)?;
    let mut store = TrustStore::open(loader.trust_path())?;
    let now = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    store.trust(&dir, now)?;
    println!("{} {}", "trusted".green().bold(), dir.display());
    Ok(())
}

fn untrust(path: Option<PathBuf>) -> BrokerResult<()> {
    let loader = loader_for(path.clone())?;
    let dir = project_dir(path)?;
    let mut store = TrustStore::open(loader.trust_path())?;
    store.untrust(&dir)?;
    println!("{} {}", "untrusted".yellow().bold(), dir.display());
    Ok(())
}

fn trust_status(path: Option<PathBuf>) -> BrokerResult<()> {
    let loader = loader_for(path.clone())?;
    let dir = project_dir(path)?;
    let loaded = loader.load()?;
    let store = TrustStore::open(loader.trust_path())?;
    let status = store.status(&dir, loaded.project_mcp_sha256.as_deref());

    if status.trusted {
        println!("{} {}", "trusted".green().bold(), dir.display());
    } else {
        println!("{} {}", "not trusted".red().bold(), dir.display());
    }
    if let Some(entry) = status.entry {
        println!("  trusted_at: {}", entry.trusted_at);
    }
    Ok(())
}

async fn mirror_status() -> BrokerResult<()> {
    let loader = ConfigLoader::new(std::env::current_dir()?);
    let loaded = loader.load()?;
    let token_store = TokenStore::new(loader.token_path());
    let oauth = Arc::new(OAuthEngine::new(token_store));
    let mirror = MirrorBuilder::new(
        oauth,
        MirrorCaps::default(),
        Duration::from_secs(90),
        Duration::from_secs(120),
        Duration::from_secs(300),
    );
    mirror.build(&loaded).await;
    let status = mirror.status().expect("build() always records a status");
    println!("{}", serde_json::to_string_pretty(&status)?);
    mirror.shutdown_all().await;
    Ok(())
}

fn token(server: &str) -> BrokerResult<()> {
    let loader = ConfigLoader::new(std::env::current_dir()?);
    let store = TokenStore::new(loader.token_path());
    match store.get(server) {
        Some(entry) => {
            println!("{server}:");
            println!("  token_type: {}", entry.token_type);
            println!("  scope: {}", entry.scope.as_deref().unwrap_or("(none)"));
            println!("  grant_type: {:?}", entry.grant_type);
            println!("  expires_at: {}", entry.expires_at);
            println!("  access_token: {}", "<redacted>".dimmed());
        }
        None => println!("{server}: no cached credentials"),
    }
    Ok(())
}

fn logout(server: &str) -> BrokerResult<()> {
    let loader = ConfigLoader::new(std::env::current_dir()?);
    TokenStore::new(loader.token_path()).delete(server)?;
    println!("{} {server}", "logged out".green().bold());
    Ok(())
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
