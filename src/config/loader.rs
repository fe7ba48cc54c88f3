//! Discover, parse, merge, and expand upstream server definitions.
//!
//! Precedence and source resolution follow §4.1 exactly: the two
//! override environment variables short-circuit everything else; absent
//! those, `project` and `home` layers merge (direction controlled by
//! `ICA_MCP_CONFIG_PREFER_HOME`), falling back to `~/.claude.json` only
//! when both are absent.

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::model::ServerDefinition;
use crate::config::trust::TrustStore;
use crate::error::{BrokerError, BrokerResult};

/// Where a given server definition (or the merge decision itself) came
/// from, for `proxy.list_servers` reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    /// `MCP_CONFIG` inline JSON override.
    EnvInline,
    /// `MCP_CONFIG_PATH` file override.
    EnvFile,
    /// Project-local `.mcp.json`.
    Project,
    /// `$ICA_HOME/mcp-servers.json` or `mcp.json`.
    Home,
    /// Legacy `~/.claude.json` compatibility fallback.
    ClaudeCompat,
}

impl ConfigSource {
    /// Human-readable tag, as reported by `proxy.list_servers`'s
    /// `sources` list (e.g. `"env:MCP_CONFIG"`).
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            Self::EnvInline => "env:MCP_CONFIG",
            Self::EnvFile => "env:MCP_CONFIG_PATH",
            Self::Project => "project:.mcp.json",
            Self::Home => "home:mcp-servers.json",
            Self::ClaudeCompat => "compat:~/.claude.json",
        }
    }
}

/// The merged view of all configured upstream servers.
#[derive(Debug, Clone, Default)]
pub struct LoadedServers {
    /// Active server definitions, keyed by name.
    pub servers: HashMap<String, ServerDefinition>,
    /// Ordered list of sources that contributed to this view.
    pub sources: Vec<ConfigSource>,
    /// Which source each surviving server name came from.
    pub server_sources: HashMap<String, ConfigSource>,
    /// Servers removed by the strict-trust gate, with a reason.
    pub blocked_servers: HashMap<String, String>,
    /// Absolute project root the `project` layer was read from, if any.
    pub project_root: Option<PathBuf>,
    /// SHA-256 of the project's `.mcp.json` at load time, if a project
    /// layer was present.
    pub project_mcp_sha256: Option<String>,
}

/// Resolve `$ICA_HOME`: explicit env var, else infer from the on-disk
/// skill install layout `<home>/skills/<name>/scripts/<file>`, accepted
/// only when a `VERSION` marker exists at the inferred root.
#[must_use]
pub fn resolve_ica_home() -> Option<PathBuf> {
    if let Ok(home) = env::var("ICA_HOME") {
        if !home.is_empty() {
            return Some(PathBuf::from(home));
        }
    }

    let exe = env::current_exe().ok()?;
    let mut dir = exe.parent()?;
    // Walk up looking for .../skills/<name>/scripts, accepting the
    // grandparent-of-grandparent as ICA_HOME when a VERSION file marks it.
    loop {
        if dir.file_name().and_then(|n| n.to_str()) == Some("scripts") {
            let skill_dir = dir.parent()?;
            if skill_dir.file_name().is_some() {
                let skills_dir = skill_dir.parent()?;
                if skills_dir.file_name().and_then(|n| n.to_str()) == Some("skills") {
                    let candidate = skills_dir.parent()?;
                    if candidate.join("VERSION").is_file() {
                        return Some(candidate.to_path_buf());
                    }
                }
            }
        }
        dir = dir.parent()?;
    }
}

/// Loads and merges server definitions from every configured source.
pub struct ConfigLoader {
    ica_home: Option<PathBuf>,
    project_dir: PathBuf,
}

impl ConfigLoader {
    /// Build a loader rooted at the given project directory (normally
    /// the process's current working directory).
    #[must_use]
    pub fn new(project_dir: PathBuf) -> Self {
        Self {
            ica_home: resolve_ica_home(),
            project_dir,
        }
    }

    /// Override the resolved `$ICA_HOME`, primarily for tests.
    #[must_use]
    pub fn with_ica_home(mut self, home: PathBuf) -> Self {
        self.ica_home = Some(home);
        self
    }

    /// Load and merge every source, apply placeholder expansion, and run
    /// the strict-trust gate.
    pub fn load(&self) -> BrokerResult<LoadedServers> {
        let mut loaded = self.load_raw()?;
        expand_placeholders_in_servers(&mut loaded.servers);
        self.apply_strict_trust(&mut loaded)?;
        Ok(loaded)
    }

    fn load_raw(&self) -> BrokerResult<LoadedServers> {
        if let Ok(inline) = env::var("MCP_CONFIG") {
            let servers = parse_servers_document(&inline)?;
            return Ok(single_source(servers, ConfigSource::EnvInline));
        }
        if let Ok(path) = env::var("MCP_CONFIG_PATH") {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| BrokerError::configuration_key(e.to_string(), "MCP_CONFIG_PATH"))?;
            let servers = parse_servers_document(&text)?;
            return Ok(single_source(servers, ConfigSource::EnvFile));
        }

        let project_path = self.project_dir.join(".mcp.json");
        let project = read_servers_file(&project_path)?;
        let project_hash = project.as_ref().map(|_| {
            let text = std::fs::read_to_string(&project_path).unwrap_or_default();
            hex_sha256(&text)
        });

        let home = self.read_home_layer()?;

        if project.is_none() && home.is_none() {
            if let Some(compat) = self.read_claude_compat()? {
                return Ok(single_source(compat, ConfigSource::ClaudeCompat));
            }
        }

        let prefer_home = env_flag("ICA_MCP_CONFIG_PREFER_HOME");

        let mut servers = HashMap::new();
        let mut server_sources = HashMap::new();
        let mut sources = Vec::new();

        let (base, base_src, overlay, overlay_src) = if prefer_home {
            (project, ConfigSource::Project, home, ConfigSource::Home)
        } else {
            (home, ConfigSource::Home, project, ConfigSource::Project)
        };

        if let Some(base) = base {
            sources.push(base_src);
            for (name, def) in base {
                server_sources.insert(name.clone(), base_src);
                servers.insert(name, def);
            }
        }
        if let Some(overlay) = overlay {
            sources.push(overlay_src);
            for (name, def) in overlay {
                server_sources.insert(name.clone(), overlay_src);
                servers.insert(name, def);
            }
        }

        Ok(LoadedServers {
            servers,
            sources,
            server_sources,
            blocked_servers: HashMap::new(),
            project_root: Some(self.project_dir.clone()),
            project_mcp_sha256: project_hash,
        })
    }

    fn read_home_layer(&self) -> BrokerResult<Option<HashMap<String, ServerDefinition>>> {
        let Some(home) = &self.ica_home else {
            return Ok(None);
        };
        for name in ["mcp-servers.json", "mcp.json"] {
            let path = home.join(name);
            if let Some(servers) = read_servers_file(&path)? {
                return Ok(Some(servers));
            }
        }
        Ok(None)
    }

    fn read_claude_compat(&self) -> BrokerResult<Option<HashMap<String, ServerDefinition>>> {
        let Some(home_dir) = dirs_home() else {
            return Ok(None);
        };
        read_servers_file(&home_dir.join(".claude.json"))
    }

    fn apply_strict_trust(&self, loaded: &mut LoadedServers) -> BrokerResult<()> {
        if !env_flag("ICA_MCP_STRICT_TRUST") || env_flag("ICA_MCP_ALLOW_PROJECT_STDIO") {
            return Ok(());
        }

        let trust_store = TrustStore::open(self.trust_path())?;
        let trusted = trust_store.is_trusted(&self.project_dir, loaded.project_mcp_sha256.as_deref());

        if trusted {
            return Ok(());
        }

        let mut blocked = Vec::new();
        for (name, def) in &loaded.servers {
            let from_project = loaded.server_sources.get(name) == Some(&ConfigSource::Project);
            if from_project && def.is_stdio() {
                blocked.push(name.clone());
            }
        }
        for name in blocked {
            loaded.servers.remove(&name);
            loaded.blocked_servers.insert(
                name,
                "project-sourced subprocess server blocked by strict trust policy; run `trust` to allow it".to_string(),
            );
        }
        Ok(())
    }

    /// Path to the trust store file, honoring `ICA_MCP_TRUST_PATH`.
    #[must_use]
    pub fn trust_path(&self) -> PathBuf {
        if let Ok(p) = env::var("ICA_MCP_TRUST_PATH") {
            return PathBuf::from(p);
        }
        self.ica_home
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mcp-trust.json")
    }

    /// Path to the token store file.
    #[must_use]
    pub fn token_path(&self) -> PathBuf {
        self.ica_home
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mcp-tokens.json")
    }
}

fn single_source(servers: HashMap<String, ServerDefinition>, source: ConfigSource) -> LoadedServers {
    let server_sources = servers.keys().map(|k| (k.clone(), source)).collect();
    LoadedServers {
        servers,
        sources: vec![source],
        server_sources,
        blocked_servers: HashMap::new(),
        project_root: None,
        project_mcp_sha256: None,
    }
}

fn read_servers_file(path: &Path) -> BrokerResult<Option<HashMap<String, ServerDefinition>>> {
    if !path.is_file() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(path)
        .map_err(|e| BrokerError::configuration_key(e.to_string(), path.display().to_string()))?;
    Ok(Some(parse_servers_document(&text)?))
}

/// Parse a servers document: either `{"mcpServers": {...}}` or a bare
/// map, dropping entries that are neither objects nor carry `command`/`url`.
fn parse_servers_document(text: &str) -> BrokerResult<HashMap<String, ServerDefinition>> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| BrokerError::configuration(e.to_string()))?;

    let map = match value {
        serde_json::Value::Object(mut obj) => {
            if let Some(inner) = obj.remove("mcpServers") {
                inner
            } else {
                serde_json::Value::Object(obj)
            }
        }
        other => other,
    };

    let serde_json::Value::Object(map) = map else {
        return Err(BrokerError::configuration("expected an object of server definitions"));
    };

    let mut out = HashMap::new();
    for (name, value) in map {
        if name == "proxy" {
            continue;
        }
        if !is_valid_server_name(&name) {
            continue;
        }
        let serde_json::Value::Object(obj) = &value else {
            continue;
        };
        if !obj.contains_key("command") && !obj.contains_key("url") {
            continue;
        }
        match serde_json::from_value::<ServerDefinition>(value) {
            Ok(def) => {
                out.insert(name, def);
            }
            Err(_) => continue,
        }
    }
    Ok(out)
}

fn is_valid_server_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// Replace `${VAR}` placeholders (uppercase/digits/underscore) in every
/// string value, recursively through the definitions' `extra_params` and
/// known string fields. Unknown placeholders are left literal.
fn expand_placeholders_in_servers(servers: &mut HashMap<String, ServerDefinition>) {
    for def in servers.values_mut() {
        expand_in_definition(def);
    }
}

fn expand_in_definition(def: &mut ServerDefinition) {
    use crate::config::model::Transport;
    match &mut def.transport {
        Transport::Stdio { command, args, env: envs, cwd } => {
            *command = expand_placeholder(command);
            for a in args.iter_mut() {
                *a = expand_placeholder(a);
            }
            for v in envs.values_mut() {
                *v = expand_placeholder(v);
            }
            if let Some(c) = cwd {
                *c = expand_placeholder(c);
            }
        }
        Transport::Remote { url, headers, api_key, .. } => {
            *url = expand_placeholder(url);
            for v in headers.values_mut() {
                *v = expand_placeholder(v);
            }
            if let Some(k) = api_key {
                *k = expand_placeholder(k);
            }
        }
    }
    for v in def.extra_params.values_mut() {
        expand_in_json_value(v);
    }
}

fn expand_in_json_value(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::String(s) => *s = expand_placeholder(s),
        serde_json::Value::Array(arr) => arr.iter_mut().for_each(expand_in_json_value),
        serde_json::Value::Object(obj) => obj.values_mut().for_each(expand_in_json_value),
        _ => {}
    }
}

/// Replace `${VAR}` with the environment value of `VAR`, leaving
/// unresolved placeholders untouched.
#[must_use]
pub fn expand_placeholder(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    loop {
        let Some(start) = rest.find("${") else {
            out.push_str(rest);
            break;
        };
        let (before, after_marker) = rest.split_at(start);
        out.push_str(before);
        let after_marker = &after_marker[2..];
        let Some(end) = after_marker.find('}') else {
            out.push_str("${");
            out.push_str(after_marker);
            break;
        };
        let var = &after_marker[..end];
        if !var.is_empty() && var.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_') {
            if let Ok(value) = env::var(var) {
                out.push_str(&value);
            } else {
                out.push_str("${");
                out.push_str(var);
                out.push('}');
            }
        } else {
            out.push_str("${");
            out.push_str(var);
            out.push('}');
        }
        rest = &after_marker[end + 1..];
    }
    out
}

fn env_flag(name: &str) -> bool {
    matches!(
        env::var(name).as_deref(),
        Ok("1") | Ok("true") | Ok("True") | Ok("TRUE") | Ok("yes")
    )
}

fn hex_sha256(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    crate::util::hex_encode(hasher.finalize())
}

fn dirs_home() -> Option<PathBuf> {
    env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_placeholder_substitutes_known_var() {
        unsafe { env::set_var("BROKER_TEST_VAR", "hello") };
        assert_eq!(expand_placeholder("value=${BROKER_TEST_VAR}!"), "value=hello!");
        unsafe { env::remove_var("BROKER_TEST_VAR") };
    }

    #[test]
    fn expand_placeholder_leaves_unknown_var_literal() {
        assert_eq!(
            expand_placeholder("value=${BROKER_TEST_MISSING_VAR}"),
            "value=${BROKER_TEST_MISSING_VAR}"
        );
    }

    #[test]
    fn parse_servers_document_accepts_mcp_servers_wrapper() {
        let text = r#"{"mcpServers": {"demo": {"command": "python", "args": ["s.py"]}}}"#;
        let servers = parse_servers_document(text).unwrap();
        assert!(servers.contains_key("demo"));
    }

    #[test]
    fn parse_servers_document_accepts_bare_map() {
        let text = r#"{"demo": {"command": "python"}}"#;
        let servers = parse_servers_document(text).unwrap();
        assert!(servers.contains_key("demo"));
    }

    #[test]
    fn parse_servers_document_drops_reserved_proxy_name() {
        let text = r#"{"proxy": {"command": "python"}, "demo": {"command": "python"}}"#;
        let servers = parse_servers_document(text).unwrap();
        assert!(!servers.contains_key("proxy"));
        assert!(servers.contains_key("demo"));
    }

    #[test]
    fn parse_servers_document_drops_entries_missing_command_and_url() {
        let text = r#"{"demo": {"oauth": {}}}"#;
        let servers = parse_servers_document(text).unwrap();
        assert!(servers.is_empty());
    }
}
