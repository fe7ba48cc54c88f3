//! Trust store: gates project-sourced subprocess servers behind a
//! user-granted acknowledgment tied to a content hash.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::BrokerResult;
use crate::util::hex_encode;

const TRUST_STORE_VERSION: u32 = 1;

/// A single trust grant for a project root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustEntry {
    /// SHA-256 of `.mcp.json` at the time trust was granted.
    pub mcp_sha256: Option<String>,
    /// Unix timestamp (seconds) trust was granted.
    pub trusted_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TrustDocument {
    version: u32,
    projects: HashMap<String, TrustEntry>,
}

impl Default for TrustDocument {
    fn default() -> Self {
        Self {
            version: TRUST_STORE_VERSION,
            projects: HashMap::new(),
        }
    }
}

/// Reports whether a project is currently trusted, for `trust-status`.
#[derive(Debug, Clone)]
pub struct TrustStatus {
    /// Whether the project root currently passes the trust check.
    pub trusted: bool,
    /// The stored entry, if one exists (regardless of whether it still
    /// matches the current hash).
    pub entry: Option<TrustEntry>,
}

/// Atomic-write JSON store of per-project trust grants.
pub struct TrustStore {
    path: PathBuf,
    document: TrustDocument,
}

impl TrustStore {
    /// Open (or create, in memory, pending the first write) the trust
    /// store at `path`. Malformed or missing files are tolerated and
    /// treated as an empty store — trust decisions must never fail
    /// closed due to a read error blowing up the broker.
    pub fn open(path: PathBuf) -> BrokerResult<Self> {
        let document = std::fs::read_to_string(&path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default();
        Ok(Self { path, document })
    }

    /// True iff an entry exists for `project_root` AND (no hash was
    /// recorded OR the current hash, if supplied, matches the stored
    /// one).
    #[must_use]
    pub fn is_trusted(&self, project_root: &Path, current_sha256: Option<&str>) -> bool {
        let key = canonical_key(project_root);
        match self.document.projects.get(&key) {
            None => false,
            Some(entry) => match (&entry.mcp_sha256, current_sha256) {
                (None, _) => true,
                (Some(stored), Some(current)) => stored == current,
                (Some(_), None) => false,
            },
        }
    }

    /// Look up trust status for reporting, without the gate's
    /// all-or-nothing boolean.
    #[must_use]
    pub fn status(&self, project_root: &Path, current_sha256: Option<&str>) -> TrustStatus {
        let key = canonical_key(project_root);
        let entry = self.document.projects.get(&key).cloned();
        let trusted = self.is_trusted(project_root, current_sha256);
        TrustStatus { trusted, entry }
    }

    /// Grant trust to `project_root`, recording the SHA-256 of its
    /// current `.mcp.json` (if present) so future edits invalidate it.
    pub fn trust(&mut self, project_root: &Path, now_secs: u64) -> BrokerResult<()> {
        let key = canonical_key(project_root);
        let hash = hash_mcp_json(project_root);
        self.document.projects.insert(
            key,
            TrustEntry {
                mcp_sha256: hash,
                trusted_at: now_secs,
            },
        );
        self.persist()
    }

    /// Revoke trust for `project_root`.
    pub fn untrust(&mut self, project_root: &Path) -> BrokerResult<()> {
        let key = canonical_key(project_root);
        self.document.projects.remove(&key);
        self.persist()
    }

    fn persist(&self) -> BrokerResult<()> {
        let text = serde_json::to_string_pretty(&self.document)?;
        atomic_write_0600(&self.path, text.as_bytes())
    }
}

fn canonical_key(project_root: &Path) -> String {
    std::fs::canonicalize(project_root)
        .unwrap_or_else(|_| project_root.to_path_buf())
        .to_string_lossy()
        .into_owned()
}

fn hash_mcp_json(project_root: &Path) -> Option<String> {
    let text = std::fs::read_to_string(project_root.join(".mcp.json")).ok()?;
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    Some(hex_encode(hasher.finalize()))
}

/// Write `contents` to `path` via tempfile-plus-rename with mode
/// `0600`, so partial writes are never observable (§3 invariant: "Token
/// store and trust store files are atomically replaced").
pub fn atomic_write_0600(path: &Path, contents: &[u8]) -> BrokerResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    std::io::Write::write_all(&mut tmp, contents)?;
    tmp.flush()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600))?;
    }

    tmp.persist(path)
        .map_err(|e| crate::error::BrokerError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn trust_and_untrust_round_trip() {
        let dir = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        let store_path = dir.path().join("mcp-trust.json");

        let mut store = TrustStore::open(store_path.clone()).unwrap();
        assert!(!store.is_trusted(project.path(), None));

        store.trust(project.path(), 1_000).unwrap();
        assert!(store.is_trusted(project.path(), None));

        let reopened = TrustStore::open(store_path).unwrap();
        assert!(reopened.is_trusted(project.path(), None));

        let mut store = reopened;
        store.untrust(project.path()).unwrap();
        assert!(!store.is_trusted(project.path(), None));
    }

    #[test]
    fn trust_invalidated_by_content_change() {
        let project = TempDir::new().unwrap();
        std::fs::write(project.path().join(".mcp.json"), r#"{"mcpServers":{}}"#).unwrap();

        let dir = TempDir::new().unwrap();
        let mut store = TrustStore::open(dir.path().join("mcp-trust.json")).unwrap();
        store.trust(project.path(), 1_000).unwrap();

        let current_hash = hash_mcp_json(project.path());
        assert!(store.is_trusted(project.path(), current_hash.as_deref()));

        std::fs::write(project.path().join(".mcp.json"), r#"{"mcpServers":{"x":{}}}"#).unwrap();
        let new_hash = hash_mcp_json(project.path());
        assert_ne!(current_hash, new_hash);
        assert!(!store.is_trusted(project.path(), new_hash.as_deref()));
    }

    #[test]
    fn malformed_store_file_treated_as_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mcp-trust.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = TrustStore::open(path).unwrap();
        assert!(!store.is_trusted(Path::new("/nonexistent"), None));
    }
}
