//! Persisted OAuth credentials, one [`TokenEntry`] per upstream (§4.2).
//!
//! Secrets never get a plain `Debug` impl — [`secrecy::SecretString`]
//! wraps the token values so an accidental `{:?}` in a log line can't
//! leak a credential.

use std::collections::HashMap;
use std::path::PathBuf;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::config::model::OAuthFlow;
use crate::config::trust::atomic_write_0600;
use crate::error::BrokerResult;

const TOKEN_STORE_VERSION: u32 = 1;
/// Seconds of slack subtracted from `expires_at` before a token is
/// considered expired, absorbing clock skew between the broker and the
/// authorization server.
pub const EXPIRY_SKEW_SECS: i64 = 30;

/// Cached OAuth artifacts for one upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEntry {
    /// The bearer access token.
    pub access_token: SecretString,
    /// Refresh token, if the authorization server issued one.
    #[serde(default)]
    pub refresh_token: Option<SecretString>,
    /// Token type, almost always `Bearer`.
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Space-delimited scope string, if reported.
    #[serde(default)]
    pub scope: Option<String>,
    /// Absolute expiry time (Unix seconds).
    pub expires_at: i64,
    /// When this entry was minted or last refreshed (Unix seconds).
    pub obtained_at: i64,
    /// Which flow produced this entry, so refresh can pick the right path.
    pub grant_type: OAuthFlow,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl TokenEntry {
    /// True when `now >= expires_at - skew`.
    #[must_use]
    pub fn is_expired(&self, now_secs: i64) -> bool {
        now_secs >= self.expires_at - EXPIRY_SKEW_SECS
    }

    /// The access token as a `&str`, for building an `Authorization`
    /// header. Named distinctly from a plain accessor so call sites read
    /// as an intentional secret-exposure point.
    #[must_use]
    pub fn reveal_access_token(&self) -> &str {
        self.access_token.expose_secret()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenDocument {
    version: u32,
    servers: HashMap<String, TokenEntry>,
}

impl Default for TokenDocument {
    fn default() -> Self {
        Self {
            version: TOKEN_STORE_VERSION,
            servers: HashMap::new(),
        }
    }
}

/// `$ICA_HOME/mcp-tokens.json`, atomic-write, tolerant of a missing or
/// corrupt file (a half-read credentials file must never be surfaced as
/// an error — it is simply treated as empty, per §4.2).
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    /// Bind to the token store file at `path`, without reading it yet.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn load(&self) -> TokenDocument {
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default()
    }

    /// Fetch the entry for `server`, if one is cached.
    #[must_use]
    pub fn get(&self, server: &str) -> Option<TokenEntry> {
        self.load().servers.get(server).cloned()
    }

    /// Insert or replace the entry for `server`.
    pub fn put(&self, server: &str, entry: TokenEntry) -> BrokerResult<()> {
        let mut doc = self.load();
        doc.servers.insert(server.to_string(), entry);
        self.persist(&doc)
    }

    /// Delete the cached entry for `server`, if any.
    pub fn delete(&self, server: &str) -> BrokerResult<()> {
        let mut doc = self.load();
        doc.servers.remove(server);
        self.persist(&doc)
    }

    fn persist(&self, doc: &TokenDocument) -> BrokerResult<()> {
        let text = serde_json::to_string_pretty(doc)?;
        atomic_write_0600(&self.path, text.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_entry(now: i64) -> TokenEntry {
        TokenEntry {
            access_token: SecretString::from("at-123".to_string()),
            refresh_token: Some(SecretString::from("rt-456".to_string())),
            token_type: "Bearer".to_string(),
            scope: Some("read write".to_string()),
            expires_at: now + 3600,
            obtained_at: now,
            grant_type: OAuthFlow::Pkce,
        }
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = TokenStore::new(dir.path().join("mcp-tokens.json"));
        store.put("demo", sample_entry(1_000)).unwrap();
        let got = store.get("demo").unwrap();
        assert_eq!(got.reveal_access_token(), "at-123");
        assert!(!got.is_expired(1_000));
    }

    #[test]
    fn delete_removes_entry() {
        let dir = TempDir::new().unwrap();
        let store = TokenStore::new(dir.path().join("mcp-tokens.json"));
        store.put("demo", sample_entry(1_000)).unwrap();
        store.delete("demo").unwrap();
        assert!(store.get("demo").is_none());
    }

    #[test]
    fn missing_file_reads_as_empty_store() {
        let dir = TempDir::new().unwrap();
        let store = TokenStore::new(dir.path().join("does-not-exist.json"));
        assert!(store.get("demo").is_none());
    }

    #[test]
    fn corrupt_file_reads_as_empty_store() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mcp-tokens.json");
        std::fs::write(&path, "not json at all").unwrap();
        let store = TokenStore::new(path);
        assert!(store.get("demo").is_none());
    }

    #[test]
    fn expiry_respects_skew() {
        let entry = sample_entry(1_000);
        assert!(!entry.is_expired(1_000 + 3600 - 31));
        assert!(entry.is_expired(1_000 + 3600 - 29));
    }
}
