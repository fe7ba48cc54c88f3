//! Ties discovery, the three flows, and the token store together:
//! `proxy.auth_start`/`auth_status`/`auth_refresh`/`auth_logout` and the
//! just-in-time header injection every upstream call goes through.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use secrecy::ExposeSecret;

use crate::config::model::{OAuthConfig, OAuthFlow, ServerDefinition, Transport};
use crate::error::{BrokerError, BrokerResult};
use crate::oauth::discovery::DiscoveryFetcher;
use crate::oauth::token::MintedToken;
use crate::oauth::{client_credentials, device, pkce};
use crate::token_store::{TokenEntry, TokenStore};

/// Resolved, flow-agnostic endpoint set (either read straight off the
/// config or fetched via OIDC discovery).
struct ResolvedEndpoints {
    authorization_url: Option<String>,
    token_url: String,
    device_authorization_url: Option<String>,
}

/// Owns the token store and OIDC discovery cache, and runs every OAuth
/// flow on demand.
pub struct OAuthEngine {
    http: reqwest::Client,
    discovery: DiscoveryFetcher,
    token_store: TokenStore,
}

impl OAuthEngine {
    /// Build an engine persisting tokens at `token_store_path`.
    #[must_use]
    pub fn new(token_store: TokenStore) -> Self {
        Self {
            http: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .expect("reqwest client builder with static config never fails"),
            discovery: DiscoveryFetcher::new(),
            token_store,
        }
    }

    async fn resolve_endpoints(&self, oauth: &OAuthConfig) -> BrokerResult<ResolvedEndpoints> {
        if oauth.flow.uses_discovery() {
            let issuer = oauth
                .issuer
                .as_deref()
                .ok_or_else(|| BrokerError::configuration("oidc flow requires 'issuer'"))?;
            let discovered = self.discovery.fetch(issuer).await?;
            Ok(ResolvedEndpoints {
                authorization_url: discovered.authorization_endpoint,
                token_url: discovered.token_endpoint,
                device_authorization_url: discovered.device_authorization_endpoint,
            })
        } else {
            let token_url = oauth
                .token_url
                .clone()
                .ok_or_else(|| BrokerError::configuration("non-oidc flow requires 'token_url'"))?;
            Ok(ResolvedEndpoints {
                authorization_url: oauth.authorization_url.clone(),
                token_url,
                device_authorization_url: oauth.device_authorization_url.clone(),
            })
        }
    }

    /// Run the flow named by `oauth.flow` (or `flow_override` when the
    /// caller of `proxy.auth_start` named one explicitly), persist the
    /// resulting credentials, and return.
    pub async fn start_flow(
        &self,
        server: &str,
        oauth: &OAuthConfig,
        flow_override: Option<OAuthFlow>,
    ) -> BrokerResult<()> {
        let flow = flow_override.unwrap_or(oauth.flow);
        let endpoints = self.resolve_endpoints(oauth).await?;
        let scopes = oauth.scopes_vec();

        let minted = match flow {
            OAuthFlow::Pkce | OAuthFlow::OidcPkce => {
                let authorization_url = endpoints
                    .authorization_url
                    .ok_or_else(|| BrokerError::configuration("pkce flow requires an authorization endpoint"))?;
                let redirect_uri = oauth.redirect_uri_or_default();
                let timeout = Duration::from_secs(oauth.redirect_timeout_secs.unwrap_or(300));
                pkce::run(pkce::PkceFlowParams {
                    client_id: &oauth.client_id,
                    client_secret: oauth.client_secret.as_deref(),
                    authorization_url: &authorization_url,
                    token_url: &endpoints.token_url,
                    redirect_uri: &redirect_uri,
                    scopes: &scopes,
                    extra_auth_params: &oauth.extra_auth_params,
                    extra_token_params: &oauth.extra_token_params,
                    redirect_timeout: timeout,
                })
                .await?
            }
            OAuthFlow::DeviceCode | OAuthFlow::OidcDeviceCode => {
                let device_authorization_url = endpoints
                    .device_authorization_url
                    .ok_or_else(|| BrokerError::configuration("device code flow requires a device authorization endpoint"))?;
                device::run(
                    &self.http,
                    device::DeviceFlowParams {
                        client_id: &oauth.client_id,
                        device_authorization_url: &device_authorization_url,
                        token_url: &endpoints.token_url,
                        scopes: &scopes,
                        extra_token_params: &oauth.extra_token_params,
                    },
                )
                .await?
            }
            OAuthFlow::ClientCredentials => {
                let client_secret = oauth
                    .client_secret
                    .as_deref()
                    .ok_or_else(|| BrokerError::configuration("client_credentials flow requires 'client_secret'"))?;
                client_credentials::run(
                    &self.http,
                    client_credentials::ClientCredentialsParams {
                        client_id: &oauth.client_id,
                        client_secret,
                        token_url: &endpoints.token_url,
                        scopes: &scopes,
                        extra_token_params: &oauth.extra_token_params,
                    },
                )
                .await?
            }
        };

        self.store_minted(server, flow, minted)?;
        Ok(())
    }

    fn store_minted(&self, server: &str, flow: OAuthFlow, minted: MintedToken) -> BrokerResult<()> {
        let now = now_secs();
        let entry = TokenEntry {
            access_token: minted.access_token,
            refresh_token: minted.refresh_token,
            token_type: minted.token_type,
            scope: minted.scope,
            expires_at: now + minted.expires_in.unwrap_or(0) as i64,
            obtained_at: now,
            grant_type: flow,
        };
        self.token_store.put(server, entry)
    }

    /// Report the cached entry for `server`, for `proxy.auth_status`.
    #[must_use]
    pub fn status(&self, server: &str) -> Option<TokenEntry> {
        self.token_store.get(server)
    }

    /// Delete the cached entry for `server` (`proxy.auth_logout`).
    pub fn logout(&self, server: &str) -> BrokerResult<()> {
        self.token_store.delete(server)
    }

    /// Unconditionally refresh or re-mint `server`'s credentials, for
    /// `proxy.auth_refresh`, which forces renewal regardless of whether
    /// the cached entry has actually expired.
    pub async fn force_refresh(&self, server: &str, oauth: &OAuthConfig) -> BrokerResult<String> {
        if oauth.flow == OAuthFlow::ClientCredentials {
            self.start_flow(server, oauth, None).await?;
            return self
                .token_store
                .get(server)
                .map(|e| e.reveal_access_token().to_string())
                .ok_or_else(|| BrokerError::auth_for(server, "client-credentials mint did not produce a token"));
        }

        let entry = self
            .token_store
            .get(server)
            .ok_or_else(|| BrokerError::auth_for(server, "no cached credentials to refresh"))?;
        let refresh_token = entry
            .refresh_token
            .clone()
            .ok_or_else(|| BrokerError::auth_for(server, "cached credentials have no refresh token"))?;
        self.refresh(server, oauth, refresh_token.expose_secret(), &entry).await
    }

    /// §4.3 "Refresh semantics (`oauth_maybe_refresh`)": returns a valid
    /// access token for `server`, refreshing or re-minting as needed. A
    /// `None` result means no credentials are cached at all (the caller
    /// proceeds unauthenticated; §4.3 header injection step 3 is a
    /// best-effort "if available").
    pub async fn oauth_maybe_refresh(&self, server: &str, oauth: &OAuthConfig) -> BrokerResult<Option<String>> {
        let Some(entry) = self.token_store.get(server) else {
            return Ok(None);
        };

        let now = now_secs();
        if !entry.is_expired(now) {
            return Ok(Some(entry.reveal_access_token().to_string()));
        }

        if oauth.flow == OAuthFlow::ClientCredentials {
            self.start_flow(server, oauth, None).await?;
            return Ok(self.token_store.get(server).map(|e| e.reveal_access_token().to_string()));
        }

        if let Some(refresh_token) = &entry.refresh_token {
            match self.refresh(server, oauth, refresh_token.expose_secret(), &entry).await {
                Ok(token) => return Ok(Some(token)),
                Err(e) => {
                    tracing::warn!(server, error = %e, "token refresh failed; falling back to stale token");
                }
            }
        }

        // Expired, no renewal path: return the stale token and let the
        // upstream 401 surface to the caller.
        Ok(Some(entry.reveal_access_token().to_string()))
    }

    async fn refresh(
        &self,
        server: &str,
        oauth: &OAuthConfig,
        refresh_token: &str,
        previous: &TokenEntry,
    ) -> BrokerResult<String> {
        let endpoints = self.resolve_endpoints(oauth).await?;

        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
            ("client_id", oauth.client_id.clone()),
        ];
        if let Some(secret) = &oauth.client_secret {
            form.push(("client_secret", secret.clone()));
        }
        for (key, value) in &oauth.extra_token_params {
            form.push((key.as_str(), value.clone()));
        }

        #[derive(serde::Deserialize)]
        struct RefreshResponse {
            access_token: String,
            #[serde(default)]
            refresh_token: Option<String>,
            #[serde(default)]
            token_type: Option<String>,
            #[serde(default)]
            expires_in: Option<u64>,
            #[serde(default)]
            scope: Option<String>,
        }

        let response = self
            .http
            .post(&endpoints.token_url)
            .form(&form)
            .send()
            .await
            .map_err(BrokerError::Http)?;
        if !response.status().is_success() {
            return Err(BrokerError::auth_for(
                server,
                format!("refresh failed with HTTP {}", response.status()),
            ));
        }
        let body: RefreshResponse = response.json().await.map_err(BrokerError::Http)?;

        let now = now_secs();
        let entry = TokenEntry {
            access_token: secrecy::SecretString::from(body.access_token.clone()),
            // Preserve the prior refresh token when the server doesn't rotate it.
            refresh_token: body
                .refresh_token
                .map(secrecy::SecretString::from)
                .or_else(|| previous.refresh_token.clone()),
            token_type: body.token_type.unwrap_or_else(|| previous.token_type.clone()),
            scope: body.scope.or_else(|| previous.scope.clone()),
            expires_at: now + body.expires_in.unwrap_or(0) as i64,
            obtained_at: now,
            grant_type: previous.grant_type,
        };
        self.token_store.put(server, entry)?;
        Ok(body.access_token)
    }

    /// §4.3 "Header injection": build the headers an upstream call over
    /// `sse`/`streamable_http` should carry.
    pub async fn inject_headers(&self, server: &str, def: &ServerDefinition) -> BrokerResult<HashMap<String, String>> {
        let Transport::Remote { headers, api_key, .. } = &def.transport else {
            return Ok(HashMap::new());
        };

        let mut out = headers.clone();
        if out.contains_key("Authorization") {
            return Ok(out);
        }
        if let Some(key) = api_key {
            out.insert("Authorization".to_string(), format!("Bearer {key}"));
            return Ok(out);
        }
        if let Some(oauth) = &def.oauth {
            if let Some(token) = self.oauth_maybe_refresh(server, oauth).await? {
                out.insert("Authorization".to_string(), format!("Bearer {token}"));
            }
        }
        Ok(out)
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::{RemoteKind, Transport};
    use std::collections::HashMap as Map;

    fn remote_def(headers: Map<String, String>, api_key: Option<String>, oauth: Option<OAuthConfig>) -> ServerDefinition {
        ServerDefinition {
            transport: Transport::Remote {
                url: "https://example.com/mcp".to_string(),
                kind: Some(RemoteKind::StreamableHttp),
                headers,
                api_key,
                timeout: None,
            },
            oauth,
            extra_params: Map::new(),
        }
    }

    fn engine() -> OAuthEngine {
        let dir = tempfile::TempDir::new().unwrap();
        OAuthEngine::new(TokenStore::new(dir.path().join("mcp-tokens.json")))
    }

    #[tokio::test]
    async fn header_injection_prefers_existing_authorization_header() {
        let engine = engine();
        let mut headers = Map::new();
        headers.insert("Authorization".to_string(), "Bearer static".to_string());
        let def = remote_def(headers, Some("ignored-key".to_string()), None);
        let out = engine.inject_headers("demo", &def).await.unwrap();
        assert_eq!(out.get("Authorization").unwrap(), "Bearer static");
    }

    #[tokio::test]
    async fn header_injection_falls_back_to_api_key() {
        let engine = engine();
        let def = remote_def(Map::new(), Some("my-key".to_string()), None);
        let out = engine.inject_headers("demo", &def).await.unwrap();
        assert_eq!(out.get("Authorization").unwrap(), "Bearer my-key");
    }

    #[tokio::test]
    async fn maybe_refresh_returns_none_without_cached_entry() {
        let engine = engine();
        let oauth = OAuthConfig {
            flow: OAuthFlow::ClientCredentials,
            issuer: None,
            authorization_url: None,
            token_url: Some("https://auth.example.com/token".to_string()),
            device_authorization_url: None,
            client_id: "abc".to_string(),
            client_secret: Some("shh".to_string()),
            scopes: crate::config::model::ScopeList::default(),
            redirect_uri: None,
            extra_auth_params: Map::new(),
            extra_token_params: Map::new(),
            redirect_timeout_secs: None,
        };
        let result = engine.oauth_maybe_refresh("demo", &oauth).await.unwrap();
        assert!(result.is_none());
    }
}
