//! OIDC endpoint discovery (`/.well-known/openid-configuration`), cached
//! per issuer. The issuer must be `https`, and only the three endpoint
//! fields the broker's flows need are kept from the discovery document.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Deserialize;

use crate::error::{BrokerError, BrokerResult};
use crate::oauth::url_policy::require_https_or_loopback;

/// The subset of an OIDC discovery document the broker's flows consume.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveredEndpoints {
    /// Authorization endpoint, used by PKCE.
    pub authorization_endpoint: Option<String>,
    /// Token endpoint, used by every flow.
    pub token_endpoint: String,
    /// Device authorization endpoint, used by device-code flows.
    pub device_authorization_endpoint: Option<String>,
}

struct CacheEntry {
    endpoints: DiscoveredEndpoints,
    fetched_at: Instant,
}

/// Fetches and caches OIDC discovery documents.
pub struct DiscoveryFetcher {
    http: reqwest::Client,
    cache: DashMap<String, CacheEntry>,
    ttl: Duration,
}

impl Default for DiscoveryFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscoveryFetcher {
    /// Build a fetcher with the default one-hour cache TTL.
    #[must_use]
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .timeout(Duration::from_secs(5))
                .build()
                .expect("reqwest client builder with static config never fails"),
            cache: DashMap::new(),
            ttl: Duration::from_secs(3600),
        }
    }

    /// Resolve the endpoints for `issuer`, hitting the network only on a
    /// cache miss or expiry.
    pub async fn fetch(&self, issuer: &str) -> BrokerResult<DiscoveredEndpoints> {
        require_https_or_loopback(issuer)?;

        if let Some(entry) = self.cache.get(issuer) {
            if entry.fetched_at.elapsed() < self.ttl {
                return Ok(entry.endpoints.clone());
            }
        }

        let issuer_trimmed = issuer.trim_end_matches('/');
        let url = format!("{issuer_trimmed}/.well-known/openid-configuration");

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(BrokerError::Http)?;

        if !response.status().is_success() {
            return Err(BrokerError::configuration(format!(
                "OIDC discovery at '{url}' returned HTTP {}",
                response.status()
            )));
        }

        let endpoints: DiscoveredEndpoints = response.json().await.map_err(BrokerError::Http)?;

        self.cache.insert(
            issuer.to_string(),
            CacheEntry {
                endpoints: endpoints.clone(),
                fetched_at: Instant::now(),
            },
        );

        Ok(endpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_https_issuer() {
        let fetcher = DiscoveryFetcher::new();
        let result = tokio_test::block_on(fetcher.fetch("http://issuer.example.com"));
        assert!(result.is_err());
    }
}
