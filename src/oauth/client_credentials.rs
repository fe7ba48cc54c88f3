//! Client-credentials grant (§4.3 "Client-credentials flow").
//!
//! Implemented as a direct form-encoded POST, matching the refresh and
//! device-code flows' style rather than the `oauth2` crate's typestate
//! client — client-credentials needs no authorization endpoint at all,
//! and building a throwaway `BasicClient` just to satisfy that crate's
//! typestate (which requires an `AuthUrl` even when unused) would only
//! add indirection. See `DESIGN.md` for the grounding note.

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::{BrokerError, BrokerResult};
use crate::oauth::token::MintedToken;
use crate::oauth::url_policy::require_https_or_loopback;

/// Parameters for a client-credentials grant.
pub struct ClientCredentialsParams<'a> {
    /// OAuth client identifier.
    pub client_id: &'a str,
    /// OAuth client secret (required for this flow).
    pub client_secret: &'a str,
    /// Token endpoint.
    pub token_url: &'a str,
    /// Requested scopes.
    pub scopes: &'a [String],
    /// Extra parameters merged into the token request.
    pub extra_token_params: &'a std::collections::HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct TokenSuccess {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    scope: Option<String>,
}

/// Mint a fresh access token via the client-credentials grant.
/// Cacheable and re-mintable without any refresh token (§4.3).
pub async fn run(http: &reqwest::Client, params: ClientCredentialsParams<'_>) -> BrokerResult<MintedToken> {
    require_https_or_loopback(params.token_url)?;

    let scope = params.scopes.join(" ");
    let mut form = vec![
        ("grant_type", "client_credentials".to_string()),
        ("client_id", params.client_id.to_string()),
        ("client_secret", params.client_secret.to_string()),
    ];
    if !scope.is_empty() {
        form.push(("scope", scope));
    }
    for (key, value) in params.extra_token_params {
        form.push((key.as_str(), value.clone()));
    }

    let response = http.post(params.token_url).form(&form).send().await.map_err(BrokerError::Http)?;

    if !response.status().is_success() {
        return Err(BrokerError::auth(format!(
            "client credentials endpoint returned HTTP {}",
            response.status()
        )));
    }

    let success: TokenSuccess = response.json().await.map_err(BrokerError::Http)?;
    if success.access_token.is_empty() {
        return Err(BrokerError::auth("client credentials response missing access_token"));
    }

    Ok(MintedToken {
        access_token: SecretString::from(success.access_token),
        refresh_token: None,
        token_type: success.token_type.unwrap_or_else(|| "Bearer".to_string()),
        expires_in: success.expires_in,
        scope: success.scope,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_https_token_endpoint() {
        let http = reqwest::Client::new();
        let params = ClientCredentialsParams {
            client_id: "abc",
            client_secret: "shh",
            token_url: "http://auth.example.com/token",
            scopes: &[],
            extra_token_params: &std::collections::HashMap::new(),
        };
        let result = tokio_test::block_on(run(&http, params));
        assert!(result.is_err());
    }
}
