//! RFC 8628 device authorization grant (§4.3 "Device-code flow").
//!
//! Implemented directly against `reqwest` rather than the `oauth2` crate's
//! device-flow helpers: the poll loop has exact, observable semantics
//! for `authorization_pending`/`slow_down` (interval backoff on each
//! `slow_down`), which is easiest to get right against the raw wire
//! format rather than through an abstraction layer. Form-encoding and
//! error-body parsing follow the same "every error with a JSON body is
//! parsed as a response" rule as the rest of the engine.

use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::{BrokerError, BrokerResult};
use crate::oauth::token::MintedToken;
use crate::oauth::url_policy::require_https_or_loopback;

/// Parameters for a device-code flow, already resolved to concrete
/// endpoints.
pub struct DeviceFlowParams<'a> {
    /// OAuth client identifier.
    pub client_id: &'a str,
    /// Device authorization endpoint.
    pub device_authorization_url: &'a str,
    /// Token endpoint.
    pub token_url: &'a str,
    /// Requested scopes.
    pub scopes: &'a [String],
    /// Extra parameters merged into the token poll request.
    pub extra_token_params: &'a std::collections::HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct DeviceAuthorizationResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    #[serde(default)]
    verification_uri_complete: Option<String>,
    #[serde(default = "default_interval")]
    interval: u64,
    expires_in: u64,
}

fn default_interval() -> u64 {
    5
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TokenPollResponse {
    Success(TokenSuccess),
    Error(TokenErrorBody),
}

#[derive(Debug, Deserialize)]
struct TokenSuccess {
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

#[derive(Debug, Deserialize)]
struct TokenErrorBody {
    error: String,
}

/// Run the device-code flow to completion, polling until the user
/// authorizes, the code expires, or the server reports a terminal error.
pub async fn run(http: &reqwest::Client, params: DeviceFlowParams<'_>) -> BrokerResult<MintedToken> {
    require_https_or_loopback(params.device_authorization_url)?;
    require_https_or_loopback(params.token_url)?;

    let scope = params.scopes.join(" ");
    let mut form = vec![("client_id", params.client_id.to_string())];
    if !scope.is_empty() {
        form.push(("scope", scope.clone()));
    }

    let response = http
        .post(params.device_authorization_url)
        .form(&form)
        .send()
        .await
        .map_err(BrokerError::Http)?;

    if !response.status().is_success() {
        return Err(BrokerError::auth(format!(
            "device authorization endpoint returned HTTP {}",
            response.status()
        )));
    }

    let device: DeviceAuthorizationResponse = response.json().await.map_err(BrokerError::Http)?;

    tracing::info!(
        user_code = %device.user_code,
        verification_uri = %device.verification_uri_complete.clone().unwrap_or_else(|| device.verification_uri.clone()),
        "visit the verification URL and enter the user code to authorize"
    );

    let mut interval = Duration::from_secs(device.interval.max(1));
    let deadline = tokio::time::Instant::now() + Duration::from_secs(device.expires_in);

    loop {
        if tokio::time::Instant::now() >= deadline {
            return Err(BrokerError::timeout("device code authorization", device.expires_in));
        }

        tokio::time::sleep(interval).await;

        let mut poll_form = vec![
            ("client_id", params.client_id.to_string()),
            ("device_code", device.device_code.clone()),
            (
                "grant_type",
                "urn:ietf:params:oauth:grant-type:device-code".to_string(),
            ),
        ];
        for (key, value) in params.extra_token_params {
            poll_form.push((key.as_str(), value.clone()));
        }

        let poll_response = http
            .post(params.token_url)
            .form(&poll_form)
            .send()
            .await
            .map_err(BrokerError::Http)?;

        let body: TokenPollResponse = poll_response.json().await.map_err(BrokerError::Http)?;

        match body {
            TokenPollResponse::Success(success) => {
                return Ok(MintedToken {
                    access_token: SecretString::from(success.access_token),
                    refresh_token: success.refresh_token.map(SecretString::from),
                    token_type: success.token_type.unwrap_or_else(|| "Bearer".to_string()),
                    expires_in: success.expires_in,
                    scope: success.scope,
                });
            }
            TokenPollResponse::Error(err) => match err.error.as_str() {
                "authorization_pending" => continue,
                "slow_down" => {
                    interval += Duration::from_secs(2);
                    continue;
                }
                other => {
                    return Err(BrokerError::auth(format!("device code flow failed: {other}")));
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_https_device_endpoint() {
        let http = reqwest::Client::new();
        let params = DeviceFlowParams {
            client_id: "abc",
            device_authorization_url: "http://auth.example.com/device",
            token_url: "https://auth.example.com/token",
            scopes: &[],
            extra_token_params: &std::collections::HashMap::new(),
        };
        let result = tokio_test::block_on(run(&http, params));
        assert!(result.is_err());
    }
}
