//! Authorization-code + PKCE flow, including the single-shot local
//! redirect listener (§4.3 "PKCE flow").
//!
//! The flow itself is grounded on `turbomcp-auth::oauth2::client::OAuth2Client`'s
//! `authorization_code_flow`/`exchange_code_for_token` (same `oauth2`
//! crate typestate client, same `PkceCodeChallenge::new_random_sha256()`
//! call). The loopback listener has no teacher analogue — it is built
//! directly against `tokio::net::TcpListener` in the same request/response
//! idiom as `turbomcp-transport`'s HTTP-facing code.

use std::time::Duration;

use oauth2::basic::BasicClient;
use oauth2::{
    AuthUrl, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge, RedirectUrl, Scope, TokenResponse,
    TokenUrl,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::error::{BrokerError, BrokerResult};
use crate::oauth::token::MintedToken;
use crate::oauth::url_policy::{require_https_or_loopback, require_loopback_redirect};

/// Everything a PKCE flow needs, already resolved (explicit config or
/// OIDC-discovered endpoints — the caller in `oauth::engine` picks).
pub struct PkceFlowParams<'a> {
    /// OAuth client identifier.
    pub client_id: &'a str,
    /// OAuth client secret, for confidential clients.
    pub client_secret: Option<&'a str>,
    /// Authorization endpoint.
    pub authorization_url: &'a str,
    /// Token endpoint.
    pub token_url: &'a str,
    /// Loopback redirect URI the local listener binds to.
    pub redirect_uri: &'a str,
    /// Requested scopes.
    pub scopes: &'a [String],
    /// Extra parameters merged into the authorization request.
    pub extra_auth_params: &'a std::collections::HashMap<String, String>,
    /// Extra parameters merged into the token exchange request.
    pub extra_token_params: &'a std::collections::HashMap<String, String>,
    /// How long to wait for the browser round-trip before failing.
    pub redirect_timeout: Duration,
}

/// Run the full PKCE flow: open a one-shot loopback listener, build and
/// (best-effort) open the authorization URL, wait for the redirect, then
/// exchange the code for a token.
pub async fn run(params: PkceFlowParams<'_>) -> BrokerResult<MintedToken> {
    require_https_or_loopback(params.authorization_url)?;
    require_https_or_loopback(params.token_url)?;
    let redirect = require_loopback_redirect(params.redirect_uri)?;

    let auth_url = AuthUrl::new(params.authorization_url.to_string())
        .map_err(|e| BrokerError::configuration(e.to_string()))?;
    let token_url = TokenUrl::new(params.token_url.to_string())
        .map_err(|e| BrokerError::configuration(e.to_string()))?;
    let redirect_url =
        RedirectUrl::new(params.redirect_uri.to_string()).map_err(|e| BrokerError::configuration(e.to_string()))?;

    let mut client = BasicClient::new(ClientId::new(params.client_id.to_string()))
        .set_auth_uri(auth_url)
        .set_token_uri(token_url)
        .set_redirect_uri(redirect_url);
    if let Some(secret) = params.client_secret {
        client = client.set_client_secret(ClientSecret::new(secret.to_string()));
    }

    let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
    let state = CsrfToken::new_random();

    let mut request = client
        .authorize_url(|| state.clone())
        .set_pkce_challenge(pkce_challenge)
        .add_scopes(params.scopes.iter().cloned().map(Scope::new));
    for (key, value) in params.extra_auth_params {
        request = request.add_extra_param(key.clone(), value.clone());
    }
    let (authorize_url, expected_state) = request.url();

    tracing::info!(url = %authorize_url, "open this URL to authorize");
    try_open_browser(authorize_url.as_str());

    let port = redirect
        .port_or_known_default()
        .ok_or_else(|| BrokerError::configuration("redirect_uri has no port"))?;
    let (code, returned_state) =
        tokio::time::timeout(params.redirect_timeout, wait_for_redirect(port, redirect.path()))
            .await
            .map_err(|_| BrokerError::timeout("PKCE redirect", params.redirect_timeout.as_secs()))??;

    if !constant_time_eq(returned_state.secret().as_bytes(), expected_state.secret().as_bytes()) {
        return Err(BrokerError::auth("state mismatch on OAuth redirect"));
    }

    let http = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(BrokerError::Http)?;

    let mut exchange = client
        .exchange_code(oauth2::AuthorizationCode::new(code))
        .set_pkce_verifier(pkce_verifier);
    for (key, value) in params.extra_token_params {
        exchange = exchange.add_extra_param(key.clone(), value.clone());
    }
    let token_response = exchange
        .request_async(&http)
        .await
        .map_err(|e| BrokerError::auth(format!("token exchange failed: {e}")))?;

    Ok(MintedToken {
        access_token: secrecy::SecretString::from(token_response.access_token().secret().clone()),
        refresh_token: token_response
            .refresh_token()
            .map(|t| secrecy::SecretString::from(t.secret().clone())),
        token_type: "Bearer".to_string(),
        expires_in: token_response.expires_in().map(|d| d.as_secs()),
        scope: token_response
            .scopes()
            .map(|scopes| scopes.iter().map(oauth2::Scope::as_str).collect::<Vec<_>>().join(" ")),
    })
}

/// Accept exactly one `GET` carrying `code` and `state`, respond with a
/// minimal confirmation page, and return the parsed query parameters.
async fn wait_for_redirect(port: u16, expected_path: &str) -> BrokerResult<(String, CsrfToken)> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    let expected_path = expected_path.to_string();

    loop {
        let (mut stream, _) = listener.accept().await?;
        let mut buf = [0u8; 8192];
        let n = stream.read(&mut buf).await?;
        let request_line = String::from_utf8_lossy(&buf[..n]);
        let Some(first_line) = request_line.lines().next() else {
            continue;
        };
        let Some(path_and_query) = first_line.split_whitespace().nth(1) else {
            continue;
        };

        let full_url = format!("http://127.0.0.1{path_and_query}");
        let Ok(parsed) = url::Url::parse(&full_url) else {
            respond(&mut stream, "Malformed redirect request.").await?;
            continue;
        };

        if parsed.path() != expected_path {
            respond(&mut stream, "Unexpected path.").await?;
            continue;
        }

        let params: std::collections::HashMap<String, String> = parsed.query_pairs().into_owned().collect();

        if let Some(error) = params.get("error") {
            respond(&mut stream, "Authorization failed; you may close this window.").await?;
            return Err(BrokerError::auth(format!("authorization server returned error: {error}")));
        }

        let (Some(code), Some(state)) = (params.get("code"), params.get("state")) else {
            respond(&mut stream, "Missing code or state parameter.").await?;
            continue;
        };

        respond(&mut stream, "Authorization complete; you may close this window.").await?;
        return Ok((code.clone(), CsrfToken::new(state.clone())));
    }
}

async fn respond(stream: &mut tokio::net::TcpStream, body: &str) -> BrokerResult<()> {
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

/// Constant-time byte comparison for the PKCE `state` check (§4.3 step 3:
/// "Compare `state` constant-time").
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Best-effort browser launch; failure here is never fatal (§4.3 step 4).
fn try_open_browser(url: &str) {
    #[cfg(target_os = "macos")]
    let cmd = "open";
    #[cfg(target_os = "linux")]
    let cmd = "xdg-open";
    #[cfg(target_os = "windows")]
    let cmd = "start";

    #[cfg(any(target_os = "macos", target_os = "linux", target_os = "windows"))]
    {
        let _ = std::process::Command::new(cmd).arg(url).spawn();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_loopback_redirect_before_any_network_call() {
        let params = PkceFlowParams {
            client_id: "abc",
            client_secret: None,
            authorization_url: "https://auth.example.com/authorize",
            token_url: "https://auth.example.com/token",
            redirect_uri: "http://evil.example.com/callback",
            scopes: &[],
            extra_auth_params: &std::collections::HashMap::new(),
            extra_token_params: &std::collections::HashMap::new(),
            redirect_timeout: Duration::from_secs(1),
        };
        let result = tokio_test::block_on(run(params));
        assert!(result.is_err());
    }
}
