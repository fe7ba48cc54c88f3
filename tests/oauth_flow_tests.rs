//! OAuth flow integration tests against a mocked authorization server
//! (same `wiremock` idiom as `turbomcp-auth`'s own
//! `tests/oauth2_flow_integration.rs`).

use std::collections::HashMap;

use secrecy::ExposeSecret;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use ica_mcp_proxy::oauth::client_credentials::{self, ClientCredentialsParams};
use ica_mcp_proxy::oauth::device::{self, DeviceFlowParams};

/// §8 E2E scenario 6: a device endpoint reporting `interval:1, expires_in:3`
/// followed by two `authorization_pending` replies, two `slow_down` replies
/// (each adding 2s to the poll interval), then success, yields a minted
/// token after exactly five polls.
#[tokio::test]
async fn device_code_flow_succeeds_after_pending_and_slow_down_replies() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/device"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "device_code": "devcode-abc",
            "user_code": "ABCD-EFGH",
            "verification_uri": "https://example.com/verify",
            "interval": 1,
            "expires_in": 30,
        })))
        .mount(&server)
        .await;

    struct SequencedTokenResponses;
    impl Respond for SequencedTokenResponses {
        fn respond(&self, _: &Request) -> ResponseTemplate {
            static CALLS: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);
            let call = CALLS.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            match call {
                0 | 1 => ResponseTemplate::new(400).set_body_json(json!({"error": "authorization_pending"})),
                2 | 3 => ResponseTemplate::new(400).set_body_json(json!({"error": "slow_down"})),
                _ => ResponseTemplate::new(200).set_body_json(json!({
                    "access_token": "at-device-flow",
                    "token_type": "Bearer",
                    "expires_in": 3600,
                })),
            }
        }
    }

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(SequencedTokenResponses)
        .mount(&server)
        .await;

    let http = reqwest::Client::new();
    let params = DeviceFlowParams {
        client_id: "abc",
        device_authorization_url: &format!("{}/device", server.uri()),
        token_url: &format!("{}/token", server.uri()),
        scopes: &["read".to_string()],
        extra_token_params: &HashMap::new(),
    };

    let minted = device::run(&http, params).await.unwrap();
    assert_eq!(minted.access_token.expose_secret(), "at-device-flow");
}

/// The client-credentials grant mints a token from a single POST and
/// carries no refresh token (§4.3 "Client-credentials flow").
#[tokio::test]
async fn client_credentials_flow_mints_a_token() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "at-client-creds",
            "token_type": "Bearer",
            "expires_in": 7200,
            "scope": "admin",
        })))
        .mount(&server)
        .await;

    let http = reqwest::Client::new();
    let params = ClientCredentialsParams {
        client_id: "abc",
        client_secret: "shh",
        token_url: &format!("{}/token", server.uri()),
        scopes: &["admin".to_string()],
        extra_token_params: &HashMap::new(),
    };

    let minted = client_credentials::run(&http, params).await.unwrap();
    assert_eq!(minted.access_token.expose_secret(), "at-client-creds");
    assert!(minted.refresh_token.is_none());
    assert_eq!(minted.scope.as_deref(), Some("admin"));
}

/// A client-credentials response missing `access_token` is rejected
/// rather than silently minting an empty token.
#[tokio::test]
async fn client_credentials_flow_rejects_missing_access_token() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "",
            "token_type": "Bearer",
        })))
        .mount(&server)
        .await;

    let http = reqwest::Client::new();
    let params = ClientCredentialsParams {
        client_id: "abc",
        client_secret: "shh",
        token_url: &format!("{}/token", server.uri()),
        scopes: &[],
        extra_token_params: &HashMap::new(),
    };

    assert!(client_credentials::run(&http, params).await.is_err());
}
