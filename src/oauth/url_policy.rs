//! Shared URL validation for every OAuth endpoint and the PKCE redirect:
//! every URL must be `https`, or `http` with a loopback host.

use url::Url;

use crate::error::{BrokerError, BrokerResult};

/// Require `https`, or `http` with a loopback host (§4.3 "Shared rules").
/// Used for authorization/token/device-authorization/discovery endpoints.
pub fn require_https_or_loopback(url_str: &str) -> BrokerResult<Url> {
    let url = Url::parse(url_str)
        .map_err(|e| BrokerError::configuration(format!("invalid URL '{url_str}': {e}")))?;

    match url.scheme() {
        "https" => Ok(url),
        "http" if is_loopback_host(&url) => Ok(url),
        "http" => Err(BrokerError::configuration(format!(
            "'{url_str}' must use https (http is only allowed for loopback hosts)"
        ))),
        other => Err(BrokerError::configuration(format!(
            "'{url_str}' has unsupported scheme '{other}'"
        ))),
    }
}

/// Validate a PKCE redirect URI: must be `http://(127.0.0.1|::1|localhost):<port>/<path>`.
pub fn require_loopback_redirect(url_str: &str) -> BrokerResult<Url> {
    let url = Url::parse(url_str)
        .map_err(|e| BrokerError::configuration(format!("invalid redirect_uri '{url_str}': {e}")))?;

    if url.scheme() != "http" {
        return Err(BrokerError::configuration(format!(
            "redirect_uri '{url_str}' must use the http scheme (loopback only)"
        )));
    }
    if !is_loopback_host(&url) {
        return Err(BrokerError::configuration(format!(
            "redirect_uri '{url_str}' must target a loopback host (127.0.0.1, ::1, or localhost)"
        )));
    }
    if url.fragment().is_some() {
        return Err(BrokerError::configuration("redirect_uri must not contain a fragment"));
    }
    if url.path().contains("..") {
        return Err(BrokerError::configuration("redirect_uri must not contain path traversal"));
    }
    Ok(url)
}

fn is_loopback_host(url: &Url) -> bool {
    match url.host_str() {
        Some("localhost") => true,
        Some(host) => host
            .parse::<std::net::IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn https_always_allowed() {
        assert!(require_https_or_loopback("https://example.com/token").is_ok());
    }

    #[test]
    fn http_loopback_allowed() {
        assert!(require_https_or_loopback("http://127.0.0.1:8765/token").is_ok());
        assert!(require_https_or_loopback("http://localhost:8765/token").is_ok());
        assert!(require_https_or_loopback("http://[::1]:8765/token").is_ok());
    }

    #[test]
    fn http_non_loopback_rejected() {
        assert!(require_https_or_loopback("http://example.com/token").is_err());
    }

    #[test]
    fn redirect_rejects_fragment_and_traversal() {
        assert!(require_loopback_redirect("http://127.0.0.1:8765/callback#frag").is_err());
        assert!(require_loopback_redirect("http://127.0.0.1:8765/../callback").is_err());
    }

    #[test]
    fn redirect_rejects_non_loopback() {
        assert!(require_loopback_redirect("http://evil.example.com:8765/callback").is_err());
    }
}
