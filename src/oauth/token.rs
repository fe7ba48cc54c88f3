//! The common result shape every OAuth flow produces, before it's
//! wrapped into a persisted [`crate::token_store::TokenEntry`].

use secrecy::SecretString;

/// Freshly minted (or refreshed) credentials from any flow.
pub struct MintedToken {
    /// The bearer access token.
    pub access_token: SecretString,
    /// Refresh token, if the server issued one.
    pub refresh_token: Option<SecretString>,
    /// Token type reported by the server (defaults to `Bearer` upstream).
    pub token_type: String,
    /// Seconds until expiry, if the server reported one.
    pub expires_in: Option<u64>,
    /// Space-delimited scope, if reported.
    pub scope: Option<String>,
}
