//! HTTP/OAuth engine (§4.3): endpoint resolution, the three grant flows,
//! refresh semantics, and header injection for authenticated upstreams.

pub mod client_credentials;
pub mod device;
pub mod discovery;
pub mod engine;
pub mod pkce;
pub mod token;
pub mod url_policy;

pub use engine::OAuthEngine;
