//! Session Factory (§4.4): transport detection and scoped MCP client
//! session acquisition for a single [`ServerDefinition`].

mod factory;

pub use factory::{AnySession, SessionFactory};
