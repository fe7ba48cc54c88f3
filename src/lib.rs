//! `ica-mcp-proxy`: a local multiplexing broker for the Model Context
//! Protocol. Aggregates upstream MCP servers — subprocesses and remote
//! HTTP endpoints alike — behind one stdio session, handling config
//! merging, OAuth credential management, and tool-catalogue mirroring.

pub mod broker;
pub mod cli;
pub mod config;
pub mod error;
pub mod mirror;
pub mod oauth;
pub mod session;
pub mod token_store;
pub mod util;
pub mod worker;

pub use error::{BrokerError, BrokerResult};
