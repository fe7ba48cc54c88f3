//! Broker Server (§4.7): the downstream-facing stdio MCP server role.

mod dispatch;
mod server;

pub use server::BrokerServer;
