//! `maas-mcp-server`: MCP bridge to the MAAS machine lifecycle API.
//!
//! Speaks newline-delimited JSON-RPC on stdio. Deploy and commission run as
//! tracked long-running operations (see `maas_operations`); the remaining
//! tools expose the operations registry.

pub mod backend;
pub mod config;
pub mod protocol;
pub mod server;
pub mod tools;

/// Name reported in `initialize`.
pub const SERVER_NAME: &str = "maas-mcp-server";

pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");
