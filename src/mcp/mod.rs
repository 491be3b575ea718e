//! MCP (Model Context Protocol) transports and wire types
//!
//! - `server`: stdio transport, one session per process
//! - `http`: streamable HTTP transport with `Mcp-Session-Id` sessions
//!
//! Both hand decoded messages to [`crate::gateway::Gateway`].

pub mod http;
pub mod logging;
pub mod server;
pub mod types;

pub use http::McpHttpServer;
pub use server::McpServer;
