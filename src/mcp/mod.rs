//! MCP transport: shared context, stdio server, tool handlers.
pub mod server;
pub mod tools;

pub use server::{AppContext, McpServer};
