//! MCP integration: subprocess-hosted tool servers
//!
//! Each server is an opaque subprocess speaking line-delimited JSON-RPC on
//! its stdio. The adapter owns the registry and every child process.

mod adapter;
mod protocol;
mod server;

pub use adapter::{McpAdapter, McpServerInfo, McpServerStatus};
pub use protocol::{JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, McpTool};
pub use server::McpServerHandle;
