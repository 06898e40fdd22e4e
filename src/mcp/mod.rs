pub mod client;
pub mod jsonrpc;

pub use client::{McpClient, McpClientManager, ToolDescriptor};
