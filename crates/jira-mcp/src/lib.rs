//! jira-mcp - MCP stdio server for Jira tickets and their attachments
//!
//! The server speaks JSON-RPC 2.0 over newline-delimited stdio and exposes
//! the ticket and attachment tools of [`jira_mcp_core::JiraService`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use jira_mcp::{JiraToolHandler, McpServer};
//! use jira_mcp_core::{Config, EventLog, JiraService};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let service = JiraService::from_config(&config, Arc::new(EventLog::new())).await?;
//!     McpServer::new(JiraToolHandler::new(Arc::new(service))).run().await
//! }
//! ```

pub mod handler;
pub mod protocol;
pub mod server;
pub mod tools;

pub use handler::JiraToolHandler;
pub use protocol::{Request, RequestId, Response, RpcError};
pub use server::{McpServer, ToolHandler, PROTOCOL_VERSION};
pub use tools::{all_tools, get_tool, ToolContent, ToolDefinition, ToolResult};
