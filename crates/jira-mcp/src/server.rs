//! MCP server over newline-delimited JSON-RPC
//!
//! Requests are handled concurrently; responses are written one per line in
//! completion order. Notifications are never answered.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::{self, Request, RequestId, Response, RpcError};
use crate::tools::{self, ToolResult};

const SERVER_NAME: &str = "jira-mcp";
const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PROTOCOL_VERSION: &str = "2024-11-05";

#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    /// Run a tool that is known to exist. Failures are reported in the
    /// returned result, never as protocol errors.
    async fn call(&self, name: &str, arguments: Value) -> ToolResult;
}

pub struct McpServer<H: ToolHandler> {
    handler: H,
    initialized: AtomicBool,
}

impl<H: ToolHandler + 'static> McpServer<H> {
    pub fn new(handler: H) -> Arc<Self> {
        Arc::new(McpServer {
            handler,
            initialized: AtomicBool::new(false),
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Serve on stdin/stdout until stdin closes
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        info!("Starting MCP server on stdio");
        let reader = BufReader::new(tokio::io::stdin());
        self.serve(reader, tokio::io::stdout()).await
    }

    /// Serve one connection. Returns after EOF once every in-flight request
    /// has been answered.
    pub async fn serve<R, W>(self: Arc<Self>, mut reader: R, mut writer: W) -> anyhow::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Response>();

        let read_loop = async move {
            let mut line = String::new();
            loop {
                line.clear();
                if reader.read_line(&mut line).await? == 0 {
                    info!("EOF received, shutting down");
                    break;
                }
                let message = line.trim();
                if message.is_empty() {
                    continue;
                }
                debug!(line = message, "Received");

                let request = match protocol::parse_request(message) {
                    Ok(request) => request,
                    Err(err) => {
                        warn!(error = %err, "Rejected malformed message");
                        let _ = tx.send(Response::failure(RequestId::Null, err));
                        continue;
                    }
                };

                let server = Arc::clone(&self);
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Some(response) = server.handle_request(request).await {
                        let _ = tx.send(response);
                    }
                });
            }
            anyhow::Ok(())
        };

        let write_loop = async move {
            while let Some(response) = rx.recv().await {
                let text = serde_json::to_string(&response)?;
                debug!(response = %text, "Sending");
                writer.write_all(text.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await?;
            }
            anyhow::Ok(())
        };

        let (read, write) = tokio::join!(read_loop, write_loop);
        read.and(write)
    }

    /// `None` for notifications
    async fn handle_request(&self, request: Request) -> Option<Response> {
        let params = request.params.unwrap_or(Value::Null);
        let Some(id) = request.id else {
            self.handle_notification(&request.method);
            return None;
        };

        let response = match request.method.as_str() {
            "initialize" => self.handle_initialize(id),
            "ping" => Response::success(id, json!({})),
            "tools/list" => Response::success(id, json!({ "tools": tools::all_tools() })),
            "tools/call" => self.handle_tools_call(id, params).await,
            method => {
                warn!(method, "Unknown method");
                Response::failure(id, RpcError::MethodNotFound(method.to_string()))
            }
        };
        Some(response)
    }

    fn handle_notification(&self, method: &str) {
        match method {
            "notifications/initialized" => debug!("Client confirmed initialization"),
            other => debug!(method = other, "Ignoring notification"),
        }
    }

    fn handle_initialize(&self, id: RequestId) -> Response {
        self.initialized.store(true, Ordering::Release);
        info!("MCP session initialized");

        Response::success(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": {
                    "name": SERVER_NAME,
                    "version": SERVER_VERSION,
                }
            }),
        )
    }

    async fn handle_tools_call(&self, id: RequestId, params: Value) -> Response {
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return Response::failure(id, RpcError::InvalidParams("missing 'name'".to_string()));
        };
        if tools::get_tool(name).is_none() {
            return Response::failure(id, RpcError::InvalidParams(format!("Unknown tool: {name}")));
        }

        let arguments = params
            .get("arguments")
            .cloned()
            .filter(|a| !a.is_null())
            .unwrap_or_else(|| json!({}));

        debug!(tool = name, "Calling tool");
        let result = self.handler.call(name, arguments).await;
        if result.is_error() {
            warn!(tool = name, "Tool call failed");
        }

        match serde_json::to_value(&result) {
            Ok(value) => Response::success(id, value),
            Err(e) => Response::failure(id, RpcError::InternalError(e.to_string())),
        }
    }
}
