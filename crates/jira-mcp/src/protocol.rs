//! JSON-RPC 2.0 message types for the MCP stdio transport
//!
//! One message per line. Requests carry an `id` and get exactly one
//! response; notifications carry none and are never answered.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC 2.0 version constant
pub const JSONRPC_VERSION: &str = "2.0";

/// An incoming message. Without an `id` it is a notification and must not
/// be answered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Must be "2.0"
    pub jsonrpc: String,
    /// Method name, e.g. `tools/call`
    pub method: String,
    /// Method parameters (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Request ID; absent for notifications
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
}

impl Request {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// JSON-RPC request ID
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric ID
    Number(i64),
    /// String ID
    String(String),
    /// Explicit null, used when answering a line that could not be parsed
    Null,
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

/// A JSON-RPC 2.0 response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Always "2.0"
    pub jsonrpc: String,
    /// Result (present on success)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error (present on failure)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    /// ID of the request being answered
    pub id: RequestId,
}

impl Response {
    /// Successful response carrying `result`
    pub fn success(id: RequestId, result: Value) -> Self {
        Response {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Error response for a protocol-level failure
    pub fn failure(id: RequestId, err: RpcError) -> Self {
        Response {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(err.into()),
            id,
        }
    }
}

/// JSON-RPC 2.0 error object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Error code, see [`RpcError::code`]
    pub code: i32,
    /// Human-readable message
    pub message: String,
}

impl From<RpcError> for ErrorObject {
    fn from(err: RpcError) -> Self {
        ErrorObject {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// Protocol-level failures. Tool failures are reported inside a successful
/// response instead (see [`crate::tools::ToolResult::failure`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// The line is not valid JSON
    ParseError(String),
    /// Valid JSON but not a JSON-RPC 2.0 request
    InvalidRequest(String),
    /// The method does not exist
    MethodNotFound(String),
    /// Missing or unknown tool name, or malformed params
    InvalidParams(String),
    /// The server failed to build a response
    InternalError(String),
}

impl RpcError {
    /// Standard JSON-RPC 2.0 error code
    pub fn code(&self) -> i32 {
        match self {
            RpcError::ParseError(_) => -32700,
            RpcError::InvalidRequest(_) => -32600,
            RpcError::MethodNotFound(_) => -32601,
            RpcError::InvalidParams(_) => -32602,
            RpcError::InternalError(_) => -32603,
        }
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcError::ParseError(msg) => write!(f, "Parse error: {msg}"),
            RpcError::InvalidRequest(msg) => write!(f, "Invalid Request: {msg}"),
            RpcError::MethodNotFound(method) => write!(f, "Method not found: {method}"),
            RpcError::InvalidParams(msg) => write!(f, "Invalid params: {msg}"),
            RpcError::InternalError(msg) => write!(f, "Internal error: {msg}"),
        }
    }
}

impl std::error::Error for RpcError {}

/// Parse one line of input into a request
pub fn parse_request(text: &str) -> Result<Request, RpcError> {
    let request: Request =
        serde_json::from_str(text).map_err(|e| RpcError::ParseError(e.to_string()))?;

    if request.jsonrpc != JSONRPC_VERSION {
        return Err(RpcError::InvalidRequest(format!(
            "expected jsonrpc {:?}, got {:?}",
            JSONRPC_VERSION, request.jsonrpc
        )));
    }
    Ok(request)
}
