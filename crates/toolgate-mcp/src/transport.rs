//! Transport abstraction shared by the stdio and HTTP implementations.

use crate::error::{McpError, McpResult};
use crate::protocol::JsonRpcError;
use async_trait::async_trait;
use serde_json::Value;

/// Transport trait for MCP communication.
///
/// Implementations own request id assignment and correlation; callers only
/// see the `result` payload or a classified [`McpError`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for its result payload.
    async fn request(&self, method: &str, params: Option<Value>) -> McpResult<Value>;

    /// Send a notification (no response expected).
    async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()>;

    /// Close the transport.
    async fn close(&self) -> McpResult<()>;

    /// Check if the transport is connected.
    fn is_connected(&self) -> bool;
}

impl From<JsonRpcError> for McpError {
    fn from(error: JsonRpcError) -> Self {
        McpError::Rpc {
            code: error.code,
            message: error.message,
        }
    }
}
