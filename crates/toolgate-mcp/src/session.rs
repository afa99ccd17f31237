//! MCP session over any [`Transport`]: the initialize handshake and the
//! tool/resource operations the manager needs.

use crate::error::{McpError, McpResult};
use crate::protocol::{
    CallToolParams, InitializeParams, InitializeResult, ListResourcesResult, ListToolsResult,
    ResourceDescriptor, ToolCallResult, ToolDescriptor, METHOD_INITIALIZED,
};
use crate::transport::Transport;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// An initialized connection to one MCP server.
#[derive(Clone)]
pub struct McpSession {
    transport: Arc<dyn Transport>,
    server: Option<InitializeResult>,
}

impl McpSession {
    /// Wrap a transport without performing the handshake.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            server: None,
        }
    }

    /// Run `initialize` + `notifications/initialized` over the transport.
    pub async fn establish(transport: Arc<dyn Transport>) -> McpResult<Self> {
        let mut session = Self::new(transport);
        session.handshake().await?;
        Ok(session)
    }

    async fn handshake(&mut self) -> McpResult<()> {
        let params = serde_json::to_value(InitializeParams::default())?;
        let result: InitializeResult = self.call("initialize", Some(params)).await?;

        debug!(
            protocol_version = %result.protocol_version,
            server_name = %result.server_info.name,
            "MCP server initialized"
        );

        self.transport.notify(METHOD_INITIALIZED, None).await?;
        self.server = Some(result);
        Ok(())
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Option<Value>) -> McpResult<T> {
        let value = self.transport.request(method, params).await?;
        serde_json::from_value(value)
            .map_err(|e| McpError::protocol_error(format!("Invalid {method} result: {e}")))
    }

    /// Handshake result, once established.
    pub fn server_info(&self) -> Option<&InitializeResult> {
        self.server.as_ref()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Whether both handles share one transport.
    pub fn same_transport(&self, other: &McpSession) -> bool {
        let ours = Arc::as_ptr(&self.transport) as *const ();
        let theirs = Arc::as_ptr(&other.transport) as *const ();
        std::ptr::eq(ours, theirs)
    }

    pub async fn list_tools(&self) -> McpResult<Vec<ToolDescriptor>> {
        let result: ListToolsResult = self.call("tools/list", None).await?;
        Ok(result.tools)
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> McpResult<ToolCallResult> {
        let params = CallToolParams {
            name: name.to_string(),
            arguments: Some(arguments),
        };
        self.call("tools/call", Some(serde_json::to_value(&params)?))
            .await
    }

    pub async fn list_resources(&self) -> McpResult<Vec<ResourceDescriptor>> {
        let result: ListResourcesResult = self.call("resources/list", None).await?;
        Ok(result.resources)
    }

    pub async fn close(&self) -> McpResult<()> {
        self.transport.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Answers from a fixed table and records every message.
    struct ScriptedTransport {
        sent: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
            }
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn request(&self, method: &str, params: Option<Value>) -> McpResult<Value> {
            self.sent.lock().unwrap().push(method.to_string());
            match method {
                "initialize" => {
                    assert_eq!(params.unwrap()["protocolVersion"], "2024-11-05");
                    Ok(json!({
                        "protocolVersion": "2024-11-05",
                        "capabilities": {"tools": {}},
                        "serverInfo": {"name": "scripted", "version": "1"}
                    }))
                }
                "tools/list" => Ok(json!({
                    "tools": [{"name": "echo", "description": "Echo", "inputSchema": {"type": "object"}}]
                })),
                "tools/call" => {
                    let params = params.unwrap();
                    Ok(json!({"content": [{"type": "text", "text": params["arguments"]["text"]}]}))
                }
                "resources/list" => Ok(json!({"resources": [{"uri": "file:///a", "name": "a"}]})),
                _ => Err(McpError::Rpc {
                    code: -32601,
                    message: "Method not found".to_string(),
                }),
            }
        }

        async fn notify(&self, method: &str, _params: Option<Value>) -> McpResult<()> {
            self.sent.lock().unwrap().push(method.to_string());
            Ok(())
        }

        async fn close(&self) -> McpResult<()> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_handshake_order() {
        let transport = Arc::new(ScriptedTransport::new());
        let session = McpSession::establish(transport.clone()).await.unwrap();

        assert_eq!(transport.sent(), vec!["initialize", METHOD_INITIALIZED]);
        assert_eq!(session.server_info().unwrap().server_info.name, "scripted");
    }

    #[tokio::test]
    async fn test_tool_and_resource_operations() {
        let session = McpSession::establish(Arc::new(ScriptedTransport::new()))
            .await
            .unwrap();

        let tools = session.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");
        assert_eq!(tools[0].input_schema, json!({"type": "object"}));

        let result = session
            .call_tool("echo", json!({"text": "hi"}))
            .await
            .unwrap();
        assert_eq!(result.text(), "hi");

        let resources = session.list_resources().await.unwrap();
        assert_eq!(resources[0].uri, "file:///a");
    }

    #[tokio::test]
    async fn test_malformed_result_is_protocol_error() {
        struct Garbage;

        #[async_trait]
        impl Transport for Garbage {
            async fn request(&self, _: &str, _: Option<Value>) -> McpResult<Value> {
                Ok(json!("nope"))
            }
            async fn notify(&self, _: &str, _: Option<Value>) -> McpResult<()> {
                Ok(())
            }
            async fn close(&self) -> McpResult<()> {
                Ok(())
            }
            fn is_connected(&self) -> bool {
                true
            }
        }

        let result = McpSession::establish(Arc::new(Garbage)).await;
        assert!(matches!(result, Err(McpError::ProtocolError(_))));
    }
}
