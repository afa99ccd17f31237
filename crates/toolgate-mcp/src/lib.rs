//! MCP server connection manager for toolgate.
//!
//! Registers Model Context Protocol servers, keeps their connections alive
//! and routes tool calls to them.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐     ┌───────────────────┐     ┌─────────────┐
//! │ ToolRouter │────▶│ ConnectionManager │────▶│ MCP Servers │
//! │ (retries)  │◀────│  (state machine)  │◀────│   (tools)   │
//! └────────────┘     └───────────────────┘     └─────────────┘
//!                       │             │
//!                 TokenStore      OAuth (traditional / dynamic)
//! ```
//!
//! # Supported Transports
//!
//! - **stdio**: local servers speaking line-delimited JSON-RPC on stdin/stdout
//! - **HTTP**: remote servers over streamable HTTP, with bearer tokens from
//!   either a pre-registered provider or the MCP dynamic OAuth flow
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use toolgate_mcp::{ConnectionManager, MemoryTokenStore, ServerConfig, ToolRouter};
//!
//! # async fn example() -> toolgate_mcp::McpResult<()> {
//! let manager = ConnectionManager::new(Arc::new(MemoryTokenStore::new()));
//!
//! let config = ServerConfig::stdio(
//!     "filesystem",
//!     "npx",
//!     vec!["-y".to_string(), "@modelcontextprotocol/server-filesystem".to_string()],
//! );
//! let registration = manager.register(config).await?;
//! manager
//!     .wait_settled(&registration.id, Duration::from_secs(30))
//!     .await?;
//!
//! let router = ToolRouter::new(manager);
//! let result = router
//!     .execute("read_file", serde_json::json!({ "path": "/path/to/file" }))
//!     .await?;
//! println!("{result}");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connector;
mod error;
pub mod http;
pub mod manager;
pub mod oauth;
pub mod protocol;
pub mod router;
pub mod session;
pub mod stats;
pub mod stdio;
pub mod store;
mod transport;

pub use config::{ManagerSettings, OAuthConfig, ServerConfig, TransportConfig};
pub use connector::{Connector, DefaultConnector};
pub use error::{ErrorClass, McpError, McpResult, UNAUTHORIZED_RPC_CODE};
pub use http::{AuthProbe, HttpConfig, HttpTransport};
pub use manager::{
    ConnectionManager, Registration, ServerStatus, ServerStatusReport, ServerSummary, ServerTools,
};
pub use oauth::traditional::{ProviderConfig, ProviderRegistry};
pub use protocol::{ToolCallResult, ToolContent, ToolDescriptor};
pub use router::{BuiltinTool, RetryPolicy, ServersTool, ToolRouter};
pub use session::McpSession;
pub use stats::{ToolStat, ToolStats};
pub use stdio::{StdioConfig, StdioTransport};
pub use store::{FileTokenStore, MemoryTokenStore, Namespace, TokenStore};
pub use transport::Transport;
