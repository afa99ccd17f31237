//! MCP error types.

use thiserror::Error;

/// Result type for MCP operations.
pub type McpResult<T> = Result<T, McpError>;

/// JSON-RPC error code servers use to signal a rejected or expired credential.
pub const UNAUTHORIZED_RPC_CODE: i64 = -32001;

/// Coarse classification of an error, used to decide whether a
/// refresh-and-retry cycle is worth attempting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The remote rejected our credentials.
    Unauthorized,
    /// Anything else.
    Other,
}

/// Errors that can occur during MCP operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// The server process could not be started.
    #[error("Failed to launch server process: {0}")]
    Launch(String),

    /// A request did not complete in time.
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Malformed or unexpected protocol traffic.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// The server answered with a JSON-RPC error object.
    #[error("Server returned error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// Transport was used before connect or after close.
    #[error("Transport not connected")]
    NotConnected,

    /// Process exited and every allowed restart was used.
    #[error("Server process exited and {0} restarts were already used")]
    RestartExhausted(u32),

    /// The remote requires authorization before a session can be opened.
    #[error("Authorization required")]
    AuthRequired,

    /// The remote rejected the presented credentials.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Traditional OAuth callback carried an unknown or already used state.
    #[error("Invalid or already consumed OAuth state")]
    InvalidState,

    /// No OAuth subsystem recognizes the callback state.
    #[error("No pending authorization matches the callback state")]
    NoMatchingAuth,

    /// Authorization server metadata could not be fetched.
    #[error("OAuth metadata discovery failed: {0}")]
    Discovery(String),

    /// Dynamic client registration was rejected.
    #[error("Client registration failed: {0}")]
    Registration(String),

    /// Authorization code exchange failed.
    #[error("Token exchange failed: {0}")]
    TokenExchange(String),

    /// Refresh-token grant failed.
    #[error("Token refresh failed: {0}")]
    Refresh(String),

    /// No usable token is stored for a server.
    #[error("No usable token for server {0}")]
    NoToken(String),

    /// Traditional OAuth provider is not in the provider table.
    #[error("Unknown OAuth provider: {0}")]
    UnknownProvider(String),

    /// Server id is not registered.
    #[error("Server not found: {0}")]
    UnknownServer(String),

    /// Server exists but is not in the active state.
    #[error("Server {0} is not active")]
    NotActive(String),

    /// Tool not found.
    #[error("Tool not found: {0}")]
    UnknownTool(String),

    /// Tool execution failed after all attempts.
    #[error("Tool {tool} failed after {attempts} attempts: {last_error}")]
    ToolFailed {
        tool: String,
        attempts: u32,
        last_error: String,
    },

    /// Registration was rejected before anything was persisted.
    #[error("Invalid server configuration: {0}")]
    InvalidConfig(String),

    /// Persistence backend failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl McpError {
    /// Create a protocol error.
    pub fn protocol_error(message: impl Into<String>) -> Self {
        Self::ProtocolError(message.into())
    }

    /// Create a timeout error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout(message.into())
    }

    /// Create a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Classify this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Unauthorized(_) | Self::AuthRequired => ErrorClass::Unauthorized,
            Self::Rpc { code, .. } if *code == UNAUTHORIZED_RPC_CODE => ErrorClass::Unauthorized,
            Self::Http(e) if e.status() == Some(reqwest::StatusCode::UNAUTHORIZED) => {
                ErrorClass::Unauthorized
            }
            _ => ErrorClass::Other,
        }
    }

    /// Whether the remote rejected our credentials.
    pub fn is_unauthorized(&self) -> bool {
        self.class() == ErrorClass::Unauthorized
    }
}
