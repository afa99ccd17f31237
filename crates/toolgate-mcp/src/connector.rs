//! Turns a server registration into an initialized [`McpSession`].
//!
//! The manager only talks to servers through a [`Connector`], which keeps
//! the lifecycle logic independent of process spawning and HTTP.

use crate::config::{ManagerSettings, OAuthConfig, ServerConfig, TransportConfig};
use crate::error::McpResult;
use crate::http::{auth_probe, AuthProbe, HttpConfig, HttpTransport};
use crate::session::McpSession;
use crate::stdio::{StdioConfig, StdioTransport};
use crate::transport::Transport;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Environment variable carrying the access token to stdio servers that use
/// a traditional OAuth provider.
pub const OAUTH_TOKEN_ENV: &str = "OAUTH_TOKEN";

/// Opens transports for the connection manager.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Unauthenticated probe of a remote server.
    async fn auth_probe(&self, url: &str) -> AuthProbe;

    /// Open a transport and complete the handshake, presenting `token` if
    /// one is available.
    async fn connect(
        &self,
        server_id: &str,
        config: &ServerConfig,
        token: Option<&str>,
    ) -> McpResult<McpSession>;
}

/// Spawns real processes and opens real HTTP sessions.
#[derive(Debug, Clone)]
pub struct DefaultConnector {
    stdio_request_timeout: Duration,
    http_timeout: Duration,
    probe_timeout: Duration,
}

impl DefaultConnector {
    pub fn new(settings: &ManagerSettings) -> Self {
        Self {
            stdio_request_timeout: settings.stdio_request_timeout,
            http_timeout: settings.http_timeout,
            probe_timeout: settings.probe_timeout,
        }
    }
}

impl Default for DefaultConnector {
    fn default() -> Self {
        Self::new(&ManagerSettings::default())
    }
}

#[async_trait]
impl Connector for DefaultConnector {
    async fn auth_probe(&self, url: &str) -> AuthProbe {
        auth_probe(url, self.probe_timeout).await
    }

    async fn connect(
        &self,
        server_id: &str,
        config: &ServerConfig,
        token: Option<&str>,
    ) -> McpResult<McpSession> {
        let transport: Arc<dyn Transport> = match &config.transport {
            TransportConfig::Stdio { command, args, env } => {
                let mut env = env.clone();
                if let (Some(token), OAuthConfig::Traditional { .. }) = (token, &config.oauth) {
                    env.insert(OAUTH_TOKEN_ENV.to_string(), token.to_string());
                }
                let stdio = StdioConfig::new(command.clone(), args.clone())
                    .with_env(env)
                    .with_request_timeout(self.stdio_request_timeout);
                Arc::new(StdioTransport::connect(stdio)?)
            }
            TransportConfig::Http { url, headers } => {
                let mut http = HttpConfig::new(url.clone())
                    .with_headers(headers.clone())
                    .with_bearer_token(token.map(str::to_string));
                http.timeout = self.http_timeout;
                Arc::new(HttpTransport::connect(http)?)
            }
        };

        debug!(server = %server_id, "Transport open, starting handshake");

        match McpSession::establish(transport.clone()).await {
            Ok(session) => Ok(session),
            Err(e) => {
                if let Err(close_err) = transport.close().await {
                    warn!(server = %server_id, error = %close_err, "Failed to close transport after handshake failure");
                }
                Err(e)
            }
        }
    }
}
