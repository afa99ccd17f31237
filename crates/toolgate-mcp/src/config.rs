//! Server registration and manager settings.

use crate::error::{McpError, McpResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Default base for OAuth redirect URIs.
pub const DEFAULT_CALLBACK_BASE_URL: &str = "http://localhost:8080";

/// Path appended to the callback base to form the redirect URI.
pub const OAUTH_CALLBACK_PATH: &str = "/api/mcp/oauth/callback";

/// How the manager reaches a server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Local subprocess speaking JSON-RPC over stdin/stdout.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// Remote streamable HTTP endpoint.
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

/// Which OAuth flow, if any, protects a server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OAuthConfig {
    #[default]
    None,
    /// Pre-registered provider with static client credentials.
    Traditional {
        provider: String,
        #[serde(default)]
        scopes: Vec<String>,
    },
    /// Discovery + dynamic client registration + PKCE, started when the
    /// server answers 401.
    Dynamic,
}

impl OAuthConfig {
    pub fn is_none(&self) -> bool {
        matches!(self, OAuthConfig::None)
    }
}

/// A server registration as supplied by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Display name.
    pub name: String,
    pub transport: TransportConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    /// Overrides the manager's callback base for this server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_base_url: Option<String>,
}

impl ServerConfig {
    /// Create a stdio server config.
    pub fn stdio(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportConfig::Stdio {
                command: command.into(),
                args,
                env: HashMap::new(),
            },
            oauth: OAuthConfig::None,
            callback_base_url: None,
        }
    }

    /// Create an HTTP server config.
    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportConfig::Http {
                url: url.into(),
                headers: HashMap::new(),
            },
            oauth: OAuthConfig::None,
            callback_base_url: None,
        }
    }

    pub fn with_oauth(mut self, oauth: OAuthConfig) -> Self {
        self.oauth = oauth;
        self
    }

    pub fn with_callback_base_url(mut self, url: impl Into<String>) -> Self {
        self.callback_base_url = Some(url.into());
        self
    }

    /// Add an environment variable (stdio only).
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let TransportConfig::Stdio { env, .. } = &mut self.transport {
            env.insert(key.into(), value.into());
        }
        self
    }

    /// Add a header (HTTP only).
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let TransportConfig::Http { headers, .. } = &mut self.transport {
            headers.insert(key.into(), value.into());
        }
        self
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.transport, TransportConfig::Http { .. })
    }

    /// Reject registrations that can never connect.
    pub fn validate(&self) -> McpResult<()> {
        if self.name.trim().is_empty() {
            return Err(McpError::InvalidConfig("name must not be empty".to_string()));
        }

        match &self.transport {
            TransportConfig::Stdio { command, .. } => {
                if command.trim().is_empty() {
                    return Err(McpError::InvalidConfig(
                        "stdio command must not be empty".to_string(),
                    ));
                }
            }
            TransportConfig::Http { url, .. } => {
                let parsed = url::Url::parse(url)
                    .map_err(|e| McpError::InvalidConfig(format!("invalid url {url}: {e}")))?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(McpError::InvalidConfig(format!(
                        "unsupported url scheme: {}",
                        parsed.scheme()
                    )));
                }
            }
        }

        match &self.oauth {
            OAuthConfig::Traditional { provider, .. } if provider.trim().is_empty() => Err(
                McpError::InvalidConfig("oauth provider must not be empty".to_string()),
            ),
            OAuthConfig::Dynamic if !self.is_remote() => Err(McpError::InvalidConfig(
                "dynamic oauth needs an http transport".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Tunables for a [`crate::ConnectionManager`].
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub callback_base_url: String,
    pub callback_path: String,
    /// Lifetime of an unanswered authorization in either OAuth flow.
    pub pending_auth_ttl: Duration,
    pub stdio_request_timeout: Duration,
    pub probe_timeout: Duration,
    pub http_timeout: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            callback_base_url: DEFAULT_CALLBACK_BASE_URL.to_string(),
            callback_path: OAUTH_CALLBACK_PATH.to_string(),
            pending_auth_ttl: Duration::from_secs(10 * 60),
            stdio_request_timeout: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(10),
            http_timeout: Duration::from_secs(60),
        }
    }
}

impl ManagerSettings {
    /// Redirect URI for a server, honoring its own callback base.
    pub fn redirect_uri(&self, config: &ServerConfig) -> String {
        let base = config
            .callback_base_url
            .as_deref()
            .unwrap_or(&self.callback_base_url);
        format!("{}{}", base.trim_end_matches('/'), self.callback_path)
    }
}
