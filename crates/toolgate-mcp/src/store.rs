//! Persistence for server registrations and OAuth credentials.
//!
//! A [`TokenStore`] is a small key-value interface keyed by server id and
//! split into namespaces. Typed helpers on the trait serialize the records
//! this crate keeps. Two backends ship here: [`MemoryTokenStore`] and the
//! file-backed [`FileTokenStore`], which writes credential files with
//! owner-only permissions.

use crate::config::ServerConfig;
use crate::error::{McpError, McpResult};
use crate::oauth::dynamic::RegisteredClient;
use crate::oauth::tokens::TokenSet;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// What kind of record is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// The server registration.
    Config,
    /// OAuth token set.
    Tokens,
    /// Dynamic client registration needed to refresh tokens.
    OAuthClient,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Config => "config",
            Namespace::Tokens => "tokens",
            Namespace::OAuthClient => "oauth_client",
        }
    }

    /// Records that must not be readable by other users.
    pub fn is_confidential(&self) -> bool {
        matches!(self, Namespace::Tokens | Namespace::OAuthClient)
    }
}

/// Key-value persistence keyed by (namespace, server id).
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn save(&self, namespace: Namespace, server_id: &str, value: &str) -> McpResult<()>;

    async fn load(&self, namespace: Namespace, server_id: &str) -> McpResult<Option<String>>;

    /// Deleting a missing record is not an error.
    async fn delete(&self, namespace: Namespace, server_id: &str) -> McpResult<()>;

    async fn save_config(&self, server_id: &str, config: &ServerConfig) -> McpResult<()> {
        self.save(Namespace::Config, server_id, &encode(config)?)
            .await
    }

    async fn load_config(&self, server_id: &str) -> McpResult<Option<ServerConfig>> {
        let raw = self.load(Namespace::Config, server_id).await?;
        Ok(decode(Namespace::Config, server_id, raw))
    }

    async fn delete_config(&self, server_id: &str) -> McpResult<()> {
        self.delete(Namespace::Config, server_id).await
    }

    async fn save_tokens(&self, server_id: &str, tokens: &TokenSet) -> McpResult<()> {
        self.save(Namespace::Tokens, server_id, &encode(tokens)?)
            .await
    }

    async fn load_tokens(&self, server_id: &str) -> McpResult<Option<TokenSet>> {
        let raw = self.load(Namespace::Tokens, server_id).await?;
        Ok(decode(Namespace::Tokens, server_id, raw))
    }

    async fn delete_tokens(&self, server_id: &str) -> McpResult<()> {
        self.delete(Namespace::Tokens, server_id).await
    }

    async fn save_oauth_client(&self, server_id: &str, client: &RegisteredClient) -> McpResult<()> {
        self.save(Namespace::OAuthClient, server_id, &encode(client)?)
            .await
    }

    async fn load_oauth_client(&self, server_id: &str) -> McpResult<Option<RegisteredClient>> {
        let raw = self.load(Namespace::OAuthClient, server_id).await?;
        Ok(decode(Namespace::OAuthClient, server_id, raw))
    }

    async fn delete_oauth_client(&self, server_id: &str) -> McpResult<()> {
        self.delete(Namespace::OAuthClient, server_id).await
    }
}

fn encode<T: Serialize>(value: &T) -> McpResult<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

/// Corrupt records are logged and treated as missing.
fn decode<T: DeserializeOwned>(namespace: Namespace, server_id: &str, raw: Option<String>) -> Option<T> {
    let raw = raw?;
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(server = %server_id, namespace = namespace.as_str(), error = %e, "Skipping invalid stored record");
            None
        }
    }
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    entries: RwLock<HashMap<(Namespace, String), String>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records across all namespaces.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn save(&self, namespace: Namespace, server_id: &str, value: &str) -> McpResult<()> {
        self.entries
            .write()
            .await
            .insert((namespace, server_id.to_string()), value.to_string());
        Ok(())
    }

    async fn load(&self, namespace: Namespace, server_id: &str) -> McpResult<Option<String>> {
        Ok(self
            .entries
            .read()
            .await
            .get(&(namespace, server_id.to_string()))
            .cloned())
    }

    async fn delete(&self, namespace: Namespace, server_id: &str) -> McpResult<()> {
        self.entries
            .write()
            .await
            .remove(&(namespace, server_id.to_string()));
        Ok(())
    }
}

/// One JSON file per record: `<root>/<server_id>/<namespace>.json`.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    root: PathBuf,
}

impl FileTokenStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    fn path(&self, namespace: Namespace, server_id: &str) -> McpResult<PathBuf> {
        let valid = !server_id.is_empty()
            && server_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(McpError::storage(format!("invalid server id: {server_id:?}")));
        }
        Ok(self
            .root
            .join(server_id)
            .join(format!("{}.json", namespace.as_str())))
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn save(&self, namespace: Namespace, server_id: &str, value: &str) -> McpResult<()> {
        let path = self.path(namespace, server_id)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tokio::fs::write(&path, value).await?;

        #[cfg(unix)]
        if namespace.is_confidential() {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&path, perms).await.map_err(|e| {
                McpError::storage(format!("Failed to set permissions on {path:?}: {e}"))
            })?;
        }

        debug!(server = %server_id, namespace = namespace.as_str(), "Wrote stored record");
        Ok(())
    }

    async fn load(&self, namespace: Namespace, server_id: &str) -> McpResult<Option<String>> {
        let path = self.path(namespace, server_id)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => Ok(None),
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, namespace: Namespace, server_id: &str) -> McpResult<()> {
        let path = self.path(namespace, server_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        // Drop the per-server directory once it is empty.
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::remove_dir(parent).await;
        }
        Ok(())
    }
}
