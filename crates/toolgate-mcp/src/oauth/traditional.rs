//! Authorization-code flow against pre-registered providers.
//!
//! Client credentials come from the process environment
//! (`<PROVIDER>_CLIENT_ID`, `<PROVIDER>_CLIENT_SECRET`), never from the
//! server registration.

use super::tokens::{post_token_form, TokenSet};
use super::{generate_state, state_prefix, PendingAuthorizations};
use crate::config::{OAuthConfig, ServerConfig};
use crate::error::{McpError, McpResult};
use crate::store::TokenStore;
use chrono::Utc;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Endpoints and credentials for one provider.
#[derive(Clone)]
pub struct ProviderConfig {
    pub name: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub client_id: String,
    pub client_secret: String,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("name", &self.name)
            .field("authorization_endpoint", &self.authorization_endpoint)
            .field("token_endpoint", &self.token_endpoint)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl ProviderConfig {
    /// Build a provider whose credentials are read from the environment.
    pub fn from_env(name: &str, authorization_endpoint: &str, token_endpoint: &str) -> Self {
        let prefix = name.to_ascii_uppercase();
        Self {
            name: name.to_string(),
            authorization_endpoint: authorization_endpoint.to_string(),
            token_endpoint: token_endpoint.to_string(),
            client_id: std::env::var(format!("{prefix}_CLIENT_ID")).unwrap_or_default(),
            client_secret: std::env::var(format!("{prefix}_CLIENT_SECRET")).unwrap_or_default(),
        }
    }
}

/// The static provider table.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, ProviderConfig>,
}

impl ProviderRegistry {
    /// An empty table, for tests and custom deployments.
    pub fn new() -> Self {
        Self::default()
    }

    /// Google, GitHub and Notion with credentials from the environment.
    pub fn from_env() -> Self {
        Self::new()
            .with_provider(ProviderConfig::from_env(
                "google",
                "https://accounts.google.com/o/oauth2/v2/auth",
                "https://oauth2.googleapis.com/token",
            ))
            .with_provider(ProviderConfig::from_env(
                "github",
                "https://github.com/login/oauth/authorize",
                "https://github.com/login/oauth/access_token",
            ))
            .with_provider(ProviderConfig::from_env(
                "notion",
                "https://api.notion.com/v1/oauth/authorize",
                "https://api.notion.com/v1/oauth/token",
            ))
    }

    pub fn with_provider(mut self, provider: ProviderConfig) -> Self {
        self.providers.insert(provider.name.clone(), provider);
        self
    }

    pub fn get(&self, name: &str) -> McpResult<&ProviderConfig> {
        self.providers
            .get(name)
            .ok_or_else(|| McpError::UnknownProvider(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// What a callback needs to finish the flow.
#[derive(Debug, Clone)]
struct PendingTraditional {
    server_id: String,
    provider: String,
    redirect_uri: String,
}

/// Traditional OAuth handler shared by every server using a provider.
pub struct TraditionalOAuth {
    providers: ProviderRegistry,
    store: Arc<dyn TokenStore>,
    http: Client,
    pending: Mutex<PendingAuthorizations<PendingTraditional>>,
    cache: RwLock<HashMap<String, TokenSet>>,
}

impl TraditionalOAuth {
    pub fn new(providers: ProviderRegistry, store: Arc<dyn TokenStore>, pending_ttl: Duration) -> Self {
        Self {
            providers,
            store,
            http: Client::new(),
            pending: Mutex::new(PendingAuthorizations::new(pending_ttl)),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Build the consent URL and park the server under a fresh state.
    pub async fn get_auth_url(
        &self,
        server_id: &str,
        config: &ServerConfig,
        redirect_uri: &str,
    ) -> McpResult<String> {
        let OAuthConfig::Traditional { provider, scopes } = &config.oauth else {
            return Err(McpError::InvalidConfig(format!(
                "server {} does not use traditional oauth",
                config.name
            )));
        };
        let provider = self.providers.get(provider)?;

        let state = generate_state();
        let url = format!(
            "{}?client_id={}&redirect_uri={}&scope={}&state={}&response_type=code&access_type=offline&prompt=consent",
            provider.authorization_endpoint,
            urlencoding::encode(&provider.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(&scopes.join(" ")),
            urlencoding::encode(&state),
        );

        debug!(server = %server_id, provider = %provider.name, state = state_prefix(&state), "Generated authorization URL");

        self.pending.lock().await.insert(
            state,
            PendingTraditional {
                server_id: server_id.to_string(),
                provider: provider.name.clone(),
                redirect_uri: redirect_uri.to_string(),
            },
        );

        Ok(url)
    }

    /// Whether `state` belongs to a live pending authorization.
    pub async fn has_pending(&self, state: &str) -> bool {
        self.pending.lock().await.contains(state)
    }

    /// Number of live pending authorizations.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Server parked under `state`, if any. Does not consume the state.
    pub async fn pending_server(&self, state: &str) -> Option<String> {
        self.pending
            .lock()
            .await
            .get(state)
            .map(|pending| pending.server_id.clone())
    }

    /// Exchange the code, persist the tokens and return the server id.
    pub async fn handle_callback(&self, code: &str, state: &str) -> McpResult<String> {
        let pending = self
            .pending
            .lock()
            .await
            .take(state)
            .ok_or(McpError::InvalidState)?;
        let provider = self.providers.get(&pending.provider)?;

        info!(server = %pending.server_id, provider = %provider.name, "Exchanging authorization code");

        let response = post_token_form(
            &self.http,
            &provider.token_endpoint,
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("client_id", provider.client_id.as_str()),
                ("client_secret", provider.client_secret.as_str()),
                ("redirect_uri", pending.redirect_uri.as_str()),
            ],
        )
        .await
        .map_err(McpError::TokenExchange)?;

        let tokens = TokenSet::from_response(response, Utc::now());
        self.store.save_tokens(&pending.server_id, &tokens).await?;
        self.cache
            .write()
            .await
            .insert(pending.server_id.clone(), tokens);

        info!(server = %pending.server_id, "OAuth completed");
        Ok(pending.server_id)
    }

    /// A usable access token, refreshing it when it is inside the margin.
    pub async fn get_token(&self, server_id: &str) -> McpResult<String> {
        if let Some(cached) = self.cache.read().await.get(server_id) {
            if cached.is_fresh() {
                return Ok(cached.access_token.clone());
            }
        }

        let tokens = self
            .store
            .load_tokens(server_id)
            .await?
            .ok_or_else(|| McpError::NoToken(server_id.to_string()))?;

        let tokens = if tokens.is_fresh() {
            tokens
        } else {
            info!(server = %server_id, "Token expiring soon, refreshing");
            self.refresh(server_id, &tokens).await?
        };

        let access_token = tokens.access_token.clone();
        self.cache.write().await.insert(server_id.to_string(), tokens);
        Ok(access_token)
    }

    /// Refresh regardless of expiry; used after the server rejected a token.
    pub async fn force_refresh(&self, server_id: &str) -> McpResult<String> {
        let tokens = self
            .store
            .load_tokens(server_id)
            .await?
            .ok_or_else(|| McpError::NoToken(server_id.to_string()))?;
        let tokens = self.refresh(server_id, &tokens).await?;
        let access_token = tokens.access_token.clone();
        self.cache.write().await.insert(server_id.to_string(), tokens);
        Ok(access_token)
    }

    /// Run a refresh-token grant and persist the result.
    pub async fn refresh(&self, server_id: &str, old: &TokenSet) -> McpResult<TokenSet> {
        let refresh_token = old
            .refresh_token
            .as_deref()
            .ok_or_else(|| McpError::Refresh("no refresh token stored".to_string()))?;

        let config = self
            .store
            .load_config(server_id)
            .await?
            .ok_or_else(|| McpError::UnknownServer(server_id.to_string()))?;
        let OAuthConfig::Traditional { provider, .. } = &config.oauth else {
            return Err(McpError::Refresh(format!(
                "server {server_id} does not use traditional oauth"
            )));
        };
        let provider = self.providers.get(provider)?;

        let response = post_token_form(
            &self.http,
            &provider.token_endpoint,
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", provider.client_id.as_str()),
                ("client_secret", provider.client_secret.as_str()),
            ],
        )
        .await
        .map_err(McpError::Refresh)?;

        let tokens = TokenSet::from_response(response, Utc::now()).inherit_refresh_token(old);
        self.store.save_tokens(server_id, &tokens).await?;

        info!(server = %server_id, "Token refreshed");
        Ok(tokens)
    }

    /// Drop cached tokens and pending authorizations for a removed server.
    pub async fn forget(&self, server_id: &str) {
        self.cache.write().await.remove(server_id);
        self.pending
            .lock()
            .await
            .retain(|pending| pending.server_id != server_id);
    }
}
