//! Server registry and connection lifecycle.
//!
//! Every registered server moves through a small state machine:
//!
//! ```text
//! connecting ──▶ active ──▶ error
//!     │    └───▶ pending_auth ──▶ active
//!     │                 └───────▶ error
//!     └────────▶ error
//! ```
//!
//! An active server drops to `error` once its transport is gone for good.
//!
//! Connection attempts run as background tasks so `register` never waits on
//! the network. Locks on the registry are never held across I/O.

use crate::config::{ManagerSettings, OAuthConfig, ServerConfig, TransportConfig};
use crate::connector::{Connector, DefaultConnector};
use crate::error::{McpError, McpResult};
use crate::oauth::dynamic::{self, DynamicOAuth};
use crate::oauth::traditional::{ProviderRegistry, TraditionalOAuth};
use crate::oauth::{generate_state, state_prefix, PendingAuthorizations};
use crate::protocol::{ToolCallResult, ToolDescriptor};
use crate::session::McpSession;
use crate::store::TokenStore;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a registered server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Connecting,
    PendingAuth,
    Active,
    /// Terminal until the server is registered again.
    Error,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerStatus::Connecting => "connecting",
            ServerStatus::PendingAuth => "pending_auth",
            ServerStatus::Active => "active",
            ServerStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Result of [`ConnectionManager::register`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub id: String,
    pub status: ServerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_url: Option<String>,
}

/// One row of [`ConnectionManager::list`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSummary {
    pub id: String,
    pub name: String,
    pub status: ServerStatus,
    pub tool_count: usize,
}

/// Detail returned by [`ConnectionManager::get_status`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatusReport {
    pub id: String,
    pub name: String,
    pub status: ServerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_url: Option<String>,
}

/// Tools of one active server, as seen by the router.
#[derive(Debug, Clone)]
pub struct ServerTools {
    pub id: String,
    pub name: String,
    pub tools: Vec<ToolDescriptor>,
}

/// Runtime state for one server id.
struct ServerEntry {
    config: ServerConfig,
    status: ServerStatus,
    session: Option<McpSession>,
    tools: Vec<ToolDescriptor>,
    error: Option<String>,
    auth_url: Option<String>,
    task: Option<JoinHandle<()>>,
}

impl ServerEntry {
    fn new(config: ServerConfig, status: ServerStatus) -> Self {
        Self {
            config,
            status,
            session: None,
            tools: Vec::new(),
            error: None,
            auth_url: None,
            task: None,
        }
    }
}

/// A dynamic flow parked until its callback arrives.
struct PendingDynamic {
    server_id: String,
    flow: DynamicOAuth,
}

/// How a connection attempt ended.
enum Attempt {
    Connected {
        session: McpSession,
        tools: Vec<ToolDescriptor>,
    },
    NeedsAuthorization {
        auth_url: String,
    },
}

struct Inner {
    settings: ManagerSettings,
    store: Arc<dyn TokenStore>,
    connector: Arc<dyn Connector>,
    traditional: TraditionalOAuth,
    dynamic: Mutex<PendingAuthorizations<PendingDynamic>>,
    servers: RwLock<HashMap<String, ServerEntry>>,
    http: reqwest::Client,
}

/// Owns the server registry and drives every connection.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Manager with default settings, real transports and the provider table
    /// from the environment.
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        let settings = ManagerSettings::default();
        let connector = Arc::new(DefaultConnector::new(&settings));
        Self::with_parts(settings, store, ProviderRegistry::from_env(), connector)
    }

    pub fn with_parts(
        settings: ManagerSettings,
        store: Arc<dyn TokenStore>,
        providers: ProviderRegistry,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let traditional = TraditionalOAuth::new(providers, store.clone(), settings.pending_auth_ttl);
        let dynamic = Mutex::new(PendingAuthorizations::new(settings.pending_auth_ttl));
        Self {
            inner: Arc::new(Inner {
                settings,
                store,
                connector,
                traditional,
                dynamic,
                servers: RwLock::new(HashMap::new()),
                http: reqwest::Client::new(),
            }),
        }
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.inner.settings
    }

    /// Validate, persist and start connecting a server.
    ///
    /// Returns immediately. Traditional OAuth servers come back as
    /// `pending_auth` with the consent URL; everything else comes back as
    /// `connecting` while a background task does the work.
    pub async fn register(&self, config: ServerConfig) -> McpResult<Registration> {
        config.validate()?;
        let id = self.allocate_id().await;

        if let OAuthConfig::Traditional { .. } = &config.oauth {
            self.inner.store.save_config(&id, &config).await?;
            let redirect_uri = self.inner.settings.redirect_uri(&config);
            let auth_url = match self
                .inner
                .traditional
                .get_auth_url(&id, &config, &redirect_uri)
                .await
            {
                Ok(url) => url,
                Err(e) => {
                    if let Err(cleanup) = self.inner.store.delete_config(&id).await {
                        warn!(server = %id, error = %cleanup, "Failed to drop unused config");
                    }
                    return Err(e);
                }
            };

            let mut entry = ServerEntry::new(config, ServerStatus::PendingAuth);
            entry.auth_url = Some(auth_url.clone());
            self.inner.servers.write().await.insert(id.clone(), entry);

            info!(server = %id, "Server awaiting authorization");
            return Ok(Registration {
                id,
                status: ServerStatus::PendingAuth,
                auth_url: Some(auth_url),
            });
        }

        self.inner.store.save_config(&id, &config).await?;
        self.inner
            .servers
            .write()
            .await
            .insert(id.clone(), ServerEntry::new(config, ServerStatus::Connecting));

        let manager = self.clone();
        let task_id = id.clone();
        let task = tokio::spawn(async move { manager.background_connect(&task_id).await });

        if let Some(entry) = self.inner.servers.write().await.get_mut(&id) {
            if entry.status == ServerStatus::Connecting {
                entry.task = Some(task);
            }
        }

        info!(server = %id, "Server registered, connecting");
        Ok(Registration {
            id,
            status: ServerStatus::Connecting,
            auth_url: None,
        })
    }

    async fn allocate_id(&self) -> String {
        let servers = self.inner.servers.read().await;
        loop {
            let id: String = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
            if !servers.contains_key(&id) {
                return id;
            }
        }
    }

    /// Connect a `connecting` server and record the outcome.
    async fn background_connect(&self, id: &str) {
        let Some(config) = self.config_of(id).await else {
            return;
        };

        match self.attempt(id, &config).await {
            Ok(Attempt::Connected { session, tools }) => {
                self.activate(id, session, tools).await;
            }
            Ok(Attempt::NeedsAuthorization { auth_url }) => {
                let mut servers = self.inner.servers.write().await;
                if let Some(entry) = servers.get_mut(id) {
                    entry.status = ServerStatus::PendingAuth;
                    entry.auth_url = Some(auth_url);
                    entry.task = None;
                    info!(server = %id, "Server awaiting authorization");
                }
            }
            Err(e) => {
                error!(server = %id, error = %e, "Background connection failed");
                self.fail(id, &e).await;
            }
        }
    }

    async fn attempt(&self, id: &str, config: &ServerConfig) -> McpResult<Attempt> {
        let token = self.current_token(id, config).await;

        if let TransportConfig::Http { url, .. } = &config.transport {
            let may_use_dynamic = !matches!(config.oauth, OAuthConfig::Traditional { .. });
            if token.is_none()
                && may_use_dynamic
                && self.inner.connector.auth_probe(url).await.is_required()
            {
                info!(server = %id, "Server requires authorization, starting OAuth discovery");
                let auth_url = self.start_dynamic_flow(id, config, url).await?;
                return Ok(Attempt::NeedsAuthorization { auth_url });
            }
        }

        let (session, tools) = self.open(id, config, token.as_deref()).await?;
        Ok(Attempt::Connected { session, tools })
    }

    /// Connect, handshake and fetch the tool list.
    async fn open(
        &self,
        id: &str,
        config: &ServerConfig,
        token: Option<&str>,
    ) -> McpResult<(McpSession, Vec<ToolDescriptor>)> {
        let session = self.inner.connector.connect(id, config, token).await?;
        match session.list_tools().await {
            Ok(tools) => Ok((session, tools)),
            Err(e) => {
                close_quietly(id, &session).await;
                Err(e)
            }
        }
    }

    /// Stored token for a server, if there is a usable one.
    async fn current_token(&self, id: &str, config: &ServerConfig) -> Option<String> {
        let result = match &config.oauth {
            OAuthConfig::Traditional { .. } => self.inner.traditional.get_token(id).await,
            _ => self.dynamic_token(id).await,
        };
        match result {
            Ok(token) => Some(token),
            Err(McpError::NoToken(_)) => None,
            Err(e) => {
                warn!(server = %id, error = %e, "No usable OAuth token");
                None
            }
        }
    }

    async fn dynamic_token(&self, id: &str) -> McpResult<String> {
        let tokens = self
            .inner
            .store
            .load_tokens(id)
            .await?
            .ok_or_else(|| McpError::NoToken(id.to_string()))?;
        if tokens.is_fresh() {
            return Ok(tokens.access_token);
        }

        let client = self
            .inner
            .store
            .load_oauth_client(id)
            .await?
            .ok_or_else(|| McpError::NoToken(id.to_string()))?;
        let refreshed = dynamic::refresh(&self.inner.http, &client, &tokens).await?;
        self.inner.store.save_tokens(id, &refreshed).await?;
        Ok(refreshed.access_token)
    }

    async fn start_dynamic_flow(
        &self,
        id: &str,
        config: &ServerConfig,
        url: &str,
    ) -> McpResult<String> {
        let redirect_uri = self.inner.settings.redirect_uri(config);
        let mut flow = DynamicOAuth::discover(self.inner.http.clone(), url, redirect_uri).await?;
        let client = flow.register_client().await?.clone();
        flow.generate_pkce();

        let state = generate_state();
        let auth_url = flow.authorization_url(&state)?;

        self.inner.store.save_oauth_client(id, &client).await?;
        debug!(server = %id, state = state_prefix(&state), "Parked dynamic OAuth session");
        self.inner.dynamic.lock().await.insert(
            state,
            PendingDynamic {
                server_id: id.to_string(),
                flow,
            },
        );
        Ok(auth_url)
    }

    /// Finish an OAuth flow from its callback and return the server id.
    ///
    /// Dynamic sessions are consulted before traditional ones.
    pub async fn complete_authorization(&self, code: &str, state: &str) -> McpResult<String> {
        let parked = self.inner.dynamic.lock().await.take(state);

        let (server_id, token) = if let Some(PendingDynamic { server_id, flow }) = parked {
            info!(server = %server_id, "Completing dynamic OAuth");
            let tokens = match flow.exchange_code(code).await {
                Ok(tokens) => tokens,
                Err(e) => {
                    self.fail(&server_id, &e).await;
                    return Err(e);
                }
            };
            self.inner.store.save_tokens(&server_id, &tokens).await?;
            (server_id, tokens.access_token)
        } else if let Some(server_id) = self.inner.traditional.pending_server(state).await {
            let token = self.traditional_callback(&server_id, code, state).await?;
            (server_id, token)
        } else {
            warn!(state = state_prefix(state), "Callback state matches no pending authorization");
            return Err(McpError::NoMatchingAuth);
        };

        self.finalize(&server_id, &token).await?;
        Ok(server_id)
    }

    /// Exchange a traditional callback for `server_id`, which was parked
    /// under `state` when last checked.
    async fn traditional_callback(
        &self,
        server_id: &str,
        code: &str,
        state: &str,
    ) -> McpResult<String> {
        let result = match self.inner.traditional.handle_callback(code, state).await {
            Ok(id) => self.inner.traditional.get_token(&id).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(token) => Ok(token),
            // Another callback consumed the state first and owns the outcome.
            Err(McpError::InvalidState) => {
                debug!(server = %server_id, "Callback lost the race for its state");
                Err(McpError::NoMatchingAuth)
            }
            Err(e) => {
                self.fail(server_id, &e).await;
                Err(e)
            }
        }
    }

    /// Connect a `pending_auth` server with its fresh token.
    async fn finalize(&self, id: &str, token: &str) -> McpResult<()> {
        let config = self
            .config_of(id)
            .await
            .ok_or_else(|| McpError::UnknownServer(id.to_string()))?;

        match self.open(id, &config, Some(token)).await {
            Ok((session, tools)) => {
                self.activate(id, session, tools).await;
                Ok(())
            }
            Err(e) => {
                error!(server = %id, error = %e, "Connection after authorization failed");
                self.fail(id, &e).await;
                Err(e)
            }
        }
    }

    async fn activate(&self, id: &str, session: McpSession, tools: Vec<ToolDescriptor>) {
        let mut servers = self.inner.servers.write().await;
        match servers.get_mut(id) {
            Some(entry) => {
                info!(server = %id, tool_count = tools.len(), "Server active");
                entry.status = ServerStatus::Active;
                entry.session = Some(session);
                entry.tools = tools;
                entry.error = None;
                entry.auth_url = None;
                entry.task = None;
            }
            None => {
                drop(servers);
                debug!(server = %id, "Server removed while connecting, closing session");
                close_quietly(id, &session).await;
            }
        }
    }

    async fn fail(&self, id: &str, e: &McpError) {
        let session = {
            let mut servers = self.inner.servers.write().await;
            let Some(entry) = servers.get_mut(id) else {
                return;
            };
            entry.status = ServerStatus::Error;
            entry.error = Some(e.to_string());
            entry.auth_url = None;
            entry.task = None;
            entry.tools.clear();
            entry.session.take()
        };
        if let Some(session) = session {
            close_quietly(id, &session).await;
        }
    }

    /// Mark a server failed only if `session` is still the one it runs on.
    async fn fail_session(&self, id: &str, session: &McpSession, e: &McpError) {
        let current = {
            let servers = self.inner.servers.read().await;
            servers
                .get(id)
                .and_then(|entry| entry.session.as_ref())
                .is_some_and(|live| live.same_transport(session))
        };
        if current {
            self.fail(id, e).await;
        }
    }

    async fn config_of(&self, id: &str) -> Option<ServerConfig> {
        self.inner
            .servers
            .read()
            .await
            .get(id)
            .map(|entry| entry.config.clone())
    }

    /// Disconnect and forget a server. Removing an unknown id succeeds.
    pub async fn remove(&self, id: &str) -> McpResult<()> {
        let entry = self.inner.servers.write().await.remove(id);

        if let Some(entry) = entry {
            if let Some(task) = entry.task {
                task.abort();
            }
            if let Some(session) = entry.session {
                close_quietly(id, &session).await;
            }
            info!(server = %id, "Server removed");
        }

        self.inner
            .dynamic
            .lock()
            .await
            .retain(|pending| pending.server_id != id);
        self.inner.traditional.forget(id).await;

        self.inner.store.delete_config(id).await?;
        self.inner.store.delete_tokens(id).await?;
        self.inner.store.delete_oauth_client(id).await?;
        Ok(())
    }

    /// Call a tool on an active server.
    ///
    /// An authorization failure on an OAuth server triggers exactly one
    /// refresh + reconnect + retry. Every other error is returned as is.
    pub async fn execute(&self, id: &str, tool: &str, arguments: Value) -> McpResult<ToolCallResult> {
        let session = {
            let servers = self.inner.servers.read().await;
            let entry = servers
                .get(id)
                .ok_or_else(|| McpError::UnknownServer(id.to_string()))?;
            match (&entry.status, &entry.session) {
                (ServerStatus::Active, Some(session)) => session.clone(),
                _ => return Err(McpError::NotActive(id.to_string())),
            }
        };

        debug!(server = %id, tool, "Calling tool");
        let err = match session.call_tool(tool, arguments.clone()).await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };
        if matches!(err, McpError::RestartExhausted(_)) || !session.is_connected() {
            error!(server = %id, error = %err, "Transport lost");
            self.fail_session(id, &session, &err).await;
            return Err(err);
        }
        if !err.is_unauthorized() || !self.uses_oauth(id).await {
            return Err(err);
        }

        warn!(server = %id, tool, "Authorization rejected, refreshing and reconnecting");
        let session = self.reauthorize(id).await?;
        session.call_tool(tool, arguments).await
    }

    async fn uses_oauth(&self, id: &str) -> bool {
        let Some(config) = self.config_of(id).await else {
            return false;
        };
        if !config.oauth.is_none() {
            return true;
        }
        // Servers without declared OAuth may still have gone through the
        // dynamic flow after a 401.
        matches!(self.inner.store.load_oauth_client(id).await, Ok(Some(_)))
    }

    /// Refresh the token and swap in a new session.
    async fn reauthorize(&self, id: &str) -> McpResult<McpSession> {
        let result = async {
            let config = self
                .config_of(id)
                .await
                .ok_or_else(|| McpError::UnknownServer(id.to_string()))?;
            let token = self.refresh_token(id, &config).await?;
            let (session, tools) = self.open(id, &config, Some(&token)).await?;
            Ok::<_, McpError>((session, tools))
        }
        .await;

        let (session, tools) = match result {
            Ok(opened) => opened,
            Err(e) => {
                error!(server = %id, error = %e, "Could not restore authorization");
                self.fail(id, &e).await;
                return Err(e);
            }
        };

        let old = {
            let mut servers = self.inner.servers.write().await;
            match servers.get_mut(id) {
                Some(entry) => {
                    entry.tools = tools;
                    entry.session.replace(session.clone())
                }
                None => {
                    drop(servers);
                    close_quietly(id, &session).await;
                    return Err(McpError::UnknownServer(id.to_string()));
                }
            }
        };
        if let Some(old) = old {
            close_quietly(id, &old).await;
        }

        info!(server = %id, "Reconnected with refreshed token");
        Ok(session)
    }

    async fn refresh_token(&self, id: &str, config: &ServerConfig) -> McpResult<String> {
        if let OAuthConfig::Traditional { .. } = config.oauth {
            return self.inner.traditional.force_refresh(id).await;
        }

        let tokens = self
            .inner
            .store
            .load_tokens(id)
            .await?
            .ok_or_else(|| McpError::NoToken(id.to_string()))?;
        let client = self
            .inner
            .store
            .load_oauth_client(id)
            .await?
            .ok_or_else(|| McpError::Refresh(format!("no client registration for {id}")))?;
        let refreshed = dynamic::refresh(&self.inner.http, &client, &tokens).await?;
        self.inner.store.save_tokens(id, &refreshed).await?;
        Ok(refreshed.access_token)
    }

    /// Snapshot of every registered server, ordered by id.
    pub async fn list(&self) -> Vec<ServerSummary> {
        let servers = self.inner.servers.read().await;
        let mut list: Vec<ServerSummary> = servers
            .iter()
            .map(|(id, entry)| ServerSummary {
                id: id.clone(),
                name: entry.config.name.clone(),
                status: entry.status,
                tool_count: entry.tools.len(),
            })
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Cached tool list of a server; empty unless it is active.
    pub async fn get_tools(&self, id: &str) -> McpResult<Vec<ToolDescriptor>> {
        let servers = self.inner.servers.read().await;
        servers
            .get(id)
            .map(|entry| entry.tools.clone())
            .ok_or_else(|| McpError::UnknownServer(id.to_string()))
    }

    pub async fn get_status(&self, id: &str) -> McpResult<ServerStatusReport> {
        let servers = self.inner.servers.read().await;
        let entry = servers
            .get(id)
            .ok_or_else(|| McpError::UnknownServer(id.to_string()))?;
        Ok(ServerStatusReport {
            id: id.to_string(),
            name: entry.config.name.clone(),
            status: entry.status,
            error: entry.error.clone(),
            auth_url: entry.auth_url.clone(),
        })
    }

    /// Tools of every active server, ordered by server id.
    pub async fn active_tools(&self) -> Vec<ServerTools> {
        let servers = self.inner.servers.read().await;
        let mut active: Vec<ServerTools> = servers
            .iter()
            .filter(|(_, entry)| entry.status == ServerStatus::Active)
            .map(|(id, entry)| ServerTools {
                id: id.clone(),
                name: entry.config.name.clone(),
                tools: entry.tools.clone(),
            })
            .collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        active
    }

    /// Poll until a server leaves `connecting` or `timeout` passes.
    pub async fn wait_settled(&self, id: &str, timeout: Duration) -> McpResult<ServerStatus> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self.get_status(id).await?.status;
            if status != ServerStatus::Connecting || tokio::time::Instant::now() >= deadline {
                return Ok(status);
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Close every live session. Registrations stay persisted.
    pub async fn shutdown(&self) {
        let sessions: Vec<(String, McpSession)> = {
            let mut servers = self.inner.servers.write().await;
            servers
                .iter_mut()
                .filter_map(|(id, entry)| {
                    if let Some(task) = entry.task.take() {
                        task.abort();
                    }
                    entry.session.take().map(|s| (id.clone(), s))
                })
                .collect()
        };
        for (id, session) in sessions {
            close_quietly(&id, &session).await;
        }
    }
}

async fn close_quietly(id: &str, session: &McpSession) {
    if let Err(e) = session.close().await {
        warn!(server = %id, error = %e, "Failed to close session");
    }
}
