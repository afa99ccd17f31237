//! Streamable HTTP transport for remote MCP servers.
//!
//! Every JSON-RPC message is an HTTP POST to the server URL. Responses come
//! back either as plain JSON or as an SSE stream carrying the response in a
//! `data:` event. The server-assigned `Mcp-Session-Id` is echoed on every
//! later request so the remote keeps one session for the transport's life.

use crate::error::{McpError, McpResult};
use crate::protocol::{JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION};
use crate::transport::Transport;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Header carrying the server-assigned session.
pub const SESSION_HEADER: &str = "Mcp-Session-Id";

/// Default request timeout.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// HTTP transport configuration.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// The server URL (e.g., `https://mcp.example.com/mcp`)
    pub url: String,
    /// Extra headers sent with every request.
    pub headers: HashMap<String, String>,
    /// Optional bearer token
    pub bearer_token: Option<String>,
    pub timeout: Duration,
}

impl HttpConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HashMap::new(),
            bearer_token: None,
            timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_bearer_token(mut self, token: Option<String>) -> Self {
        self.bearer_token = token;
        self
    }
}

/// Outcome of an unauthenticated probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthProbe {
    /// The server answered 401. Carries the `WWW-Authenticate` challenge.
    Required { challenge: Option<String> },
    /// Anything else, including network failure.
    NotRequired,
}

impl AuthProbe {
    pub fn is_required(&self) -> bool {
        matches!(self, AuthProbe::Required { .. })
    }
}

/// Ask the server whether it wants credentials, without sending any.
///
/// Errors are deliberately folded into [`AuthProbe::NotRequired`]: the real
/// connect attempt reports them with better context.
pub async fn auth_probe(url: &str, timeout: Duration) -> AuthProbe {
    let client = match Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "Failed to build probe client");
            return AuthProbe::NotRequired;
        }
    };

    let body = json!({"jsonrpc": "2.0", "method": "initialize", "params": {}, "id": 1});
    let response = client
        .post(url)
        .header("Accept", "application/json, text/event-stream")
        .json(&body)
        .send()
        .await;

    match response {
        Ok(response) if response.status() == StatusCode::UNAUTHORIZED => {
            let challenge = response
                .headers()
                .get("www-authenticate")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            debug!(url, challenge = ?challenge, "Server requires authorization");
            AuthProbe::Required { challenge }
        }
        Ok(response) => {
            debug!(url, status = %response.status(), "Auth probe: no authorization required");
            AuthProbe::NotRequired
        }
        Err(e) => {
            debug!(url, error = %e, "Auth probe failed, assuming no authorization");
            AuthProbe::NotRequired
        }
    }
}

/// HTTP transport for remote MCP servers.
pub struct HttpTransport {
    config: HttpConfig,
    client: Client,
    connected: AtomicBool,
    next_id: AtomicU64,
    session_id: RwLock<Option<String>>,
}

impl HttpTransport {
    /// Create an unopened transport. Requests fail with `NotConnected`
    /// until [`HttpTransport::connect`] is used instead.
    pub fn new(config: HttpConfig) -> McpResult<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            config,
            client,
            connected: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            session_id: RwLock::new(None),
        })
    }

    /// Create a transport ready to carry the handshake.
    pub fn connect(config: HttpConfig) -> McpResult<Self> {
        let transport = Self::new(config)?;
        transport.connected.store(true, Ordering::SeqCst);
        Ok(transport)
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// Session id assigned by the server, if any.
    pub async fn session_id(&self) -> Option<String> {
        self.session_id.read().await.clone()
    }

    /// Build request with common headers.
    async fn build_request(&self, method: reqwest::Method) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .request(method, &self.config.url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .header("MCP-Protocol-Version", PROTOCOL_VERSION);

        for (name, value) in &self.config.headers {
            req = req.header(name.as_str(), value.as_str());
        }

        if let Some(ref token) = self.config.bearer_token {
            req = req.bearer_auth(token);
        }

        if let Some(ref session) = *self.session_id.read().await {
            req = req.header(SESSION_HEADER, session.as_str());
        }

        req
    }

    async fn post(&self, body: String) -> McpResult<reqwest::Response> {
        let response = self
            .build_request(reqwest::Method::POST)
            .await
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    McpError::timeout(format!("{}: {e}", self.config.url))
                } else {
                    McpError::Http(e)
                }
            })?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.write().await = Some(session.to_string());
        }

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(McpError::Unauthorized(format!("server returned {status}")));
        }

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(McpError::protocol_error(format!(
                "Server returned {status}: {text}"
            )));
        }

        Ok(response)
    }

    /// Pull the response for `id` out of a JSON or SSE body.
    async fn read_response(&self, response: reqwest::Response, id: u64) -> McpResult<Value> {
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let response = if content_type.contains("text/event-stream") {
            parse_sse_stream(response, id).await?
        } else {
            let text = response
                .text()
                .await
                .map_err(|e| McpError::protocol_error(format!("Failed to read response: {e}")))?;
            serde_json::from_str::<JsonRpcResponse>(&text)
                .map_err(|e| McpError::protocol_error(format!("Invalid JSON response: {e}")))?
        };

        response.into_result().map_err(McpError::from)
    }
}

/// Scan SSE events until one carries the response to `id`.
async fn parse_sse_stream(response: reqwest::Response, id: u64) -> McpResult<JsonRpcResponse> {
    scan_sse(response.bytes_stream(), id).await
}

/// Lines are split on raw bytes so a UTF-8 sequence cut across chunks is
/// decoded whole.
async fn scan_sse<S, B, E>(stream: S, id: u64) -> McpResult<JsonRpcResponse>
where
    S: futures::Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    use futures::StreamExt;

    let mut stream = std::pin::pin!(stream);
    let mut buffer: Vec<u8> = Vec::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| McpError::protocol_error(format!("Stream error: {e}")))?;
        buffer.extend_from_slice(chunk.as_ref());

        while let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=newline).collect();
            if let Some(found) = sse_line_response(&line, id) {
                return Ok(found);
            }
        }
    }

    if let Some(found) = sse_line_response(&buffer, id) {
        return Ok(found);
    }

    Err(McpError::protocol_error("SSE stream ended without response"))
}

fn sse_line_response(line: &[u8], id: u64) -> Option<JsonRpcResponse> {
    match std::str::from_utf8(line) {
        Ok(line) => sse_data_response(line.trim_end(), id),
        Err(e) => {
            warn!(error = %e, "Skipping SSE line with invalid UTF-8");
            None
        }
    }
}

fn sse_data_response(line: &str, id: u64) -> Option<JsonRpcResponse> {
    let data = line.strip_prefix("data:")?.trim_start();
    let response: JsonRpcResponse = serde_json::from_str(data).ok()?;
    // Server-side notifications share the stream; skip them.
    if response.result.is_none() && response.error.is_none() {
        return None;
    }
    match response.numeric_id() {
        Some(got) if got != id => None,
        _ => Some(response),
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> McpResult<Value> {
        if !self.is_connected() {
            return Err(McpError::NotConnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let body = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;

        debug!(id, method, url = %self.config.url, "Sending HTTP request");

        let response = self.post(body).await?;
        self.read_response(response, id).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        if !self.is_connected() {
            return Err(McpError::NotConnected);
        }

        let body = serde_json::to_string(&JsonRpcRequest::notification(method, params))?;
        debug!(method, "Sending HTTP notification");

        match self.post(body).await {
            Ok(_) => Ok(()),
            Err(e @ McpError::Unauthorized(_)) => Err(e),
            Err(e) => {
                warn!(method, error = %e, "Notification was not accepted");
                Ok(())
            }
        }
    }

    async fn close(&self) -> McpResult<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let session = self.session_id.write().await.take();
        if let Some(session) = session {
            let result = self
                .client
                .delete(&self.config.url)
                .header(SESSION_HEADER, session.as_str())
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => {
                    debug!("Terminated HTTP session")
                }
                Ok(response) => {
                    debug!(status = %response.status(), "Server did not acknowledge session teardown")
                }
                Err(e) => warn!(error = %e, "Failed to terminate HTTP session"),
            }
        }

        debug!("Closed HTTP transport");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
