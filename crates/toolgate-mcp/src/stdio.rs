//! Stdio transport: line-delimited JSON-RPC over a child process's pipes.
//!
//! A background task owns the read side and resolves pending requests by id.
//! Before each call the transport checks the child is still alive, restarts it
//! a bounded number of times, and pings it every [`PROBE_INTERVAL`].

use crate::error::{McpError, McpResult};
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};
use crate::transport::Transport;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default per-request timeout. First calls may trigger package downloads
/// in the spawned process, so this is generous.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Restarts allowed over the lifetime of one transport.
pub const MAX_RESTARTS: u32 = 3;

/// Minimum time between liveness pings.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Timeout for a liveness ping.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `close` waits for the process to exit before killing it.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// How to launch a stdio server.
#[derive(Debug, Clone)]
pub struct StdioConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Added on top of the inherited process environment.
    pub env: HashMap<String, String>,
    pub request_timeout: Duration,
}

impl StdioConfig {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: HashMap::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<McpResult<Value>>>>>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One live pipe pair and the task reading it.
struct Link {
    writer: BoxedWriter,
    child: Option<Child>,
    reader: JoinHandle<()>,
}

/// MCP transport over a child process's stdin/stdout.
pub struct StdioTransport {
    /// Launch recipe, absent when wired to pre-existing streams.
    config: Option<StdioConfig>,
    request_timeout: Duration,
    link: Mutex<Option<Link>>,
    pending: PendingMap,
    next_id: AtomicU64,
    running: Arc<AtomicBool>,
    /// Bumped on every (re)start so a stale read loop cannot mark the
    /// current link dead.
    generation: Arc<AtomicU64>,
    restarts: AtomicU32,
    closed: AtomicBool,
    last_probe: Mutex<Instant>,
}

impl StdioTransport {
    /// Spawn the server process and start reading its stdout.
    pub fn connect(config: StdioConfig) -> McpResult<Self> {
        let transport = Self::unlinked(Some(config.clone()), config.request_timeout);
        let link = transport.start(&config)?;
        transport.install(link);
        info!(command = %config.command, "Started stdio MCP server");
        Ok(transport)
    }

    /// Run the protocol over arbitrary streams. There is no process to
    /// restart, so a closed stream is final.
    pub fn from_streams<R, W>(reader: R, writer: W, request_timeout: Duration) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let transport = Self::unlinked(None, request_timeout);
        let generation = transport.generation.fetch_add(1, Ordering::SeqCst) + 1;
        transport.running.store(true, Ordering::SeqCst);
        let reader = tokio::spawn(read_loop(
            reader,
            transport.pending.clone(),
            transport.running.clone(),
            transport.generation.clone(),
            generation,
        ));
        transport.install(Link {
            writer: Box::new(writer),
            child: None,
            reader,
        });
        transport
    }

    fn unlinked(config: Option<StdioConfig>, request_timeout: Duration) -> Self {
        Self {
            config,
            request_timeout,
            link: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            running: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
            restarts: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            last_probe: Mutex::new(Instant::now()),
        }
    }

    fn install(&self, link: Link) {
        // Only called while nothing else can hold the lock.
        if let Ok(mut slot) = self.link.try_lock() {
            *slot = Some(link);
        }
    }

    /// Spawn a fresh process and its read loop.
    fn start(&self, config: &StdioConfig) -> McpResult<Link> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        debug!(command = %config.command, args = ?config.args, "Spawning stdio server");

        let mut child = cmd
            .spawn()
            .map_err(|e| McpError::Launch(format!("{}: {e}", config.command)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Launch("Failed to get stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Launch("Failed to get stdout".to_string()))?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.running.store(true, Ordering::SeqCst);
        let reader = tokio::spawn(read_loop(
            stdout,
            self.pending.clone(),
            self.running.clone(),
            self.generation.clone(),
            generation,
        ));

        Ok(Link {
            writer: Box::new(stdin),
            child: Some(child),
            reader,
        })
    }

    /// Number of restarts performed so far.
    pub fn restart_count(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    /// Number of requests still awaiting a response.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn process_alive(&self) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }
        let mut link = self.link.lock().await;
        let Some(link) = link.as_mut() else {
            return false;
        };
        let Some(child) = link.child.as_mut() else {
            return true;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(%status, "Stdio server exited");
                self.running.store(false, Ordering::SeqCst);
                false
            }
            Err(e) => {
                warn!(error = %e, "Could not query stdio server status");
                true
            }
        }
    }

    /// Restart a dead process (bounded) or ping a live one when due.
    async fn ensure_healthy(&self) -> McpResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::NotConnected);
        }

        if self.process_alive().await {
            if self.probe_due().await {
                self.probe().await;
            }
            return Ok(());
        }

        let Some(config) = self.config.as_ref() else {
            return Err(McpError::NotConnected);
        };

        let mut link = self.link.lock().await;
        if self.running.load(Ordering::SeqCst) {
            // Someone else restarted it while we waited.
            return Ok(());
        }

        let used = self.restarts.load(Ordering::SeqCst);
        if used >= MAX_RESTARTS {
            return Err(McpError::RestartExhausted(used));
        }
        self.restarts.fetch_add(1, Ordering::SeqCst);
        warn!(command = %config.command, attempt = used + 1, "Stdio server exited, restarting");

        if let Some(old) = link.take() {
            old.reader.abort();
        }
        fail_pending(&self.pending).await;

        *link = Some(self.start(config)?);
        *self.last_probe.lock().await = Instant::now();
        Ok(())
    }

    async fn probe_due(&self) -> bool {
        let mut last = self.last_probe.lock().await;
        if last.elapsed() >= PROBE_INTERVAL {
            *last = Instant::now();
            true
        } else {
            false
        }
    }

    /// Probe failures are only logged; they never tear the transport down.
    async fn probe(&self) {
        match self.send_request("ping", None, PROBE_TIMEOUT).await {
            Ok(_) => debug!("Stdio health probe ok"),
            Err(McpError::Rpc { code, .. }) => {
                debug!(code, "Server rejected ping but is responsive")
            }
            Err(e) => warn!(error = %e, "Stdio health probe failed"),
        }
    }

    async fn write_line(&self, line: &str) -> McpResult<()> {
        let mut link = self.link.lock().await;
        let link = link.as_mut().ok_or(McpError::NotConnected)?;
        link.writer.write_all(line.as_bytes()).await?;
        link.writer.write_all(b"\n").await?;
        link.writer.flush().await?;
        Ok(())
    }

    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> McpResult<Value> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(McpError::NotConnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let line = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        debug!(id, method, "Sending stdio request");
        if let Err(e) = self.write_line(&line).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(McpError::NotConnected),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                warn!(id, method, "Stdio request timed out");
                Err(McpError::timeout(format!(
                    "{method} got no response within {}s",
                    timeout.as_secs_f64()
                )))
            }
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> McpResult<Value> {
        self.ensure_healthy().await?;
        self.send_request(method, params, self.request_timeout).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        if !self.is_connected() {
            return Err(McpError::NotConnected);
        }
        let line = serde_json::to_string(&JsonRpcRequest::notification(method, params))?;
        debug!(method, "Sending stdio notification");
        self.write_line(&line).await
    }

    async fn close(&self) -> McpResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);

        let link = self.link.lock().await.take();
        fail_pending(&self.pending).await;

        let Some(Link {
            writer,
            child,
            reader,
        }) = link
        else {
            return Ok(());
        };

        // Closing stdin is the polite way to ask a stdio server to exit.
        drop(writer);

        if let Some(mut child) = child {
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!(%status, "Stdio server exited"),
                Ok(Err(e)) => warn!(error = %e, "Failed waiting for stdio server"),
                Err(_) => {
                    warn!("Stdio server ignored shutdown, killing it");
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "Failed to kill stdio server");
                    }
                }
            }
        }

        reader.abort();
        debug!("Closed stdio transport");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }
}

/// Resolve every outstanding request with `NotConnected`.
async fn fail_pending(pending: &PendingMap) {
    let drained: Vec<_> = pending.lock().await.drain().collect();
    if !drained.is_empty() {
        debug!(count = drained.len(), "Failing pending stdio requests");
    }
    for (_, sender) in drained {
        let _ = sender.send(Err(McpError::NotConnected));
    }
}

async fn read_loop<R>(
    reader: R,
    pending: PendingMap,
    running: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
    own_generation: u64,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let message: Value = match serde_json::from_str(line) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(error = %e, "Skipping unparsable line from stdio server");
                        continue;
                    }
                };

                if let Some(method) = message.get("method").and_then(Value::as_str) {
                    debug!(method, "Ignoring server-initiated message");
                    continue;
                }

                let response: JsonRpcResponse = match serde_json::from_value(message) {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(error = %e, "Skipping malformed response from stdio server");
                        continue;
                    }
                };

                let Some(id) = response.numeric_id() else {
                    debug!("Ignoring response without a usable id");
                    continue;
                };

                let sender = pending.lock().await.remove(&id);
                match sender {
                    Some(sender) => {
                        let _ = sender.send(response.into_result().map_err(McpError::from));
                    }
                    None => debug!(id, "Ignoring response for unknown request"),
                }
            }
            Ok(None) => {
                debug!("Stdio server closed its output");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Error reading from stdio server");
                break;
            }
        }
    }

    if generation.load(Ordering::SeqCst) == own_generation {
        running.store(false, Ordering::SeqCst);
        fail_pending(&pending).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{split, AsyncBufReadExt, DuplexStream, Lines, ReadHalf, WriteHalf};

    /// Server side of an in-memory pipe.
    struct FakeServer {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl FakeServer {
        async fn next_request(&mut self) -> Value {
            let line = self.lines.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn send(&mut self, message: Value) {
            self.send_raw(&message.to_string()).await;
        }

        async fn send_raw(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
            self.writer.flush().await.unwrap();
        }
    }

    fn pair(timeout: Duration) -> (Arc<StdioTransport>, FakeServer) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = split(client);
        let (server_read, server_write) = split(server);
        let transport = StdioTransport::from_streams(client_read, client_write, timeout);
        let server = FakeServer {
            lines: BufReader::new(server_read).lines(),
            writer: server_write,
        };
        (Arc::new(transport), server)
    }

    #[tokio::test]
    async fn test_request_resolves_with_result() {
        let (transport, mut server) = pair(Duration::from_secs(5));

        let call = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.request("tools/list", None).await })
        };

        let request = server.next_request().await;
        assert_eq!(request["jsonrpc"], "2.0");
        assert_eq!(request["method"], "tools/list");
        server
            .send(json!({"jsonrpc": "2.0", "id": request["id"], "result": {"tools": []}}))
            .await;

        let result = call.await.unwrap().unwrap();
        assert_eq!(result, json!({"tools": []}));
        assert_eq!(transport.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_ids_increase_and_out_of_order_responses_correlate() {
        let (transport, mut server) = pair(Duration::from_secs(5));

        let first = {
            let t = transport.clone();
            tokio::spawn(async move { t.request("a", None).await })
        };
        let req_a = server.next_request().await;
        let second = {
            let t = transport.clone();
            tokio::spawn(async move { t.request("b", None).await })
        };
        let req_b = server.next_request().await;
        assert!(req_b["id"].as_u64().unwrap() > req_a["id"].as_u64().unwrap());

        server
            .send(json!({"jsonrpc": "2.0", "id": req_b["id"], "result": "b"}))
            .await;
        server
            .send(json!({"jsonrpc": "2.0", "id": req_a["id"], "result": "a"}))
            .await;

        assert_eq!(first.await.unwrap().unwrap(), json!("a"));
        assert_eq!(second.await.unwrap().unwrap(), json!("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_ping_keeps_transport_open() {
        let (transport, mut server) = pair(Duration::from_secs(60));
        tokio::time::advance(PROBE_INTERVAL + Duration::from_secs(1)).await;

        let call = {
            let t = transport.clone();
            tokio::spawn(async move { t.request("tools/list", None).await })
        };

        // The due ping goes out first and is left to time out.
        let ping = server.next_request().await;
        assert_eq!(ping["method"], "ping");

        let request = server.next_request().await;
        assert_eq!(request["method"], "tools/list");
        server
            .send(json!({"jsonrpc": "2.0", "id": request["id"], "result": {"tools": []}}))
            .await;

        assert_eq!(call.await.unwrap().unwrap(), json!({"tools": []}));
        assert!(transport.is_connected());
        assert_eq!(transport.pending_count().await, 0);

        // The next probe is not due yet.
        let call = {
            let t = transport.clone();
            tokio::spawn(async move { t.request("tools/list", None).await })
        };
        let request = server.next_request().await;
        assert_eq!(request["method"], "tools/list");
        server
            .send(json!({"jsonrpc": "2.0", "id": request["id"], "result": 1}))
            .await;
        assert_eq!(call.await.unwrap().unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_unparsable_line_is_skipped() {
        let (transport, mut server) = pair(Duration::from_secs(5));

        let call = {
            let t = transport.clone();
            tokio::spawn(async move { t.request("ping", None).await })
        };
        let request = server.next_request().await;
        server.send_raw("this is not json").await;
        server
            .send(json!({"jsonrpc": "2.0", "method": "notifications/progress"}))
            .await;
        server
            .send(json!({"jsonrpc": "2.0", "id": 9999, "result": "stray"}))
            .await;
        server
            .send(json!({"jsonrpc": "2.0", "id": request["id"], "result": {}}))
            .await;

        assert_eq!(call.await.unwrap().unwrap(), json!({}));
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn test_error_response_fails_only_that_request() {
        let (transport, mut server) = pair(Duration::from_secs(5));

        let bad = {
            let t = transport.clone();
            tokio::spawn(async move { t.request("bad", None).await })
        };
        let req_bad = server.next_request().await;
        let good = {
            let t = transport.clone();
            tokio::spawn(async move { t.request("good", None).await })
        };
        let req_good = server.next_request().await;

        server
            .send(json!({
                "jsonrpc": "2.0",
                "id": req_bad["id"],
                "error": {"code": -32601, "message": "Method not found"}
            }))
            .await;
        server
            .send(json!({"jsonrpc": "2.0", "id": req_good["id"], "result": 1}))
            .await;

        match bad.await.unwrap() {
            Err(McpError::Rpc { code, message }) => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
            }
            other => panic!("expected rpc error, got {other:?}"),
        }
        assert_eq!(good.await.unwrap().unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_timeout_removes_pending_and_late_response_is_ignored() {
        let (transport, mut server) = pair(Duration::from_millis(100));

        let result = {
            let t = transport.clone();
            let call = tokio::spawn(async move { t.request("slow", None).await });
            let _ = server.next_request().await;
            call.await.unwrap()
        };
        assert!(matches!(result, Err(McpError::Timeout(_))));
        assert_eq!(transport.pending_count().await, 0);

        // The late answer for the timed-out id (1) must not leak into the
        // next request.
        server
            .send(json!({"jsonrpc": "2.0", "id": 1, "result": "late"}))
            .await;

        let next = {
            let t = transport.clone();
            tokio::spawn(async move { t.request("fast", None).await })
        };
        let request = server.next_request().await;
        assert_eq!(request["id"], 2);
        server
            .send(json!({"jsonrpc": "2.0", "id": 2, "result": "fresh"}))
            .await;

        assert_eq!(next.await.unwrap().unwrap(), json!("fresh"));
        assert_eq!(transport.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_stream_close_fails_pending_and_disconnects() {
        let (transport, mut server) = pair(Duration::from_secs(5));

        let call = {
            let t = transport.clone();
            tokio::spawn(async move { t.request("never", None).await })
        };
        let _ = server.next_request().await;
        drop(server);

        assert!(matches!(call.await.unwrap(), Err(McpError::NotConnected)));
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.request("again", None).await,
            Err(McpError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_notify_writes_notification() {
        let (transport, mut server) = pair(Duration::from_secs(5));
        transport
            .notify("notifications/initialized", None)
            .await
            .unwrap();
        let message = server.next_request().await;
        assert_eq!(message["method"], "notifications/initialized");
        assert!(message.get("id").is_none());
    }

    #[tokio::test]
    async fn test_close_is_final() {
        let (transport, _server) = pair(Duration::from_secs(5));
        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.request("x", None).await,
            Err(McpError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_launch_failure() {
        let config = StdioConfig::new("/nonexistent/toolgate-no-such-binary", vec![]);
        let result = StdioTransport::connect(config);
        assert!(matches!(result, Err(McpError::Launch(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_restart_is_bounded() {
        let config = StdioConfig::new("true", vec![])
            .with_request_timeout(Duration::from_secs(2));
        let transport = StdioTransport::connect(config).unwrap();

        for attempt in 1..=MAX_RESTARTS {
            tokio::time::sleep(Duration::from_millis(200)).await;
            // The process restarts, then exits again without answering.
            assert!(transport.request("ping", None).await.is_err());
            assert_eq!(transport.restart_count(), attempt);
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(matches!(
            transport.request("ping", None).await,
            Err(McpError::RestartExhausted(3))
        ));
        transport.close().await.unwrap();
    }
}
