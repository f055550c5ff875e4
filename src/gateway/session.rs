//! Session management for gateway-owned MCP child processes.
//!
//! One supervision task per configured server owns the full lifecycle:
//! spawn, initialize handshake, tool discovery, ping-driven health, crash
//! detection, restart policy, and shutdown. The wire is line-delimited
//! JSON-RPC: a writer task serializes all stdin writes, a reader task routes
//! responses to waiters by request id and silently discards non-JSON stdout
//! lines from noisy servers.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::error::{RestexecError, Result};
use crate::gateway::config::{GatewaySettings, McpServerConfig, RestartPolicy};
use crate::gateway::registry::{ToolDescriptor, ToolRegistry};
use crate::gateway::rpc::{
    IncomingFrame, NotificationFrame, RequestFrame, RpcReply, first_text_content,
    initialize_params, is_error_result,
};

/// Window for the initialize handshake and startup tool discovery.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Budget for one health-check ping.
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Restart attempts before a crash becomes terminal (policy `on-failure`).
const MAX_RESTARTS: u32 = 3;

/// First restart backoff; doubles per attempt (1s, 2s, 4s).
const RESTART_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Lines of child stderr retained for crash diagnostics.
const STDERR_TAIL_LINES: usize = 100;

/// Capacity of the outgoing-frame channel feeding the writer task.
const OUTGOING_CAPACITY: usize = 64;

/// Lifecycle states of one managed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Starting,
    Available,
    Unavailable,
    Crashed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Available => "available",
            Self::Unavailable => "unavailable",
            Self::Crashed => "crashed",
        }
    }
}

/// Rolling tail of child stderr, for diagnostics.
pub struct StderrRing {
    lines: VecDeque<String>,
    capacity: usize,
}

impl StderrRing {
    fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            capacity,
        }
    }

    fn push(&mut self, line: String) {
        if self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn tail(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

/// A live stdio connection to one child process.
///
/// Writes are serialized through the writer task's channel; responses are
/// routed back by request id through the pending map. Multiple concurrent
/// callers share one connection safely.
pub struct Connection {
    server: String,
    outgoing_tx: mpsc::Sender<String>,
    pending: Arc<Mutex<HashMap<i64, oneshot::Sender<RpcReply>>>>,
    id_counter: AtomicI64,
    stderr_tail: Arc<Mutex<StderrRing>>,
}

impl Connection {
    /// Issue a request and await its reply within `timeout`.
    ///
    /// The pending entry is registered before the frame is written so an
    /// immediate response cannot be lost, and removed again on timeout so
    /// the abandoned call cannot leak.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<RpcReply> {
        let id = self.id_counter.fetch_add(1, Ordering::SeqCst);
        let frame = RequestFrame::new(id, method, params);
        let line = serde_json::to_string(&frame)
            .map_err(|e| RestexecError::Internal(format!("frame serialization failed: {e}")))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self.outgoing_tx.send(line).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(RestexecError::ServerCrashed(self.server.clone()));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(RestexecError::ServerCrashed(self.server.clone())),
            Err(_) => {
                // Deadline fired: cancel the pending call.
                self.pending.lock().await.remove(&id);
                Err(RestexecError::CallTimeout {
                    server: self.server.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Send a notification (no response expected).
    pub async fn notify(&self, method: &str) -> Result<()> {
        let frame = NotificationFrame::new(method);
        let line = serde_json::to_string(&frame)
            .map_err(|e| RestexecError::Internal(format!("frame serialization failed: {e}")))?;
        self.outgoing_tx
            .send(line)
            .await
            .map_err(|_| RestexecError::ServerCrashed(self.server.clone()))
    }

    async fn stderr_lines(&self) -> Vec<String> {
        self.stderr_tail.lock().await.tail()
    }
}

/// Spawn the child and wire up the writer, reader, and stderr tasks.
///
/// The returned receiver fires once when the child's stdout reaches EOF —
/// the session loop treats that as the crash signal.
fn spawn_connection(
    config: &McpServerConfig,
) -> Result<(Arc<Connection>, Child, oneshot::Receiver<()>)> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args)
        .envs(&config.env)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| RestexecError::SpawnFailure(format!("'{}': {e}", config.name)))?;

    let mut stdin = child.stdin.take().ok_or_else(|| {
        RestexecError::Internal("stdin pipe was unexpectedly not available".to_string())
    })?;
    let stdout = child.stdout.take().ok_or_else(|| {
        RestexecError::Internal("stdout pipe was unexpectedly not available".to_string())
    })?;
    let stderr = child.stderr.take().ok_or_else(|| {
        RestexecError::Internal("stderr pipe was unexpectedly not available".to_string())
    })?;

    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<String>(OUTGOING_CAPACITY);
    let pending: Arc<Mutex<HashMap<i64, oneshot::Sender<RpcReply>>>> =
        Arc::new(Mutex::new(HashMap::new()));
    let stderr_tail = Arc::new(Mutex::new(StderrRing::new(STDERR_TAIL_LINES)));

    // Writer task: the only stdin writer, so frame writes never interleave.
    let writer_server = config.name.clone();
    tokio::spawn(async move {
        while let Some(line) = outgoing_rx.recv().await {
            if stdin.write_all(line.as_bytes()).await.is_err()
                || stdin.write_all(b"\n").await.is_err()
                || stdin.flush().await.is_err()
            {
                tracing::debug!(server = %writer_server, "stdin write failed, writer stopping");
                break;
            }
        }
    });

    // Reader task: route responses by id; EOF is the exit signal.
    let (exit_tx, exit_rx) = oneshot::channel::<()>();
    let reader_server = config.name.clone();
    let reader_pending = pending.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let frame: IncomingFrame = match serde_json::from_str(&line) {
                        Ok(frame) => frame,
                        Err(_) => {
                            tracing::debug!(
                                server = %reader_server,
                                line = %line,
                                "discarding non-JSON stdout line"
                            );
                            continue;
                        }
                    };
                    if let Some(id) = frame.response_id() {
                        let sender = reader_pending.lock().await.remove(&id);
                        match sender {
                            Some(tx) => {
                                let reply = match frame.error {
                                    Some(err) => RpcReply::Error(err),
                                    None => RpcReply::Result(frame.result.unwrap_or(Value::Null)),
                                };
                                let _ = tx.send(reply);
                            }
                            None => {
                                tracing::debug!(
                                    server = %reader_server,
                                    id,
                                    "response for unknown or abandoned request"
                                );
                            }
                        }
                    } else if let Some(method) = frame.method {
                        tracing::debug!(
                            server = %reader_server,
                            method = %method,
                            "ignoring server-initiated frame"
                        );
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
        // Fail all waiters, then signal exit.
        reader_pending.lock().await.clear();
        let _ = exit_tx.send(());
    });

    // Stderr task: log and retain a tail for crash diagnostics.
    let stderr_server = config.name.clone();
    let stderr_ring = stderr_tail.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(server = %stderr_server, line = %line, "server stderr");
            stderr_ring.lock().await.push(line);
        }
    });

    let connection = Arc::new(Connection {
        server: config.name.clone(),
        outgoing_tx,
        pending,
        id_counter: AtomicI64::new(1),
        stderr_tail,
    });
    Ok((connection, child, exit_rx))
}

/// Handshake then tool discovery; on failure the child is killed and reaped
/// before the error is returned.
async fn start_session(
    config: &McpServerConfig,
) -> Result<(Arc<Connection>, Child, oneshot::Receiver<()>, Vec<ToolDescriptor>)> {
    let (conn, mut child, exit_rx) = spawn_connection(config)?;

    let setup = async {
        let reply = conn
            .request(
                "initialize",
                Some(initialize_params("restexec-gateway", env!("CARGO_PKG_VERSION"))),
                HANDSHAKE_TIMEOUT,
            )
            .await?;
        match reply {
            RpcReply::Result(_) => {}
            RpcReply::Error(err) => {
                return Err(RestexecError::Internal(format!(
                    "initialize rejected: {}",
                    err.message
                )));
            }
        }
        conn.notify("notifications/initialized").await?;

        let reply = conn.request("tools/list", None, HANDSHAKE_TIMEOUT).await?;
        let result = match reply {
            RpcReply::Result(result) => result,
            RpcReply::Error(err) => {
                return Err(RestexecError::Internal(format!(
                    "tools/list rejected: {}",
                    err.message
                )));
            }
        };
        Ok(parse_tool_list(config, &result))
    };

    match setup.await {
        Ok(tools) => Ok((conn, child, exit_rx, tools)),
        Err(e) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            Err(e)
        }
    }
}

fn parse_tool_list(config: &McpServerConfig, result: &Value) -> Vec<ToolDescriptor> {
    let timeout_ms = config.timeout.map(|t| t.as_millis() as u64);
    result
        .get("tools")
        .and_then(Value::as_array)
        .map(|tools| {
            tools
                .iter()
                .filter_map(|tool| {
                    let name = tool.get("name")?.as_str()?.to_string();
                    Some(ToolDescriptor {
                        server: config.name.clone(),
                        name,
                        description: tool
                            .get("description")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        input_schema: tool
                            .get("inputSchema")
                            .cloned()
                            .unwrap_or_else(|| serde_json::json!({"type": "object"})),
                        timeout: timeout_ms,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Main loop owning the full lifecycle of one server's sessions.
///
/// At most one live child exists per server name at any time: this task is
/// the only spawner for its server and runs strictly sequentially.
async fn run_session(
    config: McpServerConfig,
    interval: Duration,
    policy: RestartPolicy,
    registry: Arc<ToolRegistry>,
    status_tx: watch::Sender<SessionStatus>,
    conn_tx: watch::Sender<Option<Arc<Connection>>>,
    cancel: CancellationToken,
) {
    let name = config.name.clone();
    let mut restarts: u32 = 0;

    loop {
        let _ = status_tx.send(SessionStatus::Starting);
        tracing::info!(server = %name, command = %config.command, "starting MCP session");

        match start_session(&config).await {
            Ok((conn, mut child, mut exit_rx, tools)) => {
                registry.publish(&name, tools).await;
                let _ = conn_tx.send(Some(conn.clone()));
                restarts = 0;
                let _ = status_tx.send(SessionStatus::Available);
                tracing::info!(server = %name, "session available");

                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await; // the immediate first tick

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            match conn.request("ping", None, PING_TIMEOUT).await {
                                Ok(RpcReply::Result(_)) => {
                                    if *status_tx.borrow() != SessionStatus::Available {
                                        tracing::info!(server = %name, "ping recovered, session available again");
                                        let _ = status_tx.send(SessionStatus::Available);
                                    }
                                }
                                _ => {
                                    tracing::warn!(server = %name, "ping failed, marking unavailable");
                                    let _ = status_tx.send(SessionStatus::Unavailable);
                                }
                            }
                        }
                        _ = &mut exit_rx => break,
                        _ = cancel.cancelled() => {
                            tracing::info!(server = %name, "shutdown, terminating session child");
                            let _ = conn_tx.send(None);
                            registry.invalidate(&name).await;
                            let _ = child.start_kill();
                            let _ = child.wait().await;
                            return;
                        }
                    }
                }

                // Child stdout reached EOF: the session is gone.
                let _ = conn_tx.send(None);
                registry.invalidate(&name).await;
                let _ = child.wait().await;
                let _ = status_tx.send(SessionStatus::Crashed);
                let stderr_tail = conn.stderr_lines().await;
                tracing::warn!(
                    server = %name,
                    stderr_tail = ?stderr_tail.last(),
                    "session child exited unexpectedly"
                );
            }
            Err(e) => {
                let _ = status_tx.send(SessionStatus::Crashed);
                tracing::warn!(server = %name, error = %e, "session startup failed");
            }
        }

        match policy {
            RestartPolicy::Never => {
                tracing::info!(server = %name, "restart policy is never, session stays crashed");
                return;
            }
            RestartPolicy::OnFailure => {
                if restarts >= MAX_RESTARTS {
                    tracing::error!(
                        server = %name,
                        attempts = restarts,
                        "restart attempts exhausted, session stays crashed"
                    );
                    return;
                }
                let backoff = RESTART_BACKOFF_BASE * 2u32.pow(restarts);
                restarts += 1;
                tracing::info!(
                    server = %name,
                    attempt = restarts,
                    backoff_secs = backoff.as_secs(),
                    "backing off before restart"
                );
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => return,
                }
            }
        }
    }
}

/// External-facing handle for one managed session.
pub struct SessionHandle {
    pub name: String,
    status_rx: watch::Receiver<SessionStatus>,
    conn_rx: watch::Receiver<Option<Arc<Connection>>>,
}

impl SessionHandle {
    pub fn status(&self) -> SessionStatus {
        *self.status_rx.borrow()
    }

    fn connection(&self) -> Option<Arc<Connection>> {
        self.conn_rx.borrow().clone()
    }
}

/// Owns all session supervision tasks and routes calls by server name.
pub struct SessionManager {
    sessions: HashMap<String, SessionHandle>,
    registry: Arc<ToolRegistry>,
    cancel: CancellationToken,
}

impl SessionManager {
    /// Spawn one supervision task per configured server.
    pub fn start(
        settings: &GatewaySettings,
        registry: Arc<ToolRegistry>,
        cancel: CancellationToken,
    ) -> Self {
        let mut sessions = HashMap::new();
        for config in &settings.servers {
            let (status_tx, status_rx) = watch::channel(SessionStatus::Starting);
            let (conn_tx, conn_rx) = watch::channel(None);
            tokio::spawn(run_session(
                config.clone(),
                settings.health_check_interval,
                settings.restart_policy,
                registry.clone(),
                status_tx,
                conn_tx,
                cancel.child_token(),
            ));
            sessions.insert(
                config.name.clone(),
                SessionHandle {
                    name: config.name.clone(),
                    status_rx,
                    conn_rx,
                },
            );
        }
        Self {
            sessions,
            registry,
            cancel,
        }
    }

    pub fn status(&self, server: &str) -> Option<SessionStatus> {
        self.sessions.get(server).map(SessionHandle::status)
    }

    /// Current status of every managed session.
    pub fn statuses(&self) -> HashMap<String, SessionStatus> {
        self.sessions
            .iter()
            .map(|(name, handle)| (name.clone(), handle.status()))
            .collect()
    }

    /// Call a tool on a managed server.
    pub async fn call(&self, server: &str, tool: &str, input: Value) -> Result<Value> {
        let handle = self
            .sessions
            .get(server)
            .ok_or_else(|| RestexecError::ServerNotFound(server.to_string()))?;

        match handle.status() {
            SessionStatus::Available => {}
            SessionStatus::Crashed => {
                return Err(RestexecError::ServerCrashed(server.to_string()));
            }
            SessionStatus::Starting | SessionStatus::Unavailable => {
                return Err(RestexecError::ServerNotRunning(server.to_string()));
            }
        }
        let conn = handle
            .connection()
            .ok_or_else(|| RestexecError::ServerNotRunning(server.to_string()))?;

        let timeout = self.registry.timeout_for(server, tool).await;
        let params = serde_json::json!({"name": tool, "arguments": input});
        let reply = conn.request("tools/call", Some(params), timeout).await?;

        match reply {
            RpcReply::Error(err) if err.message.to_ascii_lowercase().contains("unknown tool") => {
                Err(RestexecError::ToolNotFound {
                    server: server.to_string(),
                    tool: tool.to_string(),
                })
            }
            RpcReply::Error(err) => Err(RestexecError::ToolExecution {
                server: server.to_string(),
                tool: tool.to_string(),
                message: err.message,
            }),
            RpcReply::Result(result) => {
                if is_error_result(&result) {
                    let message = first_text_content(&result)
                        .unwrap_or_else(|| "tool reported an error".to_string());
                    Err(RestexecError::ToolExecution {
                        server: server.to_string(),
                        tool: tool.to_string(),
                        message,
                    })
                } else {
                    Ok(result)
                }
            }
        }
    }

    /// Cancel all supervision tasks; children are terminated as each task
    /// observes the token.
    pub fn shutdown(&self) {
        tracing::info!("session manager shutting down all sessions");
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    const FAKE_SERVER: &str = r#"#!/bin/sh
while read line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"fake","version":"0.0.0"}}}\n' "$id" ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo","description":"echo input","inputSchema":{"type":"object"}}]}}\n' "$id" ;;
    *'"method":"ping"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id" ;;
    *'"name":"missing"'*)
      printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32602,"message":"Unknown tool: missing"}}\n' "$id" ;;
    *'"name":"fail"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"boom"}],"isError":true}}\n' "$id" ;;
    *'"method":"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"ok"}],"isError":false}}\n' "$id" ;;
  esac
done
"#;

    async fn write_fake_server(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("fake-mcp-server.sh");
        tokio::fs::write(&path, FAKE_SERVER).await.unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                .await
                .unwrap();
        }
        path
    }

    fn settings_for(command: &str, policy: RestartPolicy) -> GatewaySettings {
        GatewaySettings {
            servers: vec![McpServerConfig {
                name: "fake".to_string(),
                command: command.to_string(),
                args: vec![],
                env: HashMap::new(),
                timeout: Some(Duration::from_millis(5_000)),
            }],
            health_check_interval: Duration::from_millis(5_000),
            restart_policy: policy,
        }
    }

    async fn wait_for_status(manager: &SessionManager, server: &str, want: SessionStatus) {
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        loop {
            if manager.status(server) == Some(want) {
                return;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "timed out waiting for {want:?}, currently {:?}",
                manager.status(server)
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn test_session_becomes_available_and_publishes_tools() {
        let tmp = TempDir::new().unwrap();
        let script = write_fake_server(&tmp).await;
        let registry = Arc::new(ToolRegistry::new());
        let manager = SessionManager::start(
            &settings_for(&script.to_string_lossy(), RestartPolicy::Never),
            registry.clone(),
            CancellationToken::new(),
        );

        wait_for_status(&manager, "fake", SessionStatus::Available).await;

        let tools = registry.all().await;
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");
        assert_eq!(tools[0].server, "fake");
        assert_eq!(tools[0].timeout, Some(5_000));

        manager.shutdown();
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let tmp = TempDir::new().unwrap();
        let script = write_fake_server(&tmp).await;
        let registry = Arc::new(ToolRegistry::new());
        let manager = SessionManager::start(
            &settings_for(&script.to_string_lossy(), RestartPolicy::Never),
            registry,
            CancellationToken::new(),
        );
        wait_for_status(&manager, "fake", SessionStatus::Available).await;

        let result = manager
            .call("fake", "echo", serde_json::json!({"text": "hi"}))
            .await
            .unwrap();
        assert_eq!(result["content"][0]["text"], "ok");
        assert_eq!(result["isError"], false);

        manager.shutdown();
    }

    #[tokio::test]
    async fn test_unknown_server_is_not_found() {
        let registry = Arc::new(ToolRegistry::new());
        let settings = GatewaySettings {
            servers: vec![],
            health_check_interval: Duration::from_millis(5_000),
            restart_policy: RestartPolicy::Never,
        };
        let manager = SessionManager::start(&settings, registry, CancellationToken::new());
        let result = manager.call("x", "y", serde_json::json!({})).await;
        assert!(matches!(result, Err(RestexecError::ServerNotFound(n)) if n == "x"));
    }

    #[tokio::test]
    async fn test_unknown_tool_maps_to_tool_not_found() {
        let tmp = TempDir::new().unwrap();
        let script = write_fake_server(&tmp).await;
        let manager = SessionManager::start(
            &settings_for(&script.to_string_lossy(), RestartPolicy::Never),
            Arc::new(ToolRegistry::new()),
            CancellationToken::new(),
        );
        wait_for_status(&manager, "fake", SessionStatus::Available).await;

        let result = manager.call("fake", "missing", serde_json::json!({})).await;
        assert!(matches!(
            result,
            Err(RestexecError::ToolNotFound { ref server, ref tool }) if server == "fake" && tool == "missing"
        ));
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_error_content_maps_to_tool_execution() {
        let tmp = TempDir::new().unwrap();
        let script = write_fake_server(&tmp).await;
        let manager = SessionManager::start(
            &settings_for(&script.to_string_lossy(), RestartPolicy::Never),
            Arc::new(ToolRegistry::new()),
            CancellationToken::new(),
        );
        wait_for_status(&manager, "fake", SessionStatus::Available).await;

        let result = manager.call("fake", "fail", serde_json::json!({})).await;
        match result {
            Err(RestexecError::ToolExecution { message, .. }) => assert_eq!(message, "boom"),
            other => panic!("expected ToolExecution, got {other:?}"),
        }
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_immediately_exiting_command_crashes_terminally() {
        let manager = SessionManager::start(
            &settings_for("/bin/false", RestartPolicy::Never),
            Arc::new(ToolRegistry::new()),
            CancellationToken::new(),
        );
        wait_for_status(&manager, "fake", SessionStatus::Crashed).await;

        let result = manager.call("fake", "echo", serde_json::json!({})).await;
        assert!(matches!(result, Err(RestexecError::ServerCrashed(_))));
    }

    #[tokio::test]
    async fn test_nonexistent_command_crashes() {
        let manager = SessionManager::start(
            &settings_for("/no/such/mcp-server-binary", RestartPolicy::Never),
            Arc::new(ToolRegistry::new()),
            CancellationToken::new(),
        );
        wait_for_status(&manager, "fake", SessionStatus::Crashed).await;
    }

    #[tokio::test]
    async fn test_crash_invalidates_registry() {
        let tmp = TempDir::new().unwrap();
        // A server that completes the handshake and then exits after the
        // tools/list response.
        let script = tmp.path().join("short-lived.sh");
        let body = r#"#!/bin/sh
read line
printf '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"s","version":"0"}}}\n'
read line
read line
printf '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"t","inputSchema":{}}]}}\n'
exit 0
"#;
        tokio::fs::write(&script, body).await.unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
                .await
                .unwrap();
        }

        let registry = Arc::new(ToolRegistry::new());
        let manager = SessionManager::start(
            &settings_for(&script.to_string_lossy(), RestartPolicy::Never),
            registry.clone(),
            CancellationToken::new(),
        );
        wait_for_status(&manager, "fake", SessionStatus::Crashed).await;
        assert!(registry.all().await.is_empty(), "cache must be invalidated");
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(SessionStatus::Available.as_str(), "available");
        assert_eq!(SessionStatus::Unavailable.as_str(), "unavailable");
        assert_eq!(SessionStatus::Crashed.as_str(), "crashed");
        assert_eq!(SessionStatus::Starting.as_str(), "starting");
    }

    #[test]
    fn test_stderr_ring_caps() {
        let mut ring = StderrRing::new(2);
        ring.push("a".to_string());
        ring.push("b".to_string());
        ring.push("c".to_string());
        assert_eq!(ring.tail(), vec!["b".to_string(), "c".to_string()]);
    }
}
