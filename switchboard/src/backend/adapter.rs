//! Backend adapter: owns one child process and its stdio framing.
//!
//! The adapter exposes an async `call` with per-request correlation and a
//! notification sink for server-initiated messages. One reader task per
//! child consumes stdout line-by-line; writes to stdin are serialized
//! through a single async mutex so concurrent calls never interleave lines.
//!
//! Invariants:
//! - at most one child process per adapter at any instant (the supervisor
//!   owns the `Child` handle and tears it down before respawning);
//! - every pending-table entry resolves with exactly one of response,
//!   timeout, cancellation, or restart-drain;
//! - the outbound id counter resets when a new child is spawned, and the
//!   pending table is drained with a restart error first.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU8, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use serde_json::{Map, Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{broadcast, oneshot};

use switchboard_core::GatewayError;
use switchboard_core::config::BackendConfig;
use switchboard_core::jsonrpc::{JSONRPC_VERSION, JsonRpcId};
use switchboard_core::protocol;

use super::framing::{self, BackendMessage, BackendReply};
use crate::catalog::BackendCatalog;

/// Backend lifecycle states. Transitions are single-threaded per backend:
/// only the supervisor task moves an adapter between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BackendState {
    Idle = 0,
    Starting = 1,
    Ready = 2,
    Degraded = 3,
    Stopping = 4,
    Terminated = 5,
}

impl BackendState {
    /// Label for logs and admin output.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendState::Idle => "idle",
            BackendState::Starting => "starting",
            BackendState::Ready => "ready",
            BackendState::Degraded => "degraded",
            BackendState::Stopping => "stopping",
            BackendState::Terminated => "terminated",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => BackendState::Starting,
            2 => BackendState::Ready,
            3 => BackendState::Degraded,
            4 => BackendState::Stopping,
            5 => BackendState::Terminated,
            _ => BackendState::Idle,
        }
    }
}

/// Waiter for an in-flight outbound request.
struct PendingCall {
    tx: oneshot::Sender<Result<BackendReply, GatewayError>>,
    method: String,
    sent_at: Instant,
}

/// Child process handles the supervisor holds between spawn and teardown.
pub(crate) struct ChildHandles {
    pub child: Child,
    pub stdout: ChildStdout,
}

/// One adapter per configured backend.
pub struct Adapter {
    config: BackendConfig,
    state: AtomicU8,
    pending: std::sync::Mutex<HashMap<i64, PendingCall>>,
    stdin: tokio::sync::Mutex<Option<tokio::process::ChildStdin>>,
    next_id: AtomicI64,
    catalog: std::sync::RwLock<BackendCatalog>,
    consecutive_failures: AtomicU32,
    last_start: std::sync::Mutex<Option<Instant>>,
    notify_tx: broadcast::Sender<Value>,
}

impl Adapter {
    pub fn new(config: BackendConfig, notify_tx: broadcast::Sender<Value>) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: AtomicU8::new(BackendState::Idle as u8),
            pending: std::sync::Mutex::new(HashMap::new()),
            stdin: tokio::sync::Mutex::new(None),
            next_id: AtomicI64::new(1),
            catalog: std::sync::RwLock::new(BackendCatalog::default()),
            consecutive_failures: AtomicU32::new(0),
            last_start: std::sync::Mutex::new(None),
            notify_tx,
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn state(&self) -> BackendState {
        BackendState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: BackendState) {
        let prev = BackendState::from_u8(self.state.swap(state as u8, Ordering::AcqRel));
        if prev != state {
            tracing::info!(
                backend_id = %self.config.id,
                from = prev.as_str(),
                to = state.as_str(),
                "backend state transition"
            );
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub(crate) fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn reset_failures(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    /// Seconds since the current child was started, if any.
    pub fn last_start_elapsed(&self) -> Option<Duration> {
        self.last_start_lock().map(|i| i.elapsed())
    }

    /// Snapshot of this backend's catalogs.
    pub fn catalog(&self) -> BackendCatalog {
        self.catalog
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn pending_lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, PendingCall>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn last_start_lock(&self) -> Option<Instant> {
        *self.last_start.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn unavailable(&self, detail: &str) -> GatewayError {
        GatewayError::BackendUnavailable {
            backend_id: self.config.id.clone(),
            detail: detail.to_string(),
        }
    }

    fn protocol_error(&self, detail: &str) -> GatewayError {
        GatewayError::BackendProtocol {
            backend_id: self.config.id.clone(),
            detail: detail.to_string(),
        }
    }

    // ── Calls ────────────────────────────────────────────────────────────

    /// Issue a request to the backend and await its response.
    ///
    /// The deadline covers both the stdin write (which blocks if the child
    /// stalls reading) and the wait for the response. On expiry the waiter
    /// is removed, so a late response is discarded by the reader.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
    ) -> Result<BackendReply, GatewayError> {
        if self.state() != BackendState::Ready {
            return Err(self.unavailable(&format!("backend is {}", self.state().as_str())));
        }
        self.call_unchecked(method, params, deadline).await
    }

    /// Like [`Adapter::call`] without the readiness check. Used during the
    /// connect handshake while the adapter is still `Starting`.
    pub(crate) async fn call_unchecked(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
    ) -> Result<BackendReply, GatewayError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending_lock().insert(
            id,
            PendingCall {
                tx,
                method: method.to_string(),
                sent_at: Instant::now(),
            },
        );

        let line = encode_line(Some(id), method, params);

        let outcome = tokio::time::timeout(deadline, async {
            {
                let mut guard = self.stdin.lock().await;
                let Some(stdin) = guard.as_mut() else {
                    return Err(self.unavailable("no child process"));
                };
                if let Err(e) = write_line(stdin, &line).await {
                    return Err(self.unavailable(&format!("stdin write failed: {e}")));
                }
            }
            match rx.await {
                Ok(result) => result,
                // Waiter dropped without completion: the table was cleared
                // out-of-band (adapter torn down).
                Err(_) => Err(self.unavailable("backend stopped")),
            }
        })
        .await;

        match outcome {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => {
                // Write failure or teardown: the entry must not outlive the
                // call that created it.
                self.pending_lock().remove(&id);
                Err(e)
            }
            Err(_) => {
                // Abandon the id; any later response is discarded.
                self.pending_lock().remove(&id);
                Err(GatewayError::RequestTimeout {
                    backend_id: self.config.id.clone(),
                    timeout_secs: deadline.as_secs(),
                })
            }
        }
    }

    /// Send a notification (no id, no response) to the backend.
    pub async fn notify(&self, method: &str, params: Option<Value>) {
        let line = encode_line(None, method, params);
        let mut guard = self.stdin.lock().await;
        if let Some(stdin) = guard.as_mut() {
            if let Err(e) = write_line(stdin, &line).await {
                tracing::warn!(
                    backend_id = %self.config.id,
                    method,
                    error = %e,
                    "failed to write notification"
                );
            }
        }
    }

    /// Complete every pending waiter with the given error and clear the table.
    pub(crate) fn drain_pending(&self, error: &GatewayError) {
        let drained: Vec<(i64, PendingCall)> = self.pending_lock().drain().collect();
        if drained.is_empty() {
            return;
        }
        tracing::warn!(
            backend_id = %self.config.id,
            count = drained.len(),
            error = %error,
            "draining pending requests"
        );
        for (_, call) in drained {
            let _ = call.tx.send(Err(error.clone()));
        }
    }

    // ── Child lifecycle ──────────────────────────────────────────────────

    /// Spawn a fresh child process. Resets the id counter, captures stdin,
    /// and starts a stderr drain task; the caller receives the child handle
    /// and its stdout for the reader task.
    pub(crate) async fn spawn_child(&self) -> Result<ChildHandles, GatewayError> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| self.unavailable(&format!("spawn failed: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| self.unavailable("failed to capture child stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.unavailable("failed to capture child stdout"))?;

        if let Some(stderr) = child.stderr.take() {
            let backend_id = self.config.id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        tracing::info!(backend_id = %backend_id, "stderr: {line}");
                    }
                }
            });
        }

        self.next_id.store(1, Ordering::Relaxed);
        *self.stdin.lock().await = Some(stdin);
        *self.last_start.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());

        tracing::info!(
            backend_id = %self.config.id,
            command = %self.config.command,
            "child process spawned"
        );

        Ok(ChildHandles { child, stdout })
    }

    /// Drop the stdin writer, closing the child's stdin pipe.
    pub(crate) async fn close_stdin(&self) {
        *self.stdin.lock().await = None;
    }

    /// Read the child's stdout line-by-line until EOF or a framing error.
    ///
    /// Responses complete their pending waiter; server-initiated messages
    /// are enqueued on the notification channel without blocking. Returns
    /// `Ok(())` on EOF and a protocol error on any framing violation, which
    /// the supervisor answers with a restart.
    ///
    /// Generic over the reader so tests can drive it from a buffer.
    pub(crate) async fn read_loop<R: tokio::io::AsyncRead + Unpin>(
        &self,
        stdout: R,
    ) -> Result<(), GatewayError> {
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            let n = framing::bounded_read_line(&mut reader, &mut buf, framing::MAX_LINE_BYTES)
                .await
                .map_err(|e| self.protocol_error(&e.to_string()))?;
            if n == 0 {
                tracing::debug!(backend_id = %self.config.id, "child stdout EOF");
                return Ok(());
            }

            let line = std::str::from_utf8(&buf)
                .map_err(|_| self.protocol_error("invalid UTF-8 on stdout"))?;
            if line.trim().is_empty() {
                continue;
            }

            match framing::parse_backend_line(line) {
                Ok(BackendMessage::Reply { id, reply }) => self.complete(id, reply),
                Ok(BackendMessage::ServerInitiated { method, raw }) => {
                    tracing::debug!(
                        backend_id = %self.config.id,
                        method = %method,
                        "server-initiated message"
                    );
                    // Enqueue and return; fan-out must not block this reader.
                    let _ = self.notify_tx.send(raw);
                }
                Err(e) => return Err(self.protocol_error(&e.to_string())),
            }
        }
    }

    fn complete(&self, id: JsonRpcId, reply: BackendReply) {
        let JsonRpcId::Number(n) = id else {
            tracing::warn!(
                backend_id = %self.config.id,
                id = %id,
                "discarding response with non-numeric id"
            );
            return;
        };
        match self.pending_lock().remove(&n) {
            Some(call) => {
                tracing::debug!(
                    backend_id = %self.config.id,
                    method = %call.method,
                    id = n,
                    latency_us = call.sent_at.elapsed().as_micros() as u64,
                    "response matched"
                );
                let _ = call.tx.send(Ok(reply));
            }
            None => {
                tracing::warn!(
                    backend_id = %self.config.id,
                    id = n,
                    "discarding unmatched response"
                );
            }
        }
    }

    // ── Connect handshake ────────────────────────────────────────────────

    /// Run the MCP handshake against a freshly spawned child: `initialize`,
    /// the `initialized` notification, then the catalog list calls in
    /// parallel. On success the adapter's catalog is replaced.
    ///
    /// The supervisor wraps this in the descriptor's connect timeout.
    pub(crate) async fn connect(&self) -> Result<(), GatewayError> {
        let deadline = self.config.request_timeout();

        let init_params = json!({
            "protocolVersion": protocol::PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": protocol::SERVER_NAME,
                "version": protocol::SERVER_VERSION,
            },
        });

        let capabilities = match self
            .call_unchecked(protocol::METHOD_INITIALIZE, Some(init_params), deadline)
            .await?
        {
            BackendReply::Result(result) => {
                let version = result
                    .get("protocolVersion")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown");
                tracing::debug!(
                    backend_id = %self.config.id,
                    protocol_version = version,
                    "backend initialized"
                );
                result.get("capabilities").cloned().unwrap_or(json!({}))
            }
            BackendReply::Error(error) => {
                let message = error
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown error");
                return Err(self.unavailable(&format!("initialize failed: {message}")));
            }
        };

        self.notify("notifications/initialized", None).await;

        let (tools, resources, templates, prompts) = tokio::join!(
            self.list_call(protocol::METHOD_TOOLS_LIST, "tools", deadline),
            self.list_call(protocol::METHOD_RESOURCES_LIST, "resources", deadline),
            self.list_call(
                protocol::METHOD_RESOURCE_TEMPLATES_LIST,
                "resourceTemplates",
                deadline
            ),
            self.list_call(protocol::METHOD_PROMPTS_LIST, "prompts", deadline),
        );

        *self.catalog.write().unwrap_or_else(|e| e.into_inner()) = BackendCatalog {
            capabilities,
            tools: tools?,
            resources: resources?,
            resource_templates: templates?,
            prompts: prompts?,
        };

        Ok(())
    }

    /// Issue a `*/list` call, treating a JSON-RPC error (capability not
    /// supported) as an empty catalog. Transport failures still propagate.
    async fn list_call(
        &self,
        method: &str,
        key: &str,
        deadline: Duration,
    ) -> Result<Vec<Value>, GatewayError> {
        match self.call_unchecked(method, None, deadline).await {
            Ok(BackendReply::Result(result)) => Ok(result
                .get(key)
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default()),
            Ok(BackendReply::Error(_)) => {
                tracing::debug!(
                    backend_id = %self.config.id,
                    method,
                    "backend does not support catalog method"
                );
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Health probe: `ping` with a short deadline.
    pub(crate) async fn ping(&self, deadline: Duration) -> Result<(), GatewayError> {
        self.call_unchecked(protocol::METHOD_PING, None, deadline)
            .await
            .map(|_| ())
    }
}

/// Encode one NDJSON request/notification line.
fn encode_line(id: Option<i64>, method: &str, params: Option<Value>) -> String {
    let mut obj = Map::new();
    obj.insert("jsonrpc".into(), Value::String(JSONRPC_VERSION.into()));
    if let Some(id) = id {
        obj.insert("id".into(), Value::from(id));
    }
    obj.insert("method".into(), Value::String(method.into()));
    if let Some(params) = params {
        obj.insert("params".into(), params);
    }
    let mut line = Value::Object(obj).to_string();
    line.push('\n');
    line
}

async fn write_line(
    stdin: &mut tokio::process::ChildStdin,
    line: &str,
) -> Result<(), std::io::Error> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await
}
