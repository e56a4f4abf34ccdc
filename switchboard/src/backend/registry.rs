//! Backend registry: supervises adapters and publishes catalog snapshots.
//!
//! One supervisor task per enabled backend runs the spawn → connect → ready
//! loop, restarting on unclean termination with capped, jittered exponential
//! backoff. After `max_restarts` consecutive failures the backend is left
//! degraded until an admin requests a manual restart. Whenever an adapter
//! becomes ready or drops out, the aggregate catalog is rebuilt and swapped
//! atomically for the router.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use switchboard_core::GatewayError;
use switchboard_core::config::BackendConfig;

use super::adapter::{Adapter, BackendState, ChildHandles};
use super::framing::BackendReply;
use super::shutdown::{ShutdownGrace, shutdown_child};
use crate::catalog::CatalogSnapshot;
use crate::gateway::BackendRouter;

/// First restart backoff step.
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Backoff ceiling.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Maximum random jitter added to each backoff.
const BACKOFF_JITTER_MS: u64 = 250;

/// Deadline for health-check pings.
const PING_DEADLINE: Duration = Duration::from_secs(5);

/// Missed pings before a ready backend is demoted and restarted.
const MAX_MISSED_PINGS: u32 = 3;

/// Capacity of the server-initiated notification fan-in channel.
const NOTIFY_CHANNEL_CAPACITY: usize = 256;

/// Why one run of a backend child ended.
enum RunEnd {
    /// Child exited, stdout closed, connect failed, or pings went dark.
    Failed,
    /// Admin asked for a restart; skip backoff and failure accounting.
    Restart,
    /// The gateway is shutting down.
    Shutdown,
}

/// Per-backend status row for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub id: String,
    pub state: &'static str,
    pub enabled: bool,
    pub consecutive_failures: u32,
    pub tools: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,
}

/// Supervises the set of backend adapters.
pub struct Registry {
    adapters: Vec<Arc<Adapter>>,
    by_id: HashMap<String, Arc<Adapter>>,
    disabled: Vec<BackendConfig>,
    snapshot: std::sync::RwLock<Arc<CatalogSnapshot>>,
    notify_tx: broadcast::Sender<Value>,
    restarts: HashMap<String, Arc<Notify>>,
    shutdown: CancellationToken,
    grace: ShutdownGrace,
}

impl Registry {
    /// Build the registry from backend descriptors. Disabled descriptors are
    /// recorded but never started.
    pub fn new(backends: Vec<BackendConfig>, shutdown: CancellationToken) -> Arc<Self> {
        let (notify_tx, _) = broadcast::channel(NOTIFY_CHANNEL_CAPACITY);

        let mut adapters = Vec::new();
        let mut by_id = HashMap::new();
        let mut disabled = Vec::new();
        let mut restarts = HashMap::new();

        for config in backends {
            if !config.enabled {
                tracing::info!(backend_id = %config.id, "backend disabled, not starting");
                disabled.push(config);
                continue;
            }
            let adapter = Adapter::new(config, notify_tx.clone());
            restarts.insert(adapter.id().to_string(), Arc::new(Notify::new()));
            by_id.insert(adapter.id().to_string(), adapter.clone());
            adapters.push(adapter);
        }

        Arc::new(Self {
            adapters,
            by_id,
            disabled,
            snapshot: std::sync::RwLock::new(Arc::new(CatalogSnapshot::default())),
            notify_tx,
            restarts,
            shutdown,
            grace: ShutdownGrace::default(),
        })
    }

    /// Spawn one supervisor task per enabled backend.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        self.adapters
            .iter()
            .map(|adapter| {
                let registry = self.clone();
                let adapter = adapter.clone();
                // Restart notifiers are created alongside adapters in new().
                let restart = registry.restarts[adapter.id()].clone();
                tokio::spawn(async move { registry.supervise(adapter, restart).await })
            })
            .collect()
    }

    /// Subscribe to server-initiated backend messages for session fan-out.
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Value> {
        self.notify_tx.subscribe()
    }

    /// Current catalog snapshot (copy-on-write; no lock held by readers).
    pub fn current_snapshot(&self) -> Arc<CatalogSnapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Rebuild the aggregate catalog from ready adapters and swap it in.
    fn publish(&self) {
        let parts = self
            .adapters
            .iter()
            .filter(|a| a.state() == BackendState::Ready)
            .map(|a| (a.id(), a.catalog()));
        let snapshot = Arc::new(CatalogSnapshot::build(parts));
        tracing::debug!(
            tools = snapshot.tool_count(),
            shadowed = snapshot.shadowed().len(),
            "catalog snapshot published"
        );
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = snapshot;
    }

    /// Request a manual restart of a backend. Also revives a backend whose
    /// restart budget is exhausted.
    pub fn restart(&self, backend_id: &str) -> Result<(), GatewayError> {
        match self.restarts.get(backend_id) {
            Some(notify) => {
                tracing::info!(backend_id, "manual restart requested");
                notify.notify_one();
                Ok(())
            }
            None => Err(GatewayError::InvalidParams {
                details: format!("unknown backend '{backend_id}'"),
            }),
        }
    }

    /// Overall health: healthy only when every enabled backend is ready.
    pub fn healthy(&self) -> bool {
        self.adapters
            .iter()
            .all(|a| a.state() == BackendState::Ready)
    }

    /// Per-backend status rows, enabled and disabled alike.
    pub fn statuses(&self) -> Vec<BackendStatus> {
        let snapshot = self.current_snapshot();
        let mut rows: Vec<BackendStatus> = self
            .adapters
            .iter()
            .map(|a| BackendStatus {
                id: a.id().to_string(),
                state: a.state().as_str(),
                enabled: true,
                consecutive_failures: a.consecutive_failures(),
                tools: snapshot.tool_count_for(a.id()),
                uptime_secs: a.last_start_elapsed().map(|d| d.as_secs()),
            })
            .collect();
        rows.extend(self.disabled.iter().map(|c| BackendStatus {
            id: c.id.clone(),
            state: "idle",
            enabled: false,
            consecutive_failures: 0,
            tools: 0,
            uptime_secs: None,
        }));
        rows
    }

    // ── Supervision ──────────────────────────────────────────────────────

    async fn supervise(self: Arc<Self>, adapter: Arc<Adapter>, restart: Arc<Notify>) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            adapter.set_state(BackendState::Starting);

            match self.run_once(&adapter, &restart).await {
                RunEnd::Shutdown => {
                    adapter.set_state(BackendState::Stopping);
                    break;
                }
                RunEnd::Restart => {
                    adapter.reset_failures();
                    continue;
                }
                RunEnd::Failed => {
                    adapter.set_state(BackendState::Degraded);
                    self.publish();

                    let failures = adapter.record_failure();
                    if failures > adapter.config().max_restarts {
                        tracing::error!(
                            backend_id = %adapter.id(),
                            failures,
                            max_restarts = adapter.config().max_restarts,
                            "restart budget exhausted, backend left degraded"
                        );
                        tokio::select! {
                            _ = self.shutdown.cancelled() => break,
                            _ = restart.notified() => {
                                adapter.reset_failures();
                                continue;
                            }
                        }
                    }

                    let backoff = backoff_delay(failures);
                    tracing::warn!(
                        backend_id = %adapter.id(),
                        failures,
                        backoff_ms = backoff.as_millis() as u64,
                        "backend failed, restarting after backoff"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = restart.notified() => adapter.reset_failures(),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
        adapter.set_state(BackendState::Terminated);
    }

    /// One child lifetime: spawn, connect, serve until something ends it,
    /// then tear down. Always leaves the pending table drained and the child
    /// reaped.
    async fn run_once(&self, adapter: &Arc<Adapter>, restart: &Notify) -> RunEnd {
        let ChildHandles { mut child, stdout } = match adapter.spawn_child().await {
            Ok(handles) => handles,
            Err(e) => {
                tracing::warn!(backend_id = %adapter.id(), error = %e, "spawn failed");
                return RunEnd::Failed;
            }
        };

        let mut reader = {
            let adapter = adapter.clone();
            tokio::spawn(async move { adapter.read_loop(stdout).await })
        };

        // Connect handshake, bounded by the descriptor's connect timeout.
        let connect_timeout = adapter.config().connect_timeout();
        let connected = tokio::select! {
            result = tokio::time::timeout(connect_timeout, adapter.connect()) => match result {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    tracing::warn!(backend_id = %adapter.id(), error = %e, "connect failed");
                    false
                }
                Err(_) => {
                    tracing::warn!(
                        backend_id = %adapter.id(),
                        timeout_secs = connect_timeout.as_secs(),
                        "connect timed out"
                    );
                    false
                }
            },
            _ = self.shutdown.cancelled() => {
                self.teardown(adapter, &mut child, &mut reader, &GatewayError::ShuttingDown)
                    .await;
                return RunEnd::Shutdown;
            }
        };

        if !connected {
            let error = GatewayError::BackendUnavailable {
                backend_id: adapter.id().to_string(),
                detail: "initialize failed".to_string(),
            };
            self.teardown(adapter, &mut child, &mut reader, &error).await;
            return RunEnd::Failed;
        }

        adapter.reset_failures();
        adapter.set_state(BackendState::Ready);
        self.publish();
        tracing::info!(
            backend_id = %adapter.id(),
            tools = adapter.catalog().tools.len(),
            "backend ready"
        );

        let mut ping_interval = adapter.config().ping_interval().map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval
        });
        let mut missed_pings = 0u32;

        let end = loop {
            tokio::select! {
                result = &mut reader => {
                    match result {
                        Ok(Ok(())) => {
                            tracing::warn!(backend_id = %adapter.id(), "backend closed stdout");
                        }
                        Ok(Err(e)) => {
                            tracing::warn!(backend_id = %adapter.id(), error = %e, "backend protocol error");
                        }
                        Err(e) => {
                            tracing::error!(backend_id = %adapter.id(), error = %e, "reader task failed");
                        }
                    }
                    break RunEnd::Failed;
                }
                status = child.wait() => {
                    tracing::warn!(backend_id = %adapter.id(), ?status, "child exited");
                    break RunEnd::Failed;
                }
                _ = self.shutdown.cancelled() => break RunEnd::Shutdown,
                _ = restart.notified() => break RunEnd::Restart,
                _ = maybe_tick(&mut ping_interval) => {
                    match adapter.ping(PING_DEADLINE).await {
                        Ok(()) => missed_pings = 0,
                        Err(e) => {
                            missed_pings += 1;
                            tracing::warn!(
                                backend_id = %adapter.id(),
                                missed_pings,
                                error = %e,
                                "health ping missed"
                            );
                            if missed_pings >= MAX_MISSED_PINGS {
                                break RunEnd::Failed;
                            }
                        }
                    }
                }
            }
        };

        let drain_error = match end {
            RunEnd::Shutdown => GatewayError::ShuttingDown,
            _ => GatewayError::BackendUnavailable {
                backend_id: adapter.id().to_string(),
                detail: "backend restarted".to_string(),
            },
        };
        self.teardown(adapter, &mut child, &mut reader, &drain_error).await;
        end
    }

    async fn teardown(
        &self,
        adapter: &Arc<Adapter>,
        child: &mut tokio::process::Child,
        reader: &mut JoinHandle<Result<(), GatewayError>>,
        drain_error: &GatewayError,
    ) {
        adapter.close_stdin().await;
        adapter.drain_pending(drain_error);
        reader.abort();
        shutdown_child(adapter.id(), child, &self.grace).await;
    }
}

#[async_trait]
impl BackendRouter for Registry {
    fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.current_snapshot()
    }

    async fn forward(
        &self,
        backend_id: &str,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
    ) -> Result<BackendReply, GatewayError> {
        let adapter = self
            .by_id
            .get(backend_id)
            .ok_or_else(|| GatewayError::BackendUnavailable {
                backend_id: backend_id.to_string(),
                detail: "unknown backend".to_string(),
            })?;
        // Effective deadline is the minimum of the gateway's and the
        // backend's own per-call timeout.
        let effective = deadline.min(adapter.config().request_timeout());
        adapter.call(method, params, effective).await
    }

    async fn forward_notification(&self, backend_id: &str, method: &str, params: Option<Value>) {
        if let Some(adapter) = self.by_id.get(backend_id) {
            adapter.notify(method, params).await;
        }
    }
}

/// Exponential backoff, capped and jittered.
fn backoff_delay(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    let base = INITIAL_BACKOFF.saturating_mul(1u32 << exp).min(MAX_BACKOFF);
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=BACKOFF_JITTER_MS));
    base + jitter
}

/// Await the next ping tick, or forever when health checks are disabled.
async fn maybe_tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
