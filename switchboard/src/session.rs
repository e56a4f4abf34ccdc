//! SSE session model: per-client sessions, the event stream, and fan-out.
//!
//! A session is created when a client opens `GET /sse` and lives until the
//! stream closes or the session idles out. The stream opens with a single
//! `endpoint` event naming the companion request endpoint, then carries
//! `message` events (correlated responses and broadcast backend
//! notifications) and a keep-alive comment every 30 seconds.
//!
//! Writes to one session are serialized by its channel; different sessions
//! write in parallel. Backend notifications are fanned out through a
//! broadcast channel, so a slow session drops messages instead of blocking
//! the backend reader.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{Stream, StreamExt};
use rand::RngCore;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};
use tokio_util::sync::CancellationToken;

use crate::auth::AuthIdentity;

/// Keep-alive comment interval.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Buffered events per session before sends start failing.
const SESSION_CHANNEL_CAPACITY: usize = 64;

/// One client-bound session tied to an open SSE stream.
pub struct Session {
    /// Cryptographically random session id.
    pub id: String,
    /// Token identity that opened the stream.
    pub identity: String,
    created_at: Instant,
    last_activity: Mutex<Instant>,
    tx: mpsc::Sender<Value>,
}

impl Session {
    /// Record activity, deferring idle cleanup.
    pub fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    /// Session age, for admin output.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Queue a `message` event for this session's stream. Returns false if
    /// the stream is gone or the queue is full.
    pub fn send(&self, message: Value) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => {
                self.touch();
                true
            }
            Err(e) => {
                tracing::debug!(session_id = %self.id, error = %e, "session send failed");
                false
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Owns every live session. Single mutex for insert/remove; the per-session
/// channel is the only writer to a session's stream.
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    idle_timeout: Duration,
}

impl SessionManager {
    pub fn new(idle_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            idle_timeout,
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a session for an authenticated client.
    pub fn create(&self, identity: &AuthIdentity) -> (Arc<Session>, mpsc::Receiver<Value>) {
        let (tx, rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
        let session = Arc::new(Session {
            id: session_id(),
            identity: identity.client_id.clone(),
            created_at: Instant::now(),
            last_activity: Mutex::new(Instant::now()),
            tx,
        });
        self.lock().insert(session.id.clone(), session.clone());
        tracing::info!(
            session_id = %session.id,
            identity = %session.identity,
            "session created"
        );
        (session, rx)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.lock().get(id).cloned()
    }

    pub fn remove(&self, id: &str) {
        if self.lock().remove(id).is_some() {
            tracing::info!(session_id = %id, "session removed");
        }
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    /// Drop sessions that are closed or idle past the timeout.
    pub fn sweep_idle(&self) -> usize {
        let timeout = self.idle_timeout;
        let mut guard = self.lock();
        let before = guard.len();
        guard.retain(|_, s| !s.is_closed() && s.idle_for() <= timeout);
        let removed = before - guard.len();
        if removed > 0 {
            tracing::info!(removed, remaining = guard.len(), "idle sessions swept");
        }
        removed
    }

    /// Spawn the idle sweeper; stops when the token is cancelled.
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) {
        let manager = Arc::clone(self);
        let period = (self.idle_timeout / 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        manager.sweep_idle();
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        });
    }

    /// Build the SSE response for a freshly created session.
    ///
    /// The stream is: one `endpoint` event, then the merge of the session's
    /// own queue and the gateway-wide notification broadcast, with keep-alive
    /// comments injected by axum. Dropping the stream removes the session.
    pub fn sse_stream(
        self: &Arc<Self>,
        session: Arc<Session>,
        rx: mpsc::Receiver<Value>,
        notifications: broadcast::Receiver<Value>,
    ) -> Sse<impl Stream<Item = Result<Event, Infallible>> + use<>> {
        let session_id = session.id.clone();
        let endpoint = futures::stream::once(async move {
            Ok::<_, Infallible>(
                Event::default()
                    .event("endpoint")
                    .data(format!("/message?session_id={session_id}")),
            )
        });

        let responses = ReceiverStream::new(rx).map(|v| {
            Ok::<_, Infallible>(Event::default().event("message").data(v.to_string()))
        });

        let session_id = session.id.clone();
        let broadcasts = BroadcastStream::new(notifications).filter_map(move |result| {
            let session_id = session_id.clone();
            async move {
                match result {
                    Ok(v) => Some(Ok(Event::default().event("message").data(v.to_string()))),
                    Err(lagged) => {
                        tracing::warn!(
                            session_id = %session_id,
                            error = %lagged,
                            "session lagged behind notification broadcast"
                        );
                        None
                    }
                }
            }
        });

        // The guard removes the session when the client disconnects and the
        // stream is dropped.
        let guard = SessionGuard {
            manager: Arc::clone(self),
            id: session.id.clone(),
        };
        let stream = endpoint
            .chain(futures::stream::select(responses, broadcasts))
            .map(move |event| {
                let _ = &guard;
                event
            });

        Sse::new(stream).keep_alive(
            KeepAlive::new()
                .interval(KEEP_ALIVE_INTERVAL)
                .text("ping"),
        )
    }
}

/// Removes its session from the manager when dropped.
struct SessionGuard {
    manager: Arc<SessionManager>,
    id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.manager.remove(&self.id);
    }
}

/// 16 bytes of CSPRNG output, hex encoded.
fn session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut out = String::with_capacity(32);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}
