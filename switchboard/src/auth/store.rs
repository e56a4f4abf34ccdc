//! Access and refresh token stores with TTL expiry.
//!
//! Both stores are mutex-guarded maps; token operations are brief critical
//! sections, so contention is negligible. A background sweeper drops expired
//! entries every 60 seconds; validation also checks expiry, so the sweep is
//! purely for memory hygiene.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::RngCore;
use tokio_util::sync::CancellationToken;

/// Interval between expired-entry sweeps.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// An issued access token.
#[derive(Debug, Clone)]
pub struct AccessToken {
    /// The opaque bearer string (32 random bytes, hex encoded).
    pub token: String,
    /// Owning client.
    pub client_id: String,
    /// Granted scopes.
    pub scopes: Vec<String>,
    /// Subject for password-grant tokens.
    pub subject: Option<String>,
    /// Absolute expiry.
    pub expires_at: SystemTime,
    /// Paired refresh token, if the grant issued one.
    pub refresh_token: Option<String>,
}

impl AccessToken {
    /// Expiry as Unix epoch seconds, for introspection responses.
    pub fn expires_at_epoch(&self) -> u64 {
        self.expires_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// An issued refresh token. Separate record with its own expiry.
#[derive(Debug, Clone)]
pub struct RefreshToken {
    pub token: String,
    pub client_id: String,
    pub scopes: Vec<String>,
    pub subject: Option<String>,
    pub expires_at: SystemTime,
}

/// In-memory token stores. Nothing persists across restarts.
pub struct TokenStore {
    access: Mutex<HashMap<String, AccessToken>>,
    refresh: Mutex<HashMap<String, RefreshToken>>,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenStore {
    pub fn new(access_ttl: Duration, refresh_ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            access: Mutex::new(HashMap::new()),
            refresh: Mutex::new(HashMap::new()),
            access_ttl,
            refresh_ttl,
        })
    }

    /// Access token lifetime, for `expires_in` fields.
    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    fn access_lock(&self) -> MutexGuard<'_, HashMap<String, AccessToken>> {
        self.access.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn refresh_lock(&self) -> MutexGuard<'_, HashMap<String, RefreshToken>> {
        self.refresh.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Issue a fresh access token, optionally paired with a refresh token.
    pub fn issue(
        &self,
        client_id: &str,
        scopes: Vec<String>,
        subject: Option<String>,
        with_refresh: bool,
    ) -> AccessToken {
        let now = SystemTime::now();
        let refresh_token = with_refresh.then(|| {
            let token = generate_token();
            self.refresh_lock().insert(
                token.clone(),
                RefreshToken {
                    token: token.clone(),
                    client_id: client_id.to_string(),
                    scopes: scopes.clone(),
                    subject: subject.clone(),
                    expires_at: now + self.refresh_ttl,
                },
            );
            token
        });

        let access = AccessToken {
            token: generate_token(),
            client_id: client_id.to_string(),
            scopes,
            subject,
            expires_at: now + self.access_ttl,
            refresh_token,
        };
        self.access_lock()
            .insert(access.token.clone(), access.clone());

        tracing::debug!(
            client_id,
            with_refresh,
            expires_in_secs = self.access_ttl.as_secs(),
            "access token issued"
        );
        access
    }

    /// Validate a bearer token: present and unexpired.
    pub fn validate(&self, token: &str) -> Option<AccessToken> {
        let guard = self.access_lock();
        let record = guard.get(token)?;
        if SystemTime::now() >= record.expires_at {
            return None;
        }
        Some(record.clone())
    }

    /// Atomically consume a refresh token for rotation: removed iff it
    /// belongs to `client_id` and is unexpired. A consumed token never
    /// validates again, even if the paired issuance later fails.
    pub fn consume_refresh(&self, token: &str, client_id: &str) -> Option<RefreshToken> {
        let mut guard = self.refresh_lock();
        let record = guard.get(token)?;
        if record.client_id != client_id || SystemTime::now() >= record.expires_at {
            return None;
        }
        guard.remove(token)
    }

    /// Revoke a token. Removes the access token and its paired refresh
    /// token; a refresh token may also be presented directly. Unknown
    /// tokens are a no-op.
    pub fn revoke(&self, token: &str) {
        if let Some(access) = self.access_lock().remove(token) {
            if let Some(refresh) = access.refresh_token {
                self.refresh_lock().remove(&refresh);
            }
            tracing::debug!(client_id = %access.client_id, "access token revoked");
            return;
        }
        if self.refresh_lock().remove(token).is_some() {
            tracing::debug!("refresh token revoked");
        }
    }

    /// Revoke every token owned by a client. Used when a client is removed
    /// at runtime.
    pub fn revoke_client(&self, client_id: &str) -> usize {
        let mut removed = 0;
        {
            let mut guard = self.access_lock();
            let before = guard.len();
            guard.retain(|_, t| t.client_id != client_id);
            removed += before - guard.len();
        }
        {
            let mut guard = self.refresh_lock();
            let before = guard.len();
            guard.retain(|_, t| t.client_id != client_id);
            removed += before - guard.len();
        }
        if removed > 0 {
            tracing::info!(client_id, removed, "client tokens revoked");
        }
        removed
    }

    /// Drop expired entries from both stores. Returns the count removed.
    pub fn sweep(&self) -> usize {
        let now = SystemTime::now();
        let mut removed = 0;
        {
            let mut guard = self.access_lock();
            let before = guard.len();
            guard.retain(|_, t| t.expires_at > now);
            removed += before - guard.len();
        }
        {
            let mut guard = self.refresh_lock();
            let before = guard.len();
            guard.retain(|_, t| t.expires_at > now);
            removed += before - guard.len();
        }
        if removed > 0 {
            tracing::debug!(removed, "swept expired tokens");
        }
        removed
    }

    /// Spawn the periodic sweeper; stops when the token is cancelled.
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        store.sweep();
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        });
    }
}

/// 32 bytes of CSPRNG output, hex encoded.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut out = String::with_capacity(64);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Arc<TokenStore> {
        TokenStore::new(Duration::from_secs(3600), Duration::from_secs(86400))
    }

    #[test]
    fn test_token_format() {
        let token = generate_token();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(generate_token(), generate_token());
    }

    #[test]
    fn test_issue_and_validate() {
        let store = store();
        let issued = store.issue("c1", vec!["read".into()], None, false);
        let validated = store.validate(&issued.token).unwrap();
        assert_eq!(validated.client_id, "c1");
        assert_eq!(validated.scopes, vec!["read".to_string()]);
        assert!(validated.refresh_token.is_none());
    }

    #[test]
    fn test_unknown_token_invalid() {
        assert!(store().validate("nope").is_none());
    }

    #[test]
    fn test_expired_token_invalid() {
        let store = TokenStore::new(Duration::ZERO, Duration::ZERO);
        let issued = store.issue("c1", vec![], None, false);
        assert!(store.validate(&issued.token).is_none());
    }

    #[test]
    fn test_refresh_pairing() {
        let store = store();
        let issued = store.issue("c1", vec![], Some("alice".into()), true);
        let refresh = issued.refresh_token.clone().unwrap();
        let consumed = store.consume_refresh(&refresh, "c1").unwrap();
        assert_eq!(consumed.subject.as_deref(), Some("alice"));
        // Rotation: the presented token never works twice.
        assert!(store.consume_refresh(&refresh, "c1").is_none());
    }

    #[test]
    fn test_refresh_wrong_client_rejected() {
        let store = store();
        let issued = store.issue("c1", vec![], None, true);
        let refresh = issued.refresh_token.unwrap();
        assert!(store.consume_refresh(&refresh, "c2").is_none());
        // Still present for the rightful owner.
        assert!(store.consume_refresh(&refresh, "c1").is_some());
    }

    #[test]
    fn test_revoke_removes_pair() {
        let store = store();
        let issued = store.issue("c1", vec![], None, true);
        let refresh = issued.refresh_token.clone().unwrap();
        store.revoke(&issued.token);
        assert!(store.validate(&issued.token).is_none());
        assert!(store.consume_refresh(&refresh, "c1").is_none());
    }

    #[test]
    fn test_revoke_unknown_is_idempotent() {
        let store = store();
        store.revoke("does-not-exist");
        store.revoke("does-not-exist");
    }

    #[test]
    fn test_revoked_token_never_validates_again() {
        let store = store();
        let issued = store.issue("c1", vec![], None, false);
        assert!(store.validate(&issued.token).is_some());
        store.revoke(&issued.token);
        assert!(store.validate(&issued.token).is_none());
    }

    #[test]
    fn test_revoke_client_clears_everything() {
        let store = store();
        let a = store.issue("c1", vec![], None, true);
        let b = store.issue("c2", vec![], None, false);
        let removed = store.revoke_client("c1");
        assert_eq!(removed, 2); // access + refresh
        assert!(store.validate(&a.token).is_none());
        assert!(store.validate(&b.token).is_some());
    }

    #[test]
    fn test_sweep_drops_expired() {
        let store = TokenStore::new(Duration::ZERO, Duration::ZERO);
        store.issue("c1", vec![], None, true);
        assert_eq!(store.sweep(), 2);
        assert_eq!(store.sweep(), 0);
    }
}
