//! Auth core: bearer validation middleware and OAuth2 grant processing.
//!
//! A request authenticates with `Authorization: Bearer <token>` or, for SSE
//! clients that cannot set headers, a `?token=` query parameter with the
//! same validation semantics. A token is valid if it appears verbatim in
//! the static token list or in the OAuth store with an unexpired TTL.

mod oauth;
mod store;

pub use oauth::{
    authorize_stub, discovery, register_client, remove_client, revoke, token, validate,
};
pub use store::{AccessToken, TokenStore, generate_token};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use axum::{
    Json,
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;

use switchboard_core::config::{AuthConfig, GrantType, OAuthClientConfig};

/// Identity attached to authenticated requests.
#[derive(Debug, Clone)]
pub struct AuthIdentity {
    /// OAuth client id, or `"static"` for static-token callers.
    pub client_id: String,
    /// Subject for password-grant tokens.
    pub subject: Option<String>,
}

/// Shared authentication state: the static token list, the runtime client
/// registry, and the token stores.
pub struct AuthState {
    static_tokens: Vec<String>,
    clients: Mutex<HashMap<String, OAuthClientConfig>>,
    pub tokens: Arc<TokenStore>,
    issuer: Option<String>,
}

impl AuthState {
    pub fn new(auth: &AuthConfig, issuer: Option<String>) -> Arc<Self> {
        let clients = auth
            .clients
            .iter()
            .map(|c| (c.client_id.clone(), c.clone()))
            .collect();
        Arc::new(Self {
            static_tokens: auth.static_tokens.clone(),
            clients: Mutex::new(clients),
            tokens: TokenStore::new(auth.token_ttl(), auth.refresh_ttl()),
            issuer: issuer.clone(),
        })
    }

    fn clients_lock(&self) -> MutexGuard<'_, HashMap<String, OAuthClientConfig>> {
        self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Look up a registered client.
    pub fn client(&self, client_id: &str) -> Option<OAuthClientConfig> {
        self.clients_lock().get(client_id).cloned()
    }

    /// Register a client at runtime. Fails if the id is taken.
    pub fn register_client(&self, client: OAuthClientConfig) -> Result<(), ()> {
        let mut guard = self.clients_lock();
        if guard.contains_key(&client.client_id) {
            return Err(());
        }
        tracing::info!(client_id = %client.client_id, "oauth client registered");
        guard.insert(client.client_id.clone(), client);
        Ok(())
    }

    /// Remove a client and revoke every token it owns.
    pub fn remove_client(&self, client_id: &str) -> bool {
        let removed = self.clients_lock().remove(client_id).is_some();
        if removed {
            self.tokens.revoke_client(client_id);
            tracing::info!(client_id, "oauth client removed");
        }
        removed
    }

    /// Union of scopes across registered clients, for discovery.
    pub fn scopes_union(&self) -> Vec<String> {
        let mut scopes: Vec<String> = self
            .clients_lock()
            .values()
            .flat_map(|c| c.scopes.iter().cloned())
            .collect();
        scopes.sort();
        scopes.dedup();
        scopes
    }

    /// Union of grant types across registered clients, for discovery.
    pub fn grant_types_union(&self) -> Vec<&'static str> {
        let mut grants: Vec<&'static str> = self
            .clients_lock()
            .values()
            .flat_map(|c| c.grant_types.iter().map(GrantType::as_str))
            .collect();
        grants.sort();
        grants.dedup();
        grants
    }

    /// Configured issuer, if any.
    pub fn issuer(&self) -> Option<&str> {
        self.issuer.as_deref()
    }

    /// Validate a bearer token against the static list and the OAuth store.
    pub fn validate_bearer(&self, token: &str) -> Option<AuthIdentity> {
        if self.static_tokens.iter().any(|t| t == token) {
            return Some(AuthIdentity {
                client_id: "static".to_string(),
                subject: None,
            });
        }
        self.tokens.validate(token).map(|t| AuthIdentity {
            client_id: t.client_id,
            subject: t.subject,
        })
    }
}

/// Middleware enforcing bearer auth on protected routes.
///
/// Accepts the token from the `Authorization` header or a `token` query
/// parameter. On success the resolved [`AuthIdentity`] is attached to the
/// request extensions.
pub async fn require_auth(
    State(auth): State<Arc<AuthState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, Response> {
    let header_token = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let query_token = request.uri().query().and_then(token_query_param);

    let token = header_token.map(str::to_owned).or(query_token);

    let Some(token) = token else {
        return Err(unauthorized("missing bearer token"));
    };

    match auth.validate_bearer(&token) {
        Some(identity) => {
            request.extensions_mut().insert(identity);
            Ok(next.run(request).await)
        }
        None => {
            tracing::warn!("auth failed: unknown or expired token");
            Err(unauthorized("invalid or expired token"))
        }
    }
}

/// Extract `token=<value>` from a raw query string.
fn token_query_param(query: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "token")
        .map(|(_, value)| value.to_string())
}

fn unauthorized(detail: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "unauthorized", "error_description": detail})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn auth_config() -> AuthConfig {
        serde_json::from_value(json!({
            "static_tokens": ["static-secret"],
            "clients": [{
                "client_id": "c1",
                "client_secret": "s1",
                "scopes": ["tools:read", "tools:call"],
                "grant_types": ["client_credentials", "password", "refresh_token"]
            }]
        }))
        .unwrap()
    }

    #[test]
    fn test_static_token_validates() {
        let auth = AuthState::new(&auth_config(), None);
        let identity = auth.validate_bearer("static-secret").unwrap();
        assert_eq!(identity.client_id, "static");
    }

    #[test]
    fn test_unknown_token_rejected() {
        let auth = AuthState::new(&auth_config(), None);
        assert!(auth.validate_bearer("nope").is_none());
    }

    #[test]
    fn test_oauth_token_validates_until_expiry() {
        let auth = AuthState::new(&auth_config(), None);
        let issued = auth.tokens.issue("c1", vec![], None, false);
        let identity = auth.validate_bearer(&issued.token).unwrap();
        assert_eq!(identity.client_id, "c1");
    }

    #[test]
    fn test_expired_oauth_token_rejected() {
        let mut config = auth_config();
        config.token_ttl_secs = 0;
        let auth = AuthState::new(&config, None);
        let issued = auth.tokens.issue("c1", vec![], None, false);
        assert!(auth.validate_bearer(&issued.token).is_none());
    }

    #[test]
    fn test_token_query_param() {
        assert_eq!(
            token_query_param("a=1&token=abc&b=2").as_deref(),
            Some("abc")
        );
        assert!(token_query_param("a=1&b=2").is_none());
    }

    #[test]
    fn test_client_registry_runtime_mutation() {
        let auth = AuthState::new(&auth_config(), None);
        let new_client: OAuthClientConfig = serde_json::from_value(json!({
            "client_id": "c2",
            "client_secret": "s2",
            "grant_types": ["client_credentials"]
        }))
        .unwrap();
        auth.register_client(new_client.clone()).unwrap();
        assert!(auth.client("c2").is_some());
        // Duplicate registration fails.
        assert!(auth.register_client(new_client).is_err());

        // Removal revokes the client's tokens.
        let issued = auth.tokens.issue("c2", vec![], None, false);
        assert!(auth.remove_client("c2"));
        assert!(auth.client("c2").is_none());
        assert!(auth.tokens.validate(&issued.token).is_none());
        assert!(!auth.remove_client("c2"));
    }

    #[test]
    fn test_discovery_unions() {
        let auth = AuthState::new(&auth_config(), None);
        assert_eq!(
            auth.scopes_union(),
            vec!["tools:call".to_string(), "tools:read".to_string()]
        );
        let grants = auth.grant_types_union();
        assert!(grants.contains(&"client_credentials"));
        assert!(grants.contains(&"refresh_token"));
    }
}
