//! OAuth2 endpoint handlers: token grants, revocation, introspection,
//! discovery, and the runtime client admin surface.
//!
//! Three grants are processed at the token endpoint: `client_credentials`,
//! `password`, and `refresh_token` with rotation. Client authentication is
//! accepted as HTTP Basic or form fields; both are equivalent.

use std::sync::Arc;

use axum::{
    Form, Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::{Value, json};

use switchboard_core::config::{GrantType, OAuthClientConfig};

use super::store::AccessToken;
use super::AuthState;

/// Token endpoint form body.
#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    grant_type: String,
    client_id: Option<String>,
    client_secret: Option<String>,
    scope: Option<String>,
    username: Option<String>,
    password: Option<String>,
    refresh_token: Option<String>,
}

/// POST /oauth/token
pub async fn token(
    State(auth): State<Arc<AuthState>>,
    headers: HeaderMap,
    Form(req): Form<TokenRequest>,
) -> Response {
    // Client authentication: Basic header wins, form fields otherwise.
    let credentials = basic_credentials(&headers)
        .or_else(|| req.client_id.clone().zip(req.client_secret.clone()));
    let Some((client_id, client_secret)) = credentials else {
        return oauth_error(
            StatusCode::UNAUTHORIZED,
            "invalid_client",
            "client authentication required",
        );
    };

    let Some(client) = auth.client(&client_id) else {
        return oauth_error(StatusCode::UNAUTHORIZED, "invalid_client", "unknown client");
    };
    if client.client_secret != client_secret {
        tracing::warn!(client_id = %client_id, "token request with bad client secret");
        return oauth_error(StatusCode::UNAUTHORIZED, "invalid_client", "bad client secret");
    }

    let grant = match req.grant_type.as_str() {
        "client_credentials" => GrantType::ClientCredentials,
        "password" => GrantType::Password,
        "refresh_token" => GrantType::RefreshToken,
        other => {
            return oauth_error(
                StatusCode::BAD_REQUEST,
                "unsupported_grant_type",
                &format!("unsupported grant_type '{other}'"),
            );
        }
    };
    if !client.grant_types.contains(&grant) {
        return oauth_error(
            StatusCode::BAD_REQUEST,
            "unauthorized_client",
            &format!("client may not use grant '{}'", grant.as_str()),
        );
    }

    let scopes = intersect_scopes(req.scope.as_deref(), &client.scopes);

    match grant {
        GrantType::ClientCredentials => {
            let access = auth.tokens.issue(&client_id, scopes, None, false);
            token_response(&auth, access)
        }
        GrantType::Password => {
            let Some(username) = req.username else {
                return oauth_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_request",
                    "username required for password grant",
                );
            };
            if !verify_password(&username, req.password.as_deref()) {
                return oauth_error(StatusCode::BAD_REQUEST, "invalid_grant", "bad credentials");
            }
            let access = auth.tokens.issue(&client_id, scopes, Some(username), true);
            token_response(&auth, access)
        }
        GrantType::RefreshToken => {
            let Some(presented) = req.refresh_token else {
                return oauth_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_request",
                    "refresh_token required",
                );
            };
            // Rotation: the presented token is invalidated in the same step
            // that authorizes the replacement.
            let Some(old) = auth.tokens.consume_refresh(&presented, &client_id) else {
                return oauth_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_grant",
                    "unknown or expired refresh token",
                );
            };
            let scopes = match req.scope.as_deref() {
                Some(requested) => intersect_scopes(Some(requested), &old.scopes),
                None => old.scopes,
            };
            let access = auth.tokens.issue(&client_id, scopes, old.subject, true);
            token_response(&auth, access)
        }
    }
}

/// Password verification seam.
///
/// Accepts any password: this gateway has no user store, and the password
/// grant exists for test scaffolding. A deployment with real users replaces
/// this one function with a call into its identity provider.
fn verify_password(_username: &str, _password: Option<&str>) -> bool {
    true
}

/// Revocation request body (RFC 7009 shape).
#[derive(Debug, Deserialize)]
pub struct RevokeRequest {
    token: String,
    #[serde(rename = "token_type_hint")]
    _token_type_hint: Option<String>,
}

/// POST /oauth/revoke
///
/// Revoking an unknown token is idempotent and still succeeds.
pub async fn revoke(
    State(auth): State<Arc<AuthState>>,
    Form(req): Form<RevokeRequest>,
) -> Response {
    auth.tokens.revoke(&req.token);
    (StatusCode::OK, Json(json!({}))).into_response()
}

/// Introspection request body.
#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    token: String,
}

/// POST /oauth/validate
pub async fn validate(
    State(auth): State<Arc<AuthState>>,
    Form(req): Form<ValidateRequest>,
) -> Response {
    match auth.tokens.validate(&req.token) {
        Some(token) => Json(json!({
            "active": true,
            "client_id": token.client_id,
            "scope": token.scopes.join(" "),
            "expires_at": token.expires_at_epoch(),
        }))
        .into_response(),
        None => Json(json!({"active": false})).into_response(),
    }
}

/// GET /.well-known/openid-configuration
pub async fn discovery(State(auth): State<Arc<AuthState>>, headers: HeaderMap) -> Response {
    let base = auth
        .issuer()
        .map(str::to_owned)
        .unwrap_or_else(|| base_url_from_headers(&headers));

    Json(json!({
        "issuer": base,
        "authorization_endpoint": format!("{base}/oauth/authorize"),
        "token_endpoint": format!("{base}/oauth/token"),
        "revocation_endpoint": format!("{base}/oauth/revoke"),
        "introspection_endpoint": format!("{base}/oauth/validate"),
        "grant_types_supported": auth.grant_types_union(),
        "scopes_supported": auth.scopes_union(),
        "response_types_supported": ["code"],
        "token_endpoint_auth_methods_supported": ["client_secret_basic", "client_secret_post"],
    }))
    .into_response()
}

/// GET /oauth/authorize
///
/// Advertised in the discovery document but intentionally unimplemented:
/// the interactive authorization-code flow is out of scope.
pub async fn authorize_stub() -> Response {
    (
        StatusCode::NOT_IMPLEMENTED,
        Json(json!({
            "error": "unsupported_response_type",
            "error_description": "interactive authorization is not implemented",
        })),
    )
        .into_response()
}

/// POST /admin/clients: register an OAuth client at runtime.
pub async fn register_client(
    State(auth): State<Arc<AuthState>>,
    Json(client): Json<OAuthClientConfig>,
) -> Response {
    if client.client_id.trim().is_empty() || client.client_secret.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "client_id and client_secret are required"})),
        )
            .into_response();
    }
    let client_id = client.client_id.clone();
    match auth.register_client(client) {
        Ok(()) => (
            StatusCode::CREATED,
            Json(json!({"registered": client_id})),
        )
            .into_response(),
        Err(()) => (
            StatusCode::CONFLICT,
            Json(json!({"error": format!("client '{client_id}' already exists")})),
        )
            .into_response(),
    }
}

/// DELETE /admin/clients/{id}: remove a client and revoke its tokens.
pub async fn remove_client(
    State(auth): State<Arc<AuthState>>,
    Path(client_id): Path<String>,
) -> Response {
    if auth.remove_client(&client_id) {
        (StatusCode::OK, Json(json!({"removed": client_id}))).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("client '{client_id}' not found")})),
        )
            .into_response()
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

/// Issuer fallback: the request's base URL, honouring the forwarded proto
/// set by the TLS-terminating proxy.
fn base_url_from_headers(headers: &HeaderMap) -> String {
    let proto = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    let host = headers
        .get("host")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("{proto}://{host}")
}

/// Parse `Authorization: Basic <base64(id:secret)>`.
fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get("authorization")?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (id, secret) = decoded.split_once(':')?;
    Some((id.to_string(), secret.to_string()))
}

/// Requested scopes ∩ allowed scopes. No request means everything allowed.
fn intersect_scopes(requested: Option<&str>, allowed: &[String]) -> Vec<String> {
    match requested {
        None => allowed.to_vec(),
        Some(requested) => requested
            .split_whitespace()
            .filter(|s| allowed.iter().any(|a| a == s))
            .map(String::from)
            .collect(),
    }
}

fn token_response(auth: &AuthState, access: AccessToken) -> Response {
    let mut body = json!({
        "access_token": access.token,
        "token_type": "Bearer",
        "expires_in": auth.tokens.access_ttl().as_secs(),
        "scope": access.scopes.join(" "),
    });
    if let Some(refresh) = access.refresh_token {
        body["refresh_token"] = Value::String(refresh);
    }
    Json(body).into_response()
}

fn oauth_error(status: StatusCode, code: &str, description: &str) -> Response {
    (
        status,
        Json(json!({"error": code, "error_description": description})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_credentials_roundtrip() {
        let mut headers = HeaderMap::new();
        let encoded = BASE64.encode("c1:s1");
        headers.insert(
            "authorization",
            format!("Basic {encoded}").parse().unwrap(),
        );
        assert_eq!(
            basic_credentials(&headers),
            Some(("c1".to_string(), "s1".to_string()))
        );
    }

    #[test]
    fn test_basic_credentials_rejects_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer xyz".parse().unwrap());
        assert!(basic_credentials(&headers).is_none());
    }

    #[test]
    fn test_intersect_scopes() {
        let allowed = vec!["a".to_string(), "b".to_string()];
        assert_eq!(intersect_scopes(None, &allowed), allowed);
        assert_eq!(intersect_scopes(Some("a c"), &allowed), vec!["a".to_string()]);
        assert!(intersect_scopes(Some("c d"), &allowed).is_empty());
    }

    #[test]
    fn test_verify_password_accepts_anything() {
        assert!(verify_password("alice", Some("whatever")));
        assert!(verify_password("bob", None));
    }
}
