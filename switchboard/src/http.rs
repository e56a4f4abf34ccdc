//! HTTP edge: routes, request parsing, and JSON-RPC error shaping.
//!
//! Route table:
//!
//! | Method | Path | Auth |
//! |---|---|---|
//! | GET | `/sse` | yes |
//! | POST | `/sse`, `/rpc` | yes |
//! | POST | `/message` | yes (+ session correlation) |
//! | GET | `/admin/health`, `/admin/status` | yes |
//! | POST | `/admin/backends/{id}/restart` | yes |
//! | POST | `/admin/clients`, DELETE `/admin/clients/{id}` | yes |
//! | POST | `/oauth/validate` | yes |
//! | POST | `/oauth/token`, `/oauth/revoke` | public |
//! | GET | `/oauth/authorize` (stub), `/.well-known/openid-configuration` | public |
//! | GET | `/icon.svg`, `/icon` | public |
//!
//! JSON-RPC errors ride HTTP 200; auth and rate-limit failures are HTTP
//! statuses (401/403/429).

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{ConnectInfo, DefaultBodyLimit, Extension, Query, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use switchboard_core::GatewayError;
use switchboard_core::jsonrpc::{self, JsonRpcResponse};

use crate::admin;
use crate::auth::{self, AuthIdentity, AuthState};
use crate::backend::Registry;
use crate::gateway::Gateway;
use crate::rate_limit::PerIpRateLimiter;
use crate::session::SessionManager;

/// Maximum accepted request body.
pub const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Shared state for the HTTP layer.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub registry: Arc<Registry>,
    pub sessions: Arc<SessionManager>,
    pub auth: Arc<AuthState>,
    pub rate: Arc<PerIpRateLimiter>,
}

/// Build the gateway's router.
pub fn build_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/oauth/token", post(auth::token))
        .route("/oauth/revoke", post(auth::revoke))
        .route("/oauth/authorize", get(auth::authorize_stub))
        .route("/.well-known/openid-configuration", get(auth::discovery))
        .with_state(state.auth.clone());

    let branding = Router::new()
        .route("/icon.svg", get(icon))
        .route("/icon", get(icon));

    let oauth_protected = Router::new()
        .route("/oauth/validate", post(auth::validate))
        .route("/admin/clients", post(auth::register_client))
        .route("/admin/clients/{id}", delete(auth::remove_client))
        .with_state(state.auth.clone());

    let protected = Router::new()
        .route("/sse", get(sse_open).post(rpc))
        .route("/rpc", post(rpc))
        .route("/message", post(message))
        .route("/admin/health", get(admin::health))
        .route("/admin/status", get(admin::status))
        .route("/admin/backends/{id}/restart", post(admin::restart_backend))
        .with_state(state.clone())
        .merge(oauth_protected)
        .layer(middleware::from_fn_with_state(
            state.auth.clone(),
            auth::require_auth,
        ))
        .layer(middleware::from_fn_with_state(
            state.rate.clone(),
            rate_limit,
        ));

    Router::new()
        .merge(public)
        .merge(branding)
        .merge(protected)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

/// Per-IP rate limiting for authenticated endpoints. Requests without a
/// peer address (in-process tests) pass through.
async fn rate_limit(
    State(limiter): State<Arc<PerIpRateLimiter>>,
    request: Request,
    next: Next,
) -> Result<Response, Response> {
    let ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip());
    if let Some(ip) = ip {
        if !limiter.check(ip) {
            return Err((
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, "1")],
                Json(json!({"error": "rate_limited"})),
            )
                .into_response());
        }
    }
    Ok(next.run(request).await)
}

/// GET /sse: open the event stream for a new session.
async fn sse_open(
    State(state): State<AppState>,
    Extension(identity): Extension<AuthIdentity>,
) -> Response {
    let (session, rx) = state.sessions.create(&identity);
    let notifications = state.registry.subscribe_notifications();
    let sse = state.sessions.sse_stream(session, rx, notifications);

    let mut response = sse.into_response();
    let headers = response.headers_mut();
    // Reverse proxies must not buffer the event stream.
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

/// POST /rpc and POST /sse: stateless JSON-RPC dispatch.
async fn rpc(State(state): State<AppState>, body: Bytes) -> Response {
    dispatch_body(&state, &body).await
}

#[derive(Debug, Deserialize)]
struct MessageQuery {
    session_id: Option<String>,
}

/// POST /message: session-correlated JSON-RPC. The response is returned in
/// the HTTP body and mirrored as a `message` event on the session's stream.
async fn message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<MessageQuery>,
    body: Bytes,
) -> Response {
    let session_id = headers
        .get("x-session-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .or(query.session_id);
    let Some(session_id) = session_id else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "missing session correlation (X-Session-Id header or session_id query)",
            })),
        )
            .into_response();
    };
    let Some(session) = state.sessions.get(&session_id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "unknown session"})),
        )
            .into_response();
    };
    session.touch();

    let request = match jsonrpc::parse_request(&body) {
        Ok(r) => r,
        Err(e) => return jsonrpc_error_response(e),
    };

    match state.gateway.dispatch(request).await {
        Some(value) => {
            if !session.send(value.clone()) {
                state.sessions.remove(&session_id);
            }
            (StatusCode::OK, Json(value)).into_response()
        }
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn dispatch_body(state: &AppState, body: &[u8]) -> Response {
    let request = match jsonrpc::parse_request(body) {
        Ok(r) => r,
        Err(e) => return jsonrpc_error_response(e),
    };
    match state.gateway.dispatch(request).await {
        Some(value) => (StatusCode::OK, Json(value)).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

/// Shape a parse-level failure as a JSON-RPC error on HTTP 200.
fn jsonrpc_error_response(error: GatewayError) -> Response {
    let response = JsonRpcResponse::error(None, error.to_jsonrpc_error());
    (StatusCode::OK, Json(response)).into_response()
}

/// Branding asset served at /icon.svg and /icon.
const ICON_SVG: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 64 64">
  <rect width="64" height="64" rx="12" fill="#1f2430"/>
  <circle cx="18" cy="20" r="5" fill="#7aa2f7"/>
  <circle cx="18" cy="44" r="5" fill="#7aa2f7"/>
  <circle cx="46" cy="32" r="6" fill="#9ece6a"/>
  <path d="M23 20 H34 Q40 20 40 26 V32 M23 44 H34 Q40 44 40 38 V32" stroke="#c0caf5" stroke-width="3" fill="none" stroke-linecap="round"/>
</svg>
"##;

async fn icon() -> Response {
    (
        [(header::CONTENT_TYPE, "image/svg+xml")],
        ICON_SVG,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::BackendRouter;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    use axum::body::Body;

    fn test_state() -> AppState {
        let auth_config: switchboard_core::config::AuthConfig = serde_json::from_value(json!({
            "static_tokens": ["test-token"],
            "clients": [{
                "client_id": "c1",
                "client_secret": "s1",
                "scopes": ["tools:call"],
                "grant_types": ["client_credentials", "password", "refresh_token"]
            }]
        }))
        .unwrap();
        let auth = AuthState::new(&auth_config, None);
        let registry = Registry::new(vec![], CancellationToken::new());
        let gateway = Arc::new(Gateway::new(
            registry.clone() as Arc<dyn BackendRouter>,
            Duration::from_secs(5),
        ));
        AppState {
            gateway,
            registry,
            sessions: SessionManager::new(Duration::from_secs(300)),
            auth,
            rate: PerIpRateLimiter::new(&switchboard_core::config::RateLimitConfig {
                rps: 100,
                burst: 200,
            }),
        }
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn authed_post(uri: &str, body: &str) -> Request {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("authorization", "Bearer test-token")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_rpc_requires_auth() {
        let router = build_router(test_state());
        let request = Request::builder()
            .method("POST")
            .uri("/rpc")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_rpc_ping_with_token() {
        let router = build_router(test_state());
        let response = router
            .oneshot(authed_post("/rpc", r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["id"], 1);
        assert_eq!(body["result"], json!({}));
    }

    #[tokio::test]
    async fn test_query_token_accepted() {
        let router = build_router(test_state());
        let request = Request::builder()
            .method("POST")
            .uri("/rpc?token=test-token")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_malformed_json_parse_error() {
        let router = build_router(test_state());
        let response = router
            .oneshot(authed_post("/rpc", r#"{"broken"#))
            .await
            .unwrap();
        // JSON-RPC errors ride HTTP 200.
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], -32700);
    }

    #[tokio::test]
    async fn test_notification_no_content() {
        let router = build_router(test_state());
        let response = router
            .oneshot(authed_post(
                "/rpc",
                r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_message_requires_session() {
        let router = build_router(test_state());
        let response = router
            .oneshot(authed_post(
                "/message",
                r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_message_unknown_session() {
        let state = test_state();
        let router = build_router(state);
        let mut request = authed_post("/message", r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#);
        request
            .headers_mut()
            .insert("x-session-id", HeaderValue::from_static("nope"));
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_message_roundtrip_mirrors_to_stream() {
        let state = test_state();
        let identity = AuthIdentity {
            client_id: "static".to_string(),
            subject: None,
        };
        let (session, mut rx) = state.sessions.create(&identity);
        let session_id = session.id.clone();
        let router = build_router(state);

        let mut request = authed_post("/message", r#"{"jsonrpc":"2.0","id":7,"method":"ping"}"#);
        request.headers_mut().insert(
            "x-session-id",
            HeaderValue::from_str(&session_id).unwrap(),
        );
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["id"], 7);

        // Mirrored onto the session stream.
        let mirrored = rx.recv().await.unwrap();
        assert_eq!(mirrored["id"], 7);
    }

    #[tokio::test]
    async fn test_sse_stream_headers() {
        let router = build_router(test_state());
        let request = Request::builder()
            .method("GET")
            .uri("/sse")
            .header("authorization", "Bearer test-token")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(
            headers.get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );
        assert_eq!(headers.get("x-accel-buffering").unwrap(), "no");
        assert_eq!(headers.get(header::CACHE_CONTROL).unwrap(), "no-cache");
    }

    #[tokio::test]
    async fn test_admin_health_healthy_with_no_backends() {
        let router = build_router(test_state());
        let request = Request::builder()
            .method("GET")
            .uri("/admin/health")
            .header("authorization", "Bearer test-token")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_oauth_token_client_credentials() {
        let router = build_router(test_state());
        let request = Request::builder()
            .method("POST")
            .uri("/oauth/token")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from(
                "grant_type=client_credentials&client_id=c1&client_secret=s1",
            ))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["token_type"], "Bearer");
        assert_eq!(body["expires_in"], 3600);
        assert!(body["access_token"].as_str().unwrap().len() == 64);
        assert!(body.get("refresh_token").is_none());
    }

    #[tokio::test]
    async fn test_oauth_issued_token_authenticates() {
        let state = test_state();
        let router = build_router(state.clone());

        let request = Request::builder()
            .method("POST")
            .uri("/oauth/token")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from(
                "grant_type=client_credentials&client_id=c1&client_secret=s1",
            ))
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        let token = body_json(response).await["access_token"]
            .as_str()
            .unwrap()
            .to_string();

        let request = Request::builder()
            .method("GET")
            .uri("/admin/health")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_oauth_bad_secret_rejected() {
        let router = build_router(test_state());
        let request = Request::builder()
            .method("POST")
            .uri("/oauth/token")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from(
                "grant_type=client_credentials&client_id=c1&client_secret=wrong",
            ))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["error"], "invalid_client");
    }

    #[tokio::test]
    async fn test_refresh_rotation_over_http() {
        let router = build_router(test_state());

        // password grant issues (A1, R1)
        let request = Request::builder()
            .method("POST")
            .uri("/oauth/token")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from(
                "grant_type=password&client_id=c1&client_secret=s1&username=alice&password=x",
            ))
            .unwrap();
        let body = body_json(router.clone().oneshot(request).await.unwrap()).await;
        let r1 = body["refresh_token"].as_str().unwrap().to_string();

        // refresh_token grant with R1 issues (A2, R2)
        let request = Request::builder()
            .method("POST")
            .uri("/oauth/token")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from(format!(
                "grant_type=refresh_token&client_id=c1&client_secret=s1&refresh_token={r1}"
            )))
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let r2 = body["refresh_token"].as_str().unwrap().to_string();
        assert_ne!(r1, r2);

        // R1 is dead.
        let request = Request::builder()
            .method("POST")
            .uri("/oauth/token")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from(format!(
                "grant_type=refresh_token&client_id=c1&client_secret=s1&refresh_token={r1}"
            )))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], "invalid_grant");
    }

    #[tokio::test]
    async fn test_discovery_public() {
        let router = build_router(test_state());
        let request = Request::builder()
            .method("GET")
            .uri("/.well-known/openid-configuration")
            .header("host", "gateway.example.com")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(
            body["token_endpoint"],
            "http://gateway.example.com/oauth/token"
        );
        assert!(
            body["grant_types_supported"]
                .as_array()
                .unwrap()
                .contains(&json!("client_credentials"))
        );
    }

    #[tokio::test]
    async fn test_authorize_stub_not_implemented() {
        let router = build_router(test_state());
        let request = Request::builder()
            .method("GET")
            .uri("/oauth/authorize")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn test_icon_public() {
        let router = build_router(test_state());
        let request = Request::builder()
            .method("GET")
            .uri("/icon.svg")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "image/svg+xml"
        );
    }

    #[tokio::test]
    async fn test_rate_limit_enforced() {
        let state = AppState {
            rate: PerIpRateLimiter::new(&switchboard_core::config::RateLimitConfig {
                rps: 1,
                burst: 1,
            }),
            ..test_state()
        };
        let router = build_router(state);
        let addr: SocketAddr = "10.1.2.3:55555".parse().unwrap();

        let mut first = authed_post("/rpc", r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#);
        first.extensions_mut().insert(ConnectInfo(addr));
        let response = router.clone().oneshot(first).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let mut second = authed_post("/rpc", r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#);
        second.extensions_mut().insert(ConnectInfo(addr));
        let response = router.oneshot(second).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "1");
    }
}
