//! Gateway core: the JSON-RPC dispatch entry point.
//!
//! Implements the MCP subset the gateway owns (`initialize`, `ping`, the
//! catalog list methods) and routes namespaced calls to the owning backend
//! through the [`BackendRouter`] seam. The seam exists so dispatch can be
//! exercised against a mock router in tests.
//!
//! Id policy: the incoming id is echoed verbatim. A request without an id is
//! a notification: side effects still run, no response is produced.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use switchboard_core::GatewayError;
use switchboard_core::jsonrpc::{GatewayRequest, JsonRpcResponse};
use switchboard_core::protocol;

use crate::backend::BackendReply;
use crate::catalog::CatalogSnapshot;

/// Routing surface the gateway depends on. Implemented by the registry; by
/// mocks in tests.
#[async_trait]
pub trait BackendRouter: Send + Sync {
    /// Current aggregate catalog snapshot.
    fn snapshot(&self) -> Arc<CatalogSnapshot>;

    /// Forward a request to the named backend. The deadline is the
    /// gateway-side budget; implementations clamp it to the backend's own
    /// per-call timeout, so the effective deadline is the minimum of both.
    async fn forward(
        &self,
        backend_id: &str,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
    ) -> Result<BackendReply, GatewayError>;

    /// Forward a notification to the named backend, best-effort.
    async fn forward_notification(&self, backend_id: &str, method: &str, params: Option<Value>);
}

/// What a dispatch produced before response shaping.
enum Reply {
    /// Answered locally by the gateway.
    Local(Value),
    /// Answered by a backend; errors pass through verbatim.
    Backend(BackendReply),
}

/// The MCP dispatch entry point.
pub struct Gateway {
    router: Arc<dyn BackendRouter>,
    call_timeout: Duration,
}

impl Gateway {
    pub fn new(router: Arc<dyn BackendRouter>, call_timeout: Duration) -> Self {
        Self {
            router,
            call_timeout,
        }
    }

    /// Dispatch one request. Returns the full response value, or `None` for
    /// notifications.
    pub async fn dispatch(&self, request: GatewayRequest) -> Option<Value> {
        let id = request.id.clone();
        let correlation_id = request.correlation_id;
        let is_notification = request.is_notification();

        let result = self.handle(&request).await;

        if is_notification {
            if let Err(e) = result {
                tracing::debug!(
                    correlation_id = %correlation_id,
                    method = %request.method,
                    error = %e,
                    "notification processing failed"
                );
            }
            return None;
        }

        Some(match result {
            Ok(Reply::Local(value)) | Ok(Reply::Backend(BackendReply::Result(value))) => {
                response_value(JsonRpcResponse::success(id, value))
            }
            Ok(Reply::Backend(BackendReply::Error(error))) => {
                JsonRpcResponse::raw_error(id, error)
            }
            Err(e) => {
                tracing::warn!(
                    correlation_id = %correlation_id,
                    method = %request.method,
                    kind = e.kind(),
                    error = %e,
                    "dispatch failed"
                );
                response_value(JsonRpcResponse::error(id, e.to_jsonrpc_error()))
            }
        })
    }

    async fn handle(&self, request: &GatewayRequest) -> Result<Reply, GatewayError> {
        let snapshot = self.router.snapshot();

        match request.method.as_str() {
            protocol::METHOD_INITIALIZE => Ok(Reply::Local(protocol::initialize_result(
                snapshot.capabilities(),
            ))),
            protocol::METHOD_PING => Ok(Reply::Local(json!({}))),
            protocol::METHOD_TOOLS_LIST => Ok(Reply::Local(json!({
                "tools": snapshot.tool_records(),
            }))),
            protocol::METHOD_RESOURCES_LIST => Ok(Reply::Local(json!({
                "resources": snapshot.resource_records(),
            }))),
            protocol::METHOD_RESOURCE_TEMPLATES_LIST => Ok(Reply::Local(json!({
                "resourceTemplates": snapshot.resource_template_records(),
            }))),
            protocol::METHOD_PROMPTS_LIST => Ok(Reply::Local(json!({
                "prompts": snapshot.prompt_records(),
            }))),
            protocol::METHOD_TOOLS_CALL => {
                let name = required_str_param(request, "name")?;
                let owner = snapshot
                    .tool_owner(&name)
                    .ok_or_else(|| GatewayError::MethodNotFound {
                        method: name.clone(),
                    })?;
                self.route(request, &owner.backend_id.clone()).await
            }
            protocol::METHOD_RESOURCES_READ | protocol::METHOD_RESOURCES_SUBSCRIBE => {
                let uri = required_str_param(request, "uri")?;
                let owner = snapshot
                    .resource_owner(&uri)
                    .ok_or_else(|| GatewayError::MethodNotFound { method: uri.clone() })?;
                self.route(request, &owner.backend_id.clone()).await
            }
            protocol::METHOD_PROMPTS_GET => {
                let name = required_str_param(request, "name")?;
                let owner = snapshot
                    .prompt_owner(&name)
                    .ok_or_else(|| GatewayError::MethodNotFound {
                        method: name.clone(),
                    })?;
                self.route(request, &owner.backend_id.clone()).await
            }
            method if protocol::is_notification_method(method) => {
                tracing::debug!(method, "client notification");
                Ok(Reply::Local(Value::Null))
            }
            method => Err(GatewayError::MethodNotFound {
                method: method.to_string(),
            }),
        }
    }

    async fn route(
        &self,
        request: &GatewayRequest,
        backend_id: &str,
    ) -> Result<Reply, GatewayError> {
        if request.is_notification() {
            self.router
                .forward_notification(backend_id, &request.method, request.params.clone())
                .await;
            return Ok(Reply::Local(Value::Null));
        }
        self.router
            .forward(
                backend_id,
                &request.method,
                request.params.clone(),
                self.call_timeout,
            )
            .await
            .map(Reply::Backend)
    }
}

fn response_value(response: JsonRpcResponse) -> Value {
    serde_json::to_value(&response).unwrap_or_else(|_| {
        json!({
            "jsonrpc": "2.0",
            "id": null,
            "error": {"code": -32603, "message": "internal error: failed to serialize response"},
        })
    })
}

fn required_str_param(request: &GatewayRequest, key: &str) -> Result<String, GatewayError> {
    request
        .params
        .as_ref()
        .and_then(|p| p.get(key))
        .and_then(|v| v.as_str())
        .map(String::from)
        .ok_or_else(|| GatewayError::InvalidParams {
            details: format!("missing required parameter '{key}'"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::BackendCatalog;
    use std::sync::Mutex;
    use switchboard_core::jsonrpc::parse_request;

    /// Mock router recording forwarded calls.
    struct MockRouter {
        snapshot: Arc<CatalogSnapshot>,
        reply: BackendReply,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl MockRouter {
        fn new(snapshot: CatalogSnapshot, reply: BackendReply) -> Arc<Self> {
            Arc::new(Self {
                snapshot: Arc::new(snapshot),
                reply,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl BackendRouter for MockRouter {
        fn snapshot(&self) -> Arc<CatalogSnapshot> {
            self.snapshot.clone()
        }

        async fn forward(
            &self,
            backend_id: &str,
            method: &str,
            _params: Option<Value>,
            _deadline: Duration,
        ) -> Result<BackendReply, GatewayError> {
            self.calls
                .lock()
                .unwrap()
                .push((backend_id.to_string(), method.to_string()));
            Ok(self.reply.clone())
        }

        async fn forward_notification(&self, backend_id: &str, method: &str, _params: Option<Value>) {
            self.calls
                .lock()
                .unwrap()
                .push((backend_id.to_string(), method.to_string()));
        }
    }

    fn echo_snapshot() -> CatalogSnapshot {
        let catalog = BackendCatalog {
            capabilities: json!({"tools": {"listChanged": true}}),
            tools: vec![json!({"name": "echo.say", "description": "echo"})],
            ..Default::default()
        };
        CatalogSnapshot::build([("echo", catalog)].into_iter())
    }

    fn gateway(reply: BackendReply) -> (Gateway, Arc<MockRouter>) {
        let router = MockRouter::new(echo_snapshot(), reply);
        (
            Gateway::new(router.clone(), Duration::from_secs(5)),
            router,
        )
    }

    fn request(body: &str) -> GatewayRequest {
        parse_request(body.as_bytes()).unwrap()
    }

    #[tokio::test]
    async fn test_initialize_locally() {
        let (gateway, router) = gateway(BackendReply::Result(Value::Null));
        let resp = gateway
            .dispatch(request(r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#))
            .await
            .unwrap();
        assert_eq!(resp["id"], 1);
        assert_eq!(resp["result"]["protocolVersion"], protocol::PROTOCOL_VERSION);
        assert_eq!(resp["result"]["serverInfo"]["name"], "switchboard");
        assert_eq!(resp["result"]["capabilities"]["tools"]["listChanged"], true);
        assert!(router.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ping_never_forwarded() {
        let (gateway, router) = gateway(BackendReply::Result(Value::Null));
        let resp = gateway
            .dispatch(request(r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#))
            .await
            .unwrap();
        assert_eq!(resp["result"], json!({}));
        assert!(router.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tools_list_from_snapshot() {
        let (gateway, _) = gateway(BackendReply::Result(Value::Null));
        let resp = gateway
            .dispatch(request(r#"{"jsonrpc":"2.0","id":3,"method":"tools/list"}"#))
            .await
            .unwrap();
        let tools = resp["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["name"], "echo.say");
    }

    #[tokio::test]
    async fn test_tools_call_routed_to_owner() {
        let reply = BackendReply::Result(json!({
            "content": [{"type": "text", "text": "hi"}]
        }));
        let (gateway, router) = gateway(reply);
        let resp = gateway
            .dispatch(request(
                r#"{"jsonrpc":"2.0","id":4,"method":"tools/call","params":{"name":"echo.say","arguments":{"text":"hi"}}}"#,
            ))
            .await
            .unwrap();
        // Response returned verbatim with the client's original id.
        assert_eq!(resp["id"], 4);
        assert_eq!(resp["result"]["content"][0]["text"], "hi");
        assert_eq!(
            router.calls.lock().unwrap()[0],
            ("echo".to_string(), "tools/call".to_string())
        );
    }

    #[tokio::test]
    async fn test_backend_error_passes_through_verbatim() {
        let reply = BackendReply::Error(json!({
            "code": -32000,
            "message": "tool exploded",
            "data": {"custom": 1}
        }));
        let (gateway, _) = gateway(reply);
        let resp = gateway
            .dispatch(request(
                r#"{"jsonrpc":"2.0","id":5,"method":"tools/call","params":{"name":"echo.say"}}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp["id"], 5);
        assert_eq!(resp["error"]["code"], -32000);
        assert_eq!(resp["error"]["data"]["custom"], 1);
    }

    #[tokio::test]
    async fn test_unknown_tool_method_not_found() {
        let (gateway, _) = gateway(BackendReply::Result(Value::Null));
        let resp = gateway
            .dispatch(request(
                r#"{"jsonrpc":"2.0","id":6,"method":"tools/call","params":{"name":"missing"}}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn test_missing_name_param_invalid_params() {
        let (gateway, _) = gateway(BackendReply::Result(Value::Null));
        let resp = gateway
            .dispatch(request(
                r#"{"jsonrpc":"2.0","id":7,"method":"tools/call","params":{}}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp["error"]["code"], -32602);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let (gateway, _) = gateway(BackendReply::Result(Value::Null));
        let resp = gateway
            .dispatch(request(r#"{"jsonrpc":"2.0","id":8,"method":"bogus/method"}"#))
            .await
            .unwrap();
        assert_eq!(resp["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn test_notification_produces_no_response() {
        let (gateway, _) = gateway(BackendReply::Result(Value::Null));
        let resp = gateway
            .dispatch(request(
                r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            ))
            .await;
        assert!(resp.is_none());
    }

    #[tokio::test]
    async fn test_string_id_echoed() {
        let (gateway, _) = gateway(BackendReply::Result(Value::Null));
        let resp = gateway
            .dispatch(request(r#"{"jsonrpc":"2.0","id":"req-9","method":"ping"}"#))
            .await
            .unwrap();
        assert_eq!(resp["id"], "req-9");
    }

    struct UnavailableRouter(Arc<CatalogSnapshot>);

    #[async_trait]
    impl BackendRouter for UnavailableRouter {
        fn snapshot(&self) -> Arc<CatalogSnapshot> {
            self.0.clone()
        }

        async fn forward(
            &self,
            backend_id: &str,
            _method: &str,
            _params: Option<Value>,
            _deadline: Duration,
        ) -> Result<BackendReply, GatewayError> {
            Err(GatewayError::BackendUnavailable {
                backend_id: backend_id.to_string(),
                detail: "degraded".to_string(),
            })
        }

        async fn forward_notification(&self, _: &str, _: &str, _: Option<Value>) {}
    }

    #[tokio::test]
    async fn test_backend_unavailable_shaped() {
        let router = Arc::new(UnavailableRouter(Arc::new(echo_snapshot())));
        let gateway = Gateway::new(router, Duration::from_secs(5));
        let resp = gateway
            .dispatch(request(
                r#"{"jsonrpc":"2.0","id":10,"method":"tools/call","params":{"name":"echo.say"}}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp["error"]["code"], -32603);
        assert_eq!(resp["error"]["data"]["kind"], "backend_unavailable");
        assert_eq!(resp["error"]["data"]["backendId"], "echo");
    }
}
