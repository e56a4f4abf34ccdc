//! Error taxonomy and JSON-RPC 2.0 error shaping.
//!
//! All errors that cross the HTTP boundary are shaped here, either into a
//! JSON-RPC error object or an HTTP status code. Framing, lifecycle, and
//! supervision errors are recovered locally by the backend layer and never
//! reach this mapping directly; callers see them as `BackendUnavailable`.
//!
//! # Error code mapping
//!
//! | Variant | JSON-RPC code | `data.kind` |
//! |---|---|---|
//! | `ParseError` | -32700 | - |
//! | `InvalidRequest` | -32600 | - |
//! | `MethodNotFound` | -32601 | - |
//! | `InvalidParams` | -32602 | - |
//! | `Internal` | -32603 | `internal` |
//! | `BackendUnavailable` | -32603 | `backend_unavailable` |
//! | `RequestTimeout` | -32603 | `timeout` |
//! | `BackendProtocol` | -32603 | `backend_unavailable` |
//! | `ShuttingDown` | -32603 | `shutting_down` |
//!
//! `Unauthorized`, `Forbidden`, and `RateLimited` never become JSON-RPC
//! errors; they map to HTTP 401/403/429 before dispatch. `ConfigInvalid` is
//! startup-only and fatal.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// JSON-RPC 2.0 error object embedded in error responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code (standard JSON-RPC or -32603 with structured data).
    pub code: i32,
    /// Human-readable error message.
    pub message: String,
    /// Structured error context (optional).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ErrorData>,
}

/// Structured context for gateway-originated errors.
///
/// Safe for client consumption: never carries token material, internal
/// paths, or stack traces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorData {
    /// Machine-readable failure kind (e.g. `backend_unavailable`, `timeout`).
    pub kind: String,
    /// Owning backend, when the failure is attributable to one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_id: Option<String>,
    /// Sanitized detail string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// All error conditions the gateway can produce.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GatewayError {
    /// Configuration is invalid. Startup-only; aborts the process.
    #[error("invalid configuration: {details}")]
    ConfigInvalid { details: String },

    /// Missing, unknown, or expired credentials.
    #[error("unauthorized: {reason}")]
    Unauthorized { reason: String },

    /// Authenticated but not permitted.
    #[error("forbidden: {reason}")]
    Forbidden { reason: String },

    /// Request body is not valid JSON.
    #[error("parse error: {details}")]
    ParseError { details: String },

    /// Request is not a valid JSON-RPC 2.0 message.
    #[error("invalid request: {details}")]
    InvalidRequest { details: String },

    /// No such method, tool, resource, or prompt.
    #[error("method '{method}' not found")]
    MethodNotFound { method: String },

    /// Method parameters failed validation.
    #[error("invalid params: {details}")]
    InvalidParams { details: String },

    /// Unexpected internal failure; the correlation id locates the log entry.
    #[error("internal error (ref {correlation_id})")]
    Internal { correlation_id: String },

    /// Backend is degraded, restarting, or not yet ready.
    #[error("backend '{backend_id}' unavailable")]
    BackendUnavailable { backend_id: String, detail: String },

    /// Per-call deadline elapsed before the backend responded.
    #[error("backend '{backend_id}' did not respond within {timeout_secs}s")]
    RequestTimeout { backend_id: String, timeout_secs: u64 },

    /// Backend emitted malformed JSON or violated framing. Triggers a
    /// restart; callers observe it as `backend_unavailable`.
    #[error("backend '{backend_id}' protocol violation: {detail}")]
    BackendProtocol { backend_id: String, detail: String },

    /// The gateway is shutting down; outstanding calls are cancelled.
    #[error("gateway is shutting down")]
    ShuttingDown,

    /// Too many requests from one client.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
}

impl GatewayError {
    /// Map to a JSON-RPC 2.0 error code.
    pub fn jsonrpc_code(&self) -> i32 {
        match self {
            Self::ParseError { .. } => -32700,
            Self::InvalidRequest { .. } => -32600,
            Self::MethodNotFound { .. } => -32601,
            Self::InvalidParams { .. } => -32602,
            Self::Internal { .. }
            | Self::BackendUnavailable { .. }
            | Self::RequestTimeout { .. }
            | Self::BackendProtocol { .. }
            | Self::ShuttingDown => -32603,
            // These cross the boundary as HTTP statuses, but dispatch-level
            // callers still get a sane code if one slips through.
            Self::ConfigInvalid { .. }
            | Self::Unauthorized { .. }
            | Self::Forbidden { .. }
            | Self::RateLimited { .. } => -32603,
        }
    }

    /// Machine-readable kind label used in `data.kind` and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigInvalid { .. } => "config_invalid",
            Self::Unauthorized { .. } => "unauthorized",
            Self::Forbidden { .. } => "forbidden",
            Self::ParseError { .. } => "parse_error",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::MethodNotFound { .. } => "method_not_found",
            Self::InvalidParams { .. } => "invalid_params",
            Self::Internal { .. } => "internal",
            Self::BackendUnavailable { .. } | Self::BackendProtocol { .. } => {
                "backend_unavailable"
            }
            Self::RequestTimeout { .. } => "timeout",
            Self::ShuttingDown => "shutting_down",
            Self::RateLimited { .. } => "rate_limited",
        }
    }

    /// Owning backend, when the failure is attributable to one.
    pub fn backend_id(&self) -> Option<&str> {
        match self {
            Self::BackendUnavailable { backend_id, .. }
            | Self::RequestTimeout { backend_id, .. }
            | Self::BackendProtocol { backend_id, .. } => Some(backend_id),
            _ => None,
        }
    }

    /// Sanitized detail for the `data.detail` field.
    fn safe_detail(&self) -> Option<String> {
        match self {
            Self::BackendUnavailable { detail, .. } => Some(detail.clone()),
            Self::RequestTimeout { timeout_secs, .. } => {
                Some(format!("deadline of {timeout_secs}s exceeded"))
            }
            // Protocol violations are internal; don't leak the raw reason.
            Self::BackendProtocol { .. } => Some("backend restarting".to_string()),
            Self::ParseError { details }
            | Self::InvalidRequest { details }
            | Self::InvalidParams { details } => Some(details.clone()),
            Self::MethodNotFound { method } => Some(format!("method: {method}")),
            _ => None,
        }
    }

    /// Convert to a JSON-RPC error object.
    ///
    /// Gateway-specific failures carry `data: {kind, backendId, detail}`;
    /// standard protocol errors omit `data` unless a detail exists.
    pub fn to_jsonrpc_error(&self) -> JsonRpcError {
        let message = match self {
            // Protocol violations surface to callers as plain unavailability.
            Self::BackendProtocol { backend_id, .. } => {
                format!("backend '{backend_id}' unavailable")
            }
            other => other.to_string(),
        };
        JsonRpcError {
            code: self.jsonrpc_code(),
            message,
            data: Some(ErrorData {
                kind: self.kind().to_string(),
                backend_id: self.backend_id().map(String::from),
                detail: self.safe_detail(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_code_mapping() {
        assert_eq!(
            GatewayError::ParseError {
                details: "x".into()
            }
            .jsonrpc_code(),
            -32700
        );
        assert_eq!(
            GatewayError::InvalidRequest {
                details: "x".into()
            }
            .jsonrpc_code(),
            -32600
        );
        assert_eq!(
            GatewayError::MethodNotFound { method: "x".into() }.jsonrpc_code(),
            -32601
        );
        assert_eq!(
            GatewayError::InvalidParams {
                details: "x".into()
            }
            .jsonrpc_code(),
            -32602
        );
        assert_eq!(
            GatewayError::Internal {
                correlation_id: "x".into()
            }
            .jsonrpc_code(),
            -32603
        );
    }

    #[test]
    fn test_backend_unavailable_shape() {
        let err = GatewayError::BackendUnavailable {
            backend_id: "fs".into(),
            detail: "degraded".into(),
        };
        let rpc = err.to_jsonrpc_error();
        assert_eq!(rpc.code, -32603);
        let data = rpc.data.unwrap();
        assert_eq!(data.kind, "backend_unavailable");
        assert_eq!(data.backend_id.as_deref(), Some("fs"));
    }

    #[test]
    fn test_timeout_shape() {
        let err = GatewayError::RequestTimeout {
            backend_id: "fs".into(),
            timeout_secs: 30,
        };
        let rpc = err.to_jsonrpc_error();
        assert_eq!(rpc.code, -32603);
        assert_eq!(rpc.data.unwrap().kind, "timeout");
    }

    #[test]
    fn test_protocol_error_masked_as_unavailable() {
        let err = GatewayError::BackendProtocol {
            backend_id: "fs".into(),
            detail: "malformed json at byte 17 of /internal/path".into(),
        };
        let rpc = err.to_jsonrpc_error();
        let data = rpc.data.unwrap();
        assert_eq!(data.kind, "backend_unavailable");
        // The raw protocol detail must not leak to clients.
        assert!(!rpc.message.contains("/internal/path"));
        assert_eq!(data.detail.as_deref(), Some("backend restarting"));
    }

    #[test]
    fn test_data_field_is_camel_case() {
        let err = GatewayError::BackendUnavailable {
            backend_id: "fs".into(),
            detail: "d".into(),
        };
        let json = serde_json::to_value(err.to_jsonrpc_error()).unwrap();
        assert_eq!(json["data"]["backendId"], "fs");
        assert!(json["data"].get("backend_id").is_none());
    }
}
