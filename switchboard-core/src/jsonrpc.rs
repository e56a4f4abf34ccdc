//! JSON-RPC 2.0 wire types and request parsing.
//!
//! The gateway speaks JSON-RPC 2.0 on both sides: HTTP bodies from clients
//! and NDJSON lines from backend child processes. This module holds the
//! shared wire types and [`parse_request`], the entry point for untrusted
//! HTTP bodies. Backend-side line parsing lives with the stdio framing in
//! the server crate, which classifies messages as it extracts them.
//!
//! # JSON-RPC 2.0 Compliance
//!
//! - Requests have `id`, `method`, and optional `params`
//! - Notifications are requests without `id`
//! - `id` type (string, integer, or null) MUST be preserved in responses
//! - Batch arrays are rejected: MCP does not support them

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Instant;
use uuid::Uuid;

use crate::error::GatewayError;

/// JSON-RPC 2.0 version constant.
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 request ID.
///
/// The protocol allows string or integer IDs, and the exact type must
/// survive the round trip: if the client sends `"id": 1`, the response says
/// `"id": 1`, never `"id": "1"`. The untagged serde representation writes
/// each variant as its bare JSON form.
///
/// `"id": null` is valid (though unusual) and distinct from a missing `id`,
/// which marks a notification. [`parse_request`] keeps that distinction by
/// inspecting the raw object rather than deserializing through `Option`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcId {
    /// Integer ID (e.g., `"id": 1`)
    Number(i64),
    /// String ID (e.g., `"id": "abc-123"`)
    String(String),
    /// Explicit null ID
    Null,
}

impl JsonRpcId {
    /// Read an id out of a raw JSON value.
    ///
    /// Strings, integers, and null are legal ids; floats, booleans, and
    /// containers are not and yield `None`.
    pub fn from_value(value: &Value) -> Option<JsonRpcId> {
        match value {
            Value::String(s) => Some(JsonRpcId::String(s.clone())),
            Value::Number(n) => n.as_i64().map(JsonRpcId::Number),
            Value::Null => Some(JsonRpcId::Null),
            _ => None,
        }
    }
}

impl std::fmt::Display for JsonRpcId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JsonRpcId::Number(n) => write!(f, "{n}"),
            JsonRpcId::String(s) => write!(f, "{s}"),
            JsonRpcId::Null => write!(f, "null"),
        }
    }
}

/// Validated inbound JSON-RPC request with gateway tracking metadata.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    /// Original JSON-RPC ID (None for notifications).
    pub id: Option<JsonRpcId>,
    /// Method name.
    pub method: String,
    /// Method parameters, opaque to the gateway.
    pub params: Option<Value>,
    /// Timestamp when the request was received.
    pub received_at: Instant,
    /// Unique correlation ID for log tracing.
    pub correlation_id: Uuid,
}

impl GatewayRequest {
    /// Returns true if this is a notification (no ID).
    ///
    /// Notifications do not receive responses per JSON-RPC 2.0; the gateway
    /// still processes their side effects.
    #[inline]
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Always "2.0"
    pub jsonrpc: String,
    /// Request ID, echoed verbatim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<JsonRpcId>,
    /// Result (mutually exclusive with error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error (mutually exclusive with result).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<crate::error::JsonRpcError>,
}

impl JsonRpcResponse {
    /// Create a success response echoing the request ID.
    pub fn success(id: Option<JsonRpcId>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response. `id` may be None when parsing failed before
    /// an ID could be extracted.
    pub fn error(id: Option<JsonRpcId>, error: crate::error::JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Create an error response carrying a raw backend error object verbatim.
    ///
    /// Backend `tools/call` errors pass through the gateway untouched; this
    /// constructor avoids re-shaping a backend's error into the gateway's own
    /// error format.
    pub fn raw_error(id: Option<JsonRpcId>, error: Value) -> Value {
        serde_json::json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": id,
            "error": error,
        })
    }
}

/// Parse JSON bytes into a single JSON-RPC 2.0 request.
///
/// Works directly on the parsed object so an absent `id` (notification) and
/// an explicit `"id": null` stay distinguishable.
///
/// # Errors
///
/// - [`GatewayError::ParseError`] (-32700) for malformed JSON
/// - [`GatewayError::InvalidRequest`] (-32600) for structurally invalid
///   JSON-RPC, including batch arrays (MCP forbids batches)
pub fn parse_request(bytes: &[u8]) -> Result<GatewayRequest, GatewayError> {
    let value: Value = serde_json::from_slice(bytes).map_err(|e| GatewayError::ParseError {
        details: format!("invalid JSON: {e}"),
    })?;

    if value.is_array() {
        return Err(GatewayError::InvalidRequest {
            details: "batch requests are not supported".to_string(),
        });
    }
    let Value::Object(mut obj) = value else {
        return Err(GatewayError::InvalidRequest {
            details: "request must be a JSON object".to_string(),
        });
    };

    match obj.get("jsonrpc").and_then(|v| v.as_str()) {
        Some(JSONRPC_VERSION) => {}
        Some(other) => {
            return Err(GatewayError::InvalidRequest {
                details: format!("invalid jsonrpc version: expected \"2.0\", got \"{other}\""),
            });
        }
        None => {
            return Err(GatewayError::InvalidRequest {
                details: "missing required field: jsonrpc".to_string(),
            });
        }
    }

    let id = match obj.get("id") {
        None => None,
        Some(raw) => Some(JsonRpcId::from_value(raw).ok_or_else(|| {
            GatewayError::InvalidRequest {
                details: "id must be a string, integer, or null".to_string(),
            }
        })?),
    };

    let method = match obj.get("method").and_then(|v| v.as_str()) {
        Some(m) => m.to_string(),
        None => {
            return Err(GatewayError::InvalidRequest {
                details: "missing required field: method".to_string(),
            });
        }
    };

    Ok(GatewayRequest {
        id,
        method,
        params: obj.remove("params"),
        received_at: Instant::now(),
        correlation_id: Uuid::new_v4(),
    })
}
