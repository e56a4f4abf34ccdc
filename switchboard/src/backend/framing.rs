//! NDJSON framing for the backend stdio transport.
//!
//! Each line on a backend's stdin/stdout is one complete JSON-RPC 2.0
//! message. [`parse_backend_line`] takes a line from version check to
//! classified message in one pass: a message with an `id` and no `method`
//! is a response whose result or error is pulled out for the pending table;
//! anything carrying a `method` is server-initiated and forwarded whole.
//! No read loops live here; the adapter's reader task calls
//! [`bounded_read_line`] and [`parse_backend_line`] per line.

use serde_json::Value;
use switchboard_core::jsonrpc::{JSONRPC_VERSION, JsonRpcId};

/// Maximum NDJSON line size (8 MiB).
///
/// Enforced on raw byte length before JSON parsing so a misbehaving backend
/// cannot force allocation of an oversized `serde_json::Value` tree.
pub const MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

/// Errors from reading or parsing a single NDJSON line.
///
/// Any of these (other than an empty line, which the reader skips) is a
/// protocol violation and triggers a backend restart.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    /// A single line exceeds [`MAX_LINE_BYTES`].
    #[error("line exceeds maximum size of {max_bytes} bytes")]
    LineTooLong { max_bytes: usize },

    /// The line is not valid JSON or is structurally invalid for JSON-RPC.
    #[error("malformed JSON: {reason}")]
    MalformedJson { reason: String },

    /// The `jsonrpc` field is missing or not `"2.0"`.
    #[error("missing or unsupported jsonrpc version")]
    BadVersion,

    /// The line is a JSON array; MCP forbids batch messages.
    #[error("batch messages are not supported")]
    UnsupportedBatch,

    /// Underlying IO failure on the child's stdout.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FramingError {
    fn malformed(reason: &str) -> Self {
        FramingError::MalformedJson {
            reason: reason.to_string(),
        }
    }
}

/// The reply half of a completed backend call.
///
/// Results and errors are carried verbatim: the gateway returns whatever the
/// backend produced without re-shaping it.
#[derive(Debug, Clone)]
pub enum BackendReply {
    /// The backend's `result` value.
    Result(Value),
    /// The backend's raw `error` object.
    Error(Value),
}

/// A parsed line from a backend's stdout.
#[derive(Debug)]
pub enum BackendMessage {
    /// A response correlated to an outbound request by id.
    Reply { id: JsonRpcId, reply: BackendReply },
    /// A server-initiated request or notification, forwarded to session
    /// fan-out with the original value intact.
    ServerInitiated { method: String, raw: Value },
}

/// Parse one NDJSON line from a backend.
///
/// Size check, JSON parse, batch rejection, version check, then
/// classification by field presence, all in one pass over the object.
pub fn parse_backend_line(line: &str) -> Result<BackendMessage, FramingError> {
    if line.len() > MAX_LINE_BYTES {
        return Err(FramingError::LineTooLong {
            max_bytes: MAX_LINE_BYTES,
        });
    }

    let value: Value =
        serde_json::from_str(line.trim()).map_err(|e| FramingError::MalformedJson {
            reason: e.to_string(),
        })?;

    if value.is_array() {
        return Err(FramingError::UnsupportedBatch);
    }
    let Value::Object(mut obj) = value else {
        return Err(FramingError::malformed("message is not a JSON object"));
    };

    if obj.get("jsonrpc").and_then(|v| v.as_str()) != Some(JSONRPC_VERSION) {
        return Err(FramingError::BadVersion);
    }

    let id = match obj.get("id") {
        None => None,
        Some(raw) => Some(
            JsonRpcId::from_value(raw).ok_or_else(|| FramingError::malformed("invalid id field"))?,
        ),
    };

    // A `method` marks a server-initiated request or notification; either
    // way the whole message is forwarded, so it stays assembled.
    if let Some(method) = obj.get("method").and_then(|v| v.as_str()) {
        let method = method.to_string();
        return Ok(BackendMessage::ServerInitiated {
            method,
            raw: Value::Object(obj),
        });
    }

    // No method: this must be a response to one of our requests.
    let Some(id) = id else {
        return Err(FramingError::malformed("message has neither id nor method"));
    };
    let reply = match obj.remove("error") {
        Some(error) if !error.is_null() => BackendReply::Error(error),
        _ => BackendReply::Result(obj.remove("result").unwrap_or(Value::Null)),
    };
    Ok(BackendMessage::Reply { id, reply })
}

/// Read a single line from an async buffered reader, enforcing a byte limit.
///
/// Unlike bare `read_line`, this will not accumulate unbounded memory if the
/// child streams bytes without a newline. Raw bytes go into a `Vec<u8>` so
/// multi-byte UTF-8 sequences straddling internal buffer boundaries survive;
/// the caller converts after the full line is assembled.
///
/// # Returns
///
/// - `Ok(n)` with `n > 0`: a complete line (newline included) is in `buf`
/// - `Ok(0)`: EOF
/// - `Err(FramingError::LineTooLong)`: limit exceeded before a newline
pub async fn bounded_read_line<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max_bytes: usize,
) -> Result<usize, FramingError> {
    use tokio::io::AsyncBufReadExt;

    let mut total = 0usize;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(total);
        }

        match available.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let to_consume = pos + 1;
                if total + to_consume > max_bytes {
                    reader.consume(to_consume);
                    return Err(FramingError::LineTooLong { max_bytes });
                }
                buf.extend_from_slice(&available[..to_consume]);
                total += to_consume;
                reader.consume(to_consume);
                return Ok(total);
            }
            None => {
                let len = available.len();
                if total + len > max_bytes {
                    reader.consume(len);
                    return Err(FramingError::LineTooLong { max_bytes });
                }
                buf.extend_from_slice(available);
                total += len;
                reader.consume(len);
            }
        }
    }
}
