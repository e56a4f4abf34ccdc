//! MCP protocol constants and capability handling.
//!
//! Method names are split into two sets: the handful the gateway answers
//! itself, and the namespaced set it routes to an owning backend. Anything
//! outside both sets is a method-not-found at dispatch.

use serde_json::{Map, Value, json};

/// MCP protocol revision the gateway declares to clients and backends.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Server name reported in `initialize` responses.
pub const SERVER_NAME: &str = "switchboard";

/// Server version reported in `initialize` responses.
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

// Methods handled locally by the gateway core.
pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_PING: &str = "ping";
pub const METHOD_TOOLS_LIST: &str = "tools/list";
pub const METHOD_RESOURCES_LIST: &str = "resources/list";
pub const METHOD_RESOURCE_TEMPLATES_LIST: &str = "resources/templates/list";
pub const METHOD_PROMPTS_LIST: &str = "prompts/list";

// Methods routed to the owning backend.
pub const METHOD_TOOLS_CALL: &str = "tools/call";
pub const METHOD_RESOURCES_READ: &str = "resources/read";
pub const METHOD_RESOURCES_SUBSCRIBE: &str = "resources/subscribe";
pub const METHOD_PROMPTS_GET: &str = "prompts/get";

/// Prefix for server- and client-initiated notifications.
pub const NOTIFICATION_PREFIX: &str = "notifications/";

/// True for `notifications/*` methods (including the bare `initialized`
/// handshake notification some clients send without the prefix).
pub fn is_notification_method(method: &str) -> bool {
    method.starts_with(NOTIFICATION_PREFIX) || method == "initialized"
}

/// Build the gateway's `initialize` result from the union of backend
/// capabilities.
///
/// The union is a shallow merge: a capability section (`tools`, `resources`,
/// `prompts`, `logging`, ...) is present if any backend declared it, and
/// sections with the same key are object-merged so flags like `listChanged`
/// survive from whichever backend set them.
pub fn initialize_result(capability_sets: &[Value]) -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "serverInfo": {
            "name": SERVER_NAME,
            "version": SERVER_VERSION,
        },
        "capabilities": merge_capabilities(capability_sets),
    })
}

/// Shallow-merge capability objects from all ready backends.
pub fn merge_capabilities(capability_sets: &[Value]) -> Value {
    let mut merged: Map<String, Value> = Map::new();
    for caps in capability_sets {
        let Some(obj) = caps.as_object() else {
            continue;
        };
        for (section, flags) in obj {
            if let Some(Value::Object(existing)) = merged.get_mut(section) {
                if let Some(incoming) = flags.as_object() {
                    for (k, v) in incoming {
                        existing.entry(k.clone()).or_insert_with(|| v.clone());
                    }
                }
                continue;
            }
            if !merged.contains_key(section) {
                merged.insert(section.clone(), flags.clone());
            }
        }
    }
    Value::Object(merged)
}
