//! Aggregate catalog: the merged view of every ready backend's tools,
//! resources, and prompts.
//!
//! Snapshots are immutable once built. The registry rebuilds one whenever a
//! backend becomes ready or drops out and swaps it atomically; dispatch
//! always sees a consistent snapshot.
//!
//! Collision policy: the merge walks backends in config declaration order
//! and the first declaration of a key wins. Later duplicates land in the
//! shadow list, which is visible through the admin surface but never to
//! clients.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

/// Per-backend catalog captured from its `initialize` and `*/list` responses.
#[derive(Debug, Clone, Default)]
pub struct BackendCatalog {
    /// Capability object from the backend's `initialize` result.
    pub capabilities: Value,
    /// Raw tool records (`tools/list`), opaque to the gateway.
    pub tools: Vec<Value>,
    /// Raw resource records (`resources/list`).
    pub resources: Vec<Value>,
    /// Raw resource template records (`resources/templates/list`).
    pub resource_templates: Vec<Value>,
    /// Raw prompt records (`prompts/list`).
    pub prompts: Vec<Value>,
}

/// A primary catalog entry: the record plus its owning backend.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub backend_id: String,
    pub record: Value,
}

/// An entry suppressed by an earlier same-named entry from another backend.
#[derive(Debug, Clone, Serialize)]
pub struct ShadowedEntry {
    /// `tool`, `resource`, or `prompt`.
    pub kind: &'static str,
    /// The colliding key (tool name, resource URI, or prompt name).
    pub key: String,
    /// Backend whose entry was suppressed.
    pub backend_id: String,
    /// Backend that owns the winning entry.
    pub shadowed_by: String,
}

#[derive(Debug, Default)]
struct KeyedSet {
    entries: Vec<CatalogEntry>,
    index: HashMap<String, usize>,
}

impl KeyedSet {
    fn insert(
        &mut self,
        kind: &'static str,
        key_field: &str,
        backend_id: &str,
        record: &Value,
        shadowed: &mut Vec<ShadowedEntry>,
    ) {
        let Some(key) = record.get(key_field).and_then(|v| v.as_str()) else {
            tracing::warn!(backend_id, kind, "catalog record missing '{key_field}', skipping");
            return;
        };
        if let Some(&winner) = self.index.get(key) {
            let shadowed_by = self.entries[winner].backend_id.clone();
            tracing::warn!(
                backend_id,
                kind,
                key,
                shadowed_by = %shadowed_by,
                "catalog collision, first declaration wins"
            );
            shadowed.push(ShadowedEntry {
                kind,
                key: key.to_string(),
                backend_id: backend_id.to_string(),
                shadowed_by,
            });
            return;
        }
        self.index.insert(key.to_string(), self.entries.len());
        self.entries.push(CatalogEntry {
            backend_id: backend_id.to_string(),
            record: record.clone(),
        });
    }

    fn get(&self, key: &str) -> Option<&CatalogEntry> {
        self.index.get(key).map(|&i| &self.entries[i])
    }

    fn records(&self) -> Vec<Value> {
        self.entries.iter().map(|e| e.record.clone()).collect()
    }
}

/// An immutable, atomically published view of the merged catalog.
#[derive(Debug, Default)]
pub struct CatalogSnapshot {
    tools: KeyedSet,
    resources: KeyedSet,
    prompts: KeyedSet,
    resource_templates: Vec<CatalogEntry>,
    shadowed: Vec<ShadowedEntry>,
    capabilities: Vec<Value>,
}

impl CatalogSnapshot {
    /// Ordered merge over `(backend_id, catalog)` pairs in declaration order.
    pub fn build<'a>(parts: impl Iterator<Item = (&'a str, BackendCatalog)>) -> Self {
        let mut snapshot = CatalogSnapshot::default();
        for (backend_id, catalog) in parts {
            for record in &catalog.tools {
                snapshot.tools.insert(
                    "tool",
                    "name",
                    backend_id,
                    record,
                    &mut snapshot.shadowed,
                );
            }
            for record in &catalog.resources {
                snapshot.resources.insert(
                    "resource",
                    "uri",
                    backend_id,
                    record,
                    &mut snapshot.shadowed,
                );
            }
            for record in &catalog.prompts {
                snapshot.prompts.insert(
                    "prompt",
                    "name",
                    backend_id,
                    record,
                    &mut snapshot.shadowed,
                );
            }
            for record in &catalog.resource_templates {
                snapshot.resource_templates.push(CatalogEntry {
                    backend_id: backend_id.to_string(),
                    record: record.clone(),
                });
            }
            if catalog.capabilities.is_object() {
                snapshot.capabilities.push(catalog.capabilities.clone());
            }
        }
        snapshot
    }

    /// Owning entry for a tool name.
    pub fn tool_owner(&self, name: &str) -> Option<&CatalogEntry> {
        self.tools.get(name)
    }

    /// Owning entry for a resource URI.
    pub fn resource_owner(&self, uri: &str) -> Option<&CatalogEntry> {
        self.resources.get(uri)
    }

    /// Owning entry for a prompt name.
    pub fn prompt_owner(&self, name: &str) -> Option<&CatalogEntry> {
        self.prompts.get(name)
    }

    /// Primary tool records in merge order.
    pub fn tool_records(&self) -> Vec<Value> {
        self.tools.records()
    }

    /// Primary resource records in merge order.
    pub fn resource_records(&self) -> Vec<Value> {
        self.resources.records()
    }

    /// Primary prompt records in merge order.
    pub fn prompt_records(&self) -> Vec<Value> {
        self.prompts.records()
    }

    /// Resource template records, concatenated in merge order.
    pub fn resource_template_records(&self) -> Vec<Value> {
        self.resource_templates
            .iter()
            .map(|e| e.record.clone())
            .collect()
    }

    /// Capability objects from every contributing backend.
    pub fn capabilities(&self) -> &[Value] {
        &self.capabilities
    }

    /// Shadowed entries, for the admin surface.
    pub fn shadowed(&self) -> &[ShadowedEntry] {
        &self.shadowed
    }

    /// Number of primary tools owned by the given backend.
    pub fn tool_count_for(&self, backend_id: &str) -> usize {
        self.tools
            .entries
            .iter()
            .filter(|e| e.backend_id == backend_id)
            .count()
    }

    /// Total primary tool count.
    pub fn tool_count(&self) -> usize {
        self.tools.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn catalog_with_tools(tools: Vec<Value>) -> BackendCatalog {
        BackendCatalog {
            tools,
            ..Default::default()
        }
    }

    #[test]
    fn test_merge_disjoint_tools() {
        let a = catalog_with_tools(vec![json!({"name": "a.one"})]);
        let b = catalog_with_tools(vec![json!({"name": "b.two"})]);
        let snap = CatalogSnapshot::build([("a", a), ("b", b)].into_iter());
        assert_eq!(snap.tool_count(), 2);
        assert_eq!(snap.tool_owner("a.one").unwrap().backend_id, "a");
        assert_eq!(snap.tool_owner("b.two").unwrap().backend_id, "b");
        assert!(snap.shadowed().is_empty());
    }

    #[test]
    fn test_collision_first_declared_wins() {
        let a = catalog_with_tools(vec![json!({"name": "fs.read", "description": "from a"})]);
        let b = catalog_with_tools(vec![json!({"name": "fs.read", "description": "from b"})]);
        let snap = CatalogSnapshot::build([("a", a), ("b", b)].into_iter());

        assert_eq!(snap.tool_count(), 1);
        let winner = snap.tool_owner("fs.read").unwrap();
        assert_eq!(winner.backend_id, "a");
        assert_eq!(winner.record["description"], "from a");

        assert_eq!(snap.shadowed().len(), 1);
        let shadow = &snap.shadowed()[0];
        assert_eq!(shadow.backend_id, "b");
        assert_eq!(shadow.shadowed_by, "a");
        assert_eq!(shadow.key, "fs.read");
    }

    #[test]
    fn test_collision_order_deterministic() {
        // Same catalogs, same declaration order, same outcome, every time.
        for _ in 0..3 {
            let a = catalog_with_tools(vec![json!({"name": "t"})]);
            let b = catalog_with_tools(vec![json!({"name": "t"})]);
            let snap = CatalogSnapshot::build([("first", a), ("second", b)].into_iter());
            assert_eq!(snap.tool_owner("t").unwrap().backend_id, "first");
        }
    }

    #[test]
    fn test_resources_keyed_by_uri() {
        let a = BackendCatalog {
            resources: vec![json!({"uri": "file:///tmp/a", "name": "A"})],
            ..Default::default()
        };
        let snap = CatalogSnapshot::build([("a", a)].into_iter());
        assert!(snap.resource_owner("file:///tmp/a").is_some());
        assert!(snap.resource_owner("file:///tmp/b").is_none());
    }

    #[test]
    fn test_record_without_key_skipped() {
        let a = catalog_with_tools(vec![json!({"description": "nameless"})]);
        let snap = CatalogSnapshot::build([("a", a)].into_iter());
        assert_eq!(snap.tool_count(), 0);
    }

    #[test]
    fn test_capabilities_collected() {
        let a = BackendCatalog {
            capabilities: json!({"tools": {"listChanged": true}}),
            ..Default::default()
        };
        let b = BackendCatalog {
            capabilities: json!({"prompts": {}}),
            ..Default::default()
        };
        let snap = CatalogSnapshot::build([("a", a), ("b", b)].into_iter());
        assert_eq!(snap.capabilities().len(), 2);
    }

    #[test]
    fn test_tool_count_per_backend() {
        let a = catalog_with_tools(vec![json!({"name": "x"}), json!({"name": "y"})]);
        let b = catalog_with_tools(vec![json!({"name": "z"})]);
        let snap = CatalogSnapshot::build([("a", a), ("b", b)].into_iter());
        assert_eq!(snap.tool_count_for("a"), 2);
        assert_eq!(snap.tool_count_for("b"), 1);
    }
}
