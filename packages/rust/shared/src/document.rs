//! Layout of the documents schema items are merged into.
//!
//! ```json
//! {
//!   "rd_key": ["msg", "<id>"],
//!   "schemas": {
//!     "<ext_id>": {
//!       "<schema_id>": { "source": {..}, "fields": {..}, "rev": "..", "deps": [..] }
//!     }
//!   }
//! }
//! ```
//!
//! Checkpoint documents use the same envelope with no `schemas` and a `seq`.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{PipelineError, Result};
use crate::types::{DepKey, RdKey, SchemaItem, SourceRef, short_hash};

const REV_LEN: usize = 16;

/// One extension's instance of a schema inside a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaEntry {
    #[serde(default)]
    pub source: Option<SourceRef>,
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Content hash of `fields` and `confidence`.
    pub rev: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deps: Vec<DepKey>,
}

impl SchemaEntry {
    pub fn new(
        source: Option<SourceRef>,
        fields: Map<String, Value>,
        confidence: Option<f64>,
        deps: Vec<DepKey>,
    ) -> Self {
        let rev = content_rev(&fields, confidence);
        Self {
            source,
            fields,
            confidence,
            rev,
            deps,
        }
    }

    pub fn from_item(item: &SchemaItem) -> Self {
        let mut deps = item.deps.clone();
        deps.sort();
        deps.dedup();
        Self::new(item.source.clone(), item.fields.clone(), item.confidence, deps)
    }
}

/// Content revision of a schema entry; independent of where it came from.
pub fn content_rev(fields: &Map<String, Value>, confidence: Option<f64>) -> String {
    let canonical = serde_json::json!([fields, confidence]).to_string();
    short_hash(canonical.as_bytes(), REV_LEN)
}

/// A stored document holding every schema written under one rd_key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDocument {
    pub rd_key: RdKey,
    /// ext_id -> schema_id -> entry.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub schemas: BTreeMap<String, BTreeMap<String, SchemaEntry>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SchemaDocument {
    pub fn new(rd_key: RdKey) -> Self {
        Self {
            rd_key,
            schemas: BTreeMap::new(),
            extra: Map::new(),
        }
    }

    /// Parse a stored body.
    pub fn from_value(body: &Value) -> Result<Self> {
        serde_json::from_value(body.clone())
            .map_err(|e| PipelineError::validation(format!("malformed schema document: {e}")))
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn entry(&self, ext_id: &str, schema_id: &str) -> Option<&SchemaEntry> {
        self.schemas.get(ext_id).and_then(|m| m.get(schema_id))
    }

    /// Set this extension's instance of a schema, replacing any previous one.
    pub fn insert(&mut self, ext_id: &str, schema_id: &str, entry: SchemaEntry) {
        self.schemas
            .entry(ext_id.to_string())
            .or_default()
            .insert(schema_id.to_string(), entry);
    }

    /// Remove this extension's instance of a schema. Returns whether it existed.
    pub fn remove(&mut self, ext_id: &str, schema_id: &str) -> bool {
        let Some(by_schema) = self.schemas.get_mut(ext_id) else {
            return false;
        };
        let removed = by_schema.remove(schema_id).is_some();
        if by_schema.is_empty() {
            self.schemas.remove(ext_id);
        }
        removed
    }

    /// No schema entries left.
    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Every schema id present in the document.
    pub fn schema_ids(&self) -> BTreeSet<String> {
        self.schemas
            .values()
            .flat_map(|m| m.keys().cloned())
            .collect()
    }

    /// All `(ext_id, entry)` pairs contributing `schema_id`, lowest confidence first.
    pub fn contributions(&self, schema_id: &str) -> Vec<(&str, &SchemaEntry)> {
        let mut found: Vec<(&str, &SchemaEntry)> = self
            .schemas
            .iter()
            .filter_map(|(ext, m)| m.get(schema_id).map(|e| (ext.as_str(), e)))
            .collect();
        found.sort_by(|a, b| {
            let ca = a.1.confidence.unwrap_or(0.0);
            let cb = b.1.confidence.unwrap_or(0.0);
            ca.total_cmp(&cb).then_with(|| a.0.cmp(b.0))
        });
        found
    }

    /// Revision of one schema across all contributing extensions.
    ///
    /// Changes only when that schema's content changes, so writes of other
    /// schemas into the same document leave it untouched.
    pub fn schema_rev(&self, schema_id: &str) -> Option<String> {
        let parts = self.contributions(schema_id);
        if parts.is_empty() {
            return None;
        }
        let mut joined = String::new();
        for (ext, entry) in parts {
            joined.push_str(ext);
            joined.push('=');
            joined.push_str(&entry.rev);
            joined.push(';');
        }
        Some(short_hash(joined.as_bytes(), REV_LEN))
    }

    /// Fields of `schema_id` with higher-confidence contributions layered on top.
    pub fn merged_fields(&self, schema_id: &str) -> Option<Map<String, Value>> {
        let parts = self.contributions(schema_id);
        if parts.is_empty() {
            return None;
        }
        let mut merged = Map::new();
        for (_, entry) in parts {
            for (k, v) in &entry.fields {
                merged.insert(k.clone(), v.clone());
            }
        }
        Some(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn roundtrip_through_json() {
        let mut doc = SchemaDocument::new(RdKey::new("msg", "m1"));
        doc.insert(
            "e1",
            "rd.msg.body",
            SchemaEntry::new(
                Some(SourceRef::new("rk!msg!x", "rd.msg.rfc822", "abc")),
                fields(json!({"subject": "hi"})),
                None,
                vec![],
            ),
        );
        let value = doc.to_value().expect("to value");
        assert_eq!(value["rd_key"], json!(["msg", "m1"]));
        let back = SchemaDocument::from_value(&value).expect("parse");
        assert_eq!(back, doc);
    }

    #[test]
    fn checkpoint_body_parses() {
        let body = json!({"rd_key": ["ext", "q1"], "seq": 42});
        let doc = SchemaDocument::from_value(&body).expect("parse");
        assert!(doc.is_empty());
        assert_eq!(doc.extra["seq"], json!(42));
    }

    #[test]
    fn schema_rev_ignores_other_schemas() {
        let mut doc = SchemaDocument::new(RdKey::new("msg", "m1"));
        doc.insert(
            "raw",
            "rd.msg.rfc822",
            SchemaEntry::new(None, fields(json!({"a": 1})), None, vec![]),
        );
        let before = doc.schema_rev("rd.msg.rfc822");
        doc.insert(
            "e1",
            "rd.msg.body",
            SchemaEntry::new(None, fields(json!({"b": 2})), None, vec![]),
        );
        assert_eq!(doc.schema_rev("rd.msg.rfc822"), before);
        assert!(doc.schema_rev("rd.msg.body").is_some());
        assert!(doc.schema_rev("rd.msg.seen").is_none());
    }

    #[test]
    fn schema_rev_follows_content() {
        let mut doc = SchemaDocument::new(RdKey::new("msg", "m1"));
        doc.insert("e1", "s", SchemaEntry::new(None, fields(json!({"a": 1})), None, vec![]));
        let first = doc.schema_rev("s");
        doc.insert("e1", "s", SchemaEntry::new(None, fields(json!({"a": 2})), None, vec![]));
        assert_ne!(doc.schema_rev("s"), first);
    }

    #[test]
    fn merge_prefers_confident_contribution() {
        let mut doc = SchemaDocument::new(RdKey::new("msg", "m1"));
        doc.insert(
            "low",
            "s",
            SchemaEntry::new(None, fields(json!({"a": 1, "b": 1})), Some(0.1), vec![]),
        );
        doc.insert("high", "s", SchemaEntry::new(None, fields(json!({"a": 9})), Some(0.9), vec![]));
        let merged = doc.merged_fields("s").expect("merged");
        assert_eq!(merged["a"], json!(9));
        assert_eq!(merged["b"], json!(1));
    }

    #[test]
    fn remove_prunes_empty_extension() {
        let mut doc = SchemaDocument::new(RdKey::new("msg", "m1"));
        doc.insert("e1", "s", SchemaEntry::new(None, Map::new(), None, vec![]));
        assert!(doc.remove("e1", "s"));
        assert!(!doc.remove("e1", "s"));
        assert!(doc.is_empty());
    }
}
