//! Per-invocation context handed to extension handlers.
//!
//! A context is created for exactly one handler call and owned by it, so two
//! calls never share an emit buffer. Everything the handler emits stays in
//! the context until the processor collects it with [`ExtensionContext::finish`].

use std::collections::BTreeSet;

use serde_json::{Map, Value};

use schemaflow_shared::{
    Attachment, DepKey, PipelineError, RdKey, Result, SchemaItem, SourceRef,
};
use schemaflow_storage::{ViewQuery, ViewRow};

use crate::model::{DocModel, SourceDocument};
use crate::registry::Extension;

/// What one invocation produced.
#[derive(Debug, Default)]
pub struct Emission {
    pub items: Vec<SchemaItem>,
    /// The handler read from the store while running.
    pub did_query: bool,
    /// Tokens deferred to the batch-end later handler.
    pub deferred: Vec<Value>,
}

pub struct ExtensionContext<'a> {
    model: &'a DocModel,
    ext: &'a Extension,
    source: Option<&'a SourceDocument>,
    items: Vec<SchemaItem>,
    did_query: bool,
    deps: BTreeSet<DepKey>,
    deferred: Vec<Value>,
}

impl<'a> ExtensionContext<'a> {
    pub fn new(
        model: &'a DocModel,
        ext: &'a Extension,
        source: Option<&'a SourceDocument>,
    ) -> Self {
        Self {
            model,
            ext,
            source,
            items: Vec::new(),
            did_query: false,
            deps: BTreeSet::new(),
            deferred: Vec::new(),
        }
    }

    pub fn ext_id(&self) -> &str {
        &self.ext.id
    }

    pub fn source(&self) -> Option<&SourceDocument> {
        self.source
    }

    fn require_source(&self) -> Result<&'a SourceDocument> {
        self.source.ok_or_else(|| {
            PipelineError::extension(&self.ext.id, "no source document in this phase; use emit_for")
        })
    }

    // -----------------------------------------------------------------------
    // Emission
    // -----------------------------------------------------------------------

    /// Emit a schema under the source's rd_key. Returns the target document id.
    pub fn emit(&mut self, schema_id: &str, fields: Map<String, Value>) -> Result<String> {
        let source = self.require_source()?;
        Ok(self.push(source.rd_key.clone(), schema_id, fields, Some(source.source_ref())))
    }

    /// Emit a schema under another rd_key, derived from the current source.
    pub fn emit_keyed(
        &mut self,
        rd_key: RdKey,
        schema_id: &str,
        fields: Map<String, Value>,
    ) -> Result<String> {
        let source = self.require_source()?;
        Ok(self.push(rd_key, schema_id, fields, Some(source.source_ref())))
    }

    /// Emit on behalf of an explicit source; used by later handlers.
    pub fn emit_for(
        &mut self,
        source: SourceRef,
        rd_key: RdKey,
        schema_id: &str,
        fields: Map<String, Value>,
    ) -> String {
        self.push(rd_key, schema_id, fields, Some(source))
    }

    /// Attach binary data to an item emitted earlier in this call.
    pub fn attach(&mut self, doc_id: &str, name: &str, attachment: Attachment) -> Result<()> {
        let ext: &Extension = self.ext;
        let item = self
            .items
            .iter_mut()
            .rev()
            .find(|i| i.doc_id() == doc_id)
            .ok_or_else(|| {
                PipelineError::extension(&ext.id, format!("attach to unknown document {doc_id}"))
            })?;
        item.attachments.insert(name.to_string(), attachment);
        Ok(())
    }

    fn push(
        &mut self,
        rd_key: RdKey,
        schema_id: &str,
        fields: Map<String, Value>,
        source: Option<SourceRef>,
    ) -> String {
        let mut item = SchemaItem::new(rd_key, schema_id, &self.ext.id, fields);
        item.source = source;
        item.confidence = self.ext.confidence;
        let doc_id = item.doc_id();

        // One instance of a schema per extension per document: last emit wins.
        self.items
            .retain(|i| !(i.doc_id() == doc_id && i.schema_id == item.schema_id));
        self.items.push(item);
        doc_id
    }

    /// Defer `token` to the later handler; normal emission for this call is
    /// discarded.
    pub fn process_later(&mut self, token: Value) {
        self.deferred.push(token);
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn query(&mut self, query: &ViewQuery) -> Result<Vec<ViewRow>> {
        self.did_query = true;
        self.model.query(query).await
    }

    /// Read another schema's merged fields. Recorded as a dependency when the
    /// extension tracks them.
    pub async fn open_schema(
        &mut self,
        doc_id: &str,
        schema_id: &str,
    ) -> Result<Option<Map<String, Value>>> {
        self.did_query = true;
        if self.ext.uses_dependencies {
            self.deps.insert(DepKey(doc_id.to_string(), schema_id.to_string()));
        }
        self.model.open_schema(doc_id, schema_id).await
    }

    pub async fn open_attachment(
        &mut self,
        doc_id: &str,
        name: &str,
    ) -> Result<Option<Attachment>> {
        self.model.open_attachment(doc_id, name).await
    }

    pub async fn current_source(
        &mut self,
        doc_id: &str,
        schema_id: &str,
    ) -> Result<Option<SourceRef>> {
        self.did_query = true;
        self.model.current_source(doc_id, schema_id).await
    }

    /// Close the context, stamping recorded dependencies onto every item.
    pub fn finish(self) -> Emission {
        let deps: Vec<DepKey> = self.deps.into_iter().collect();
        let mut items = self.items;
        if !deps.is_empty() {
            for item in &mut items {
                item.deps = deps.clone();
            }
        }
        Emission {
            items,
            did_query: self.did_query,
            deferred: self.deferred,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use schemaflow_shared::ExtensionCategory;
    use schemaflow_storage::LibsqlStore;
    use serde_json::json;
    use uuid::Uuid;

    use crate::registry::ExtensionHandler;

    struct Noop;

    #[async_trait]
    impl ExtensionHandler for Noop {
        async fn handle(&self, _: &SourceDocument, _: &mut ExtensionContext<'_>) -> Result<()> {
            Ok(())
        }
    }

    async fn model() -> DocModel {
        let tmp = std::env::temp_dir().join(format!("sf_test_{}.db", Uuid::now_v7()));
        let store = LibsqlStore::open(&tmp).await.expect("open");
        DocModel::new(Arc::new(store), 50)
    }

    fn source() -> SourceDocument {
        let rd_key = RdKey::new("msg", "m1");
        SourceDocument {
            doc_id: rd_key.doc_id(),
            doc_rev: "1-a".into(),
            rd_key,
            schema_id: "rd.msg.rfc822".into(),
            rev: "abc".into(),
            fields: Map::new(),
            contributors: vec!["rd.core.raw".into()],
            attachments: Vec::new(),
        }
    }

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn emit_defaults_to_source_key() {
        let model = model().await;
        let ext = Extension::new(
            "e",
            ExtensionCategory::Provider,
            vec!["rd.msg.rfc822".into()],
            Arc::new(Noop),
        )
        .with_confidence(0.5);
        let src = source();
        let mut ctx = ExtensionContext::new(&model, &ext, Some(&src));

        let doc_id = ctx.emit("rd.msg.body", obj(json!({"a": 1}))).expect("emit");
        assert_eq!(doc_id, src.doc_id);
        ctx.emit("rd.msg.body", obj(json!({"a": 2}))).expect("emit again");
        ctx.emit_keyed(RdKey::new("conv", "c1"), "rd.conv.summary", Map::new())
            .expect("keyed");

        let out = ctx.finish();
        assert_eq!(out.items.len(), 2);
        assert_eq!(out.items[0].fields.get("a"), Some(&json!(2)));
        assert_eq!(out.items[0].confidence, Some(0.5));
        assert_eq!(out.items[1].source, Some(src.source_ref()));
        assert!(!out.did_query);
    }

    #[tokio::test]
    async fn reads_record_dependencies() {
        let model = model().await;
        let ext = Extension::new("e", ExtensionCategory::Extender, vec!["s".into()], Arc::new(Noop))
            .with_dependencies();
        let src = source();
        let mut ctx = ExtensionContext::new(&model, &ext, Some(&src));

        assert!(ctx.open_schema("rk!msg!x", "rd.msg.body").await.expect("read").is_none());
        ctx.emit("out", Map::new()).expect("emit");
        let out = ctx.finish();
        assert!(out.did_query);
        assert_eq!(out.items[0].deps, vec![DepKey("rk!msg!x".into(), "rd.msg.body".into())]);
    }

    #[tokio::test]
    async fn later_phase_needs_explicit_source() {
        let model = model().await;
        let ext = Extension::new("e", ExtensionCategory::Smart, vec!["s".into()], Arc::new(Noop));
        let mut ctx = ExtensionContext::new(&model, &ext, None);
        assert!(ctx.emit("out", Map::new()).is_err());

        let src = source();
        let doc_id = ctx.emit_for(src.source_ref(), RdKey::new("msg", "m2"), "out", Map::new());
        ctx.attach(&doc_id, "blob", Attachment::new("text/plain", b"x".to_vec()))
            .expect("attach");
        ctx.process_later(json!(1));
        let out = ctx.finish();
        assert_eq!(out.items[0].attachments.len(), 1);
        assert_eq!(out.deferred, vec![json!(1)]);
    }
}
