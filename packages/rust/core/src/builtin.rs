//! Built-in extensions for RFC 822 messages.
//!
//! Enough of a message pipeline to exercise every extension category:
//! two providers splitting a raw message into body and conversation facts,
//! an extender summarising conversations from what it reads, and a smart
//! extension that aggregates attachments once per batch.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Map, Value, json};

use schemaflow_shared::{
    Attachment, ExtensionCategory, ExtensionDescriptor, PipelineError, RawDocument, RdKey, Result,
    SourceRef, short_hash,
};
use schemaflow_storage::ViewQuery;

use crate::model::SourceDocument;
use crate::registry::{ExtensionHandler, HandlerCatalog, LaterHandler};
use crate::runtime::ExtensionContext;

pub const RFC822_SCHEMA: &str = "rd.msg.rfc822";
pub const BODY_SCHEMA: &str = "rd.msg.body";
pub const CONVERSATION_SCHEMA: &str = "rd.msg.conversation";
pub const CONV_SUMMARY_SCHEMA: &str = "rd.conv.summary";
pub const ATTACHMENT_SCHEMA: &str = "rd.msg.attachment";
pub const ATTACHMENT_SUMMARY_SCHEMA: &str = "rd.msg.attachment-summary";

/// Attachment name holding the raw message bytes.
pub const RFC822_ATTACHMENT: &str = "rfc822";

const PREVIEW_CHARS: usize = 140;

// ---------------------------------------------------------------------------
// RFC 822 parsing
// ---------------------------------------------------------------------------

/// A header block and the bytes after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimePart {
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl MimePart {
    /// First header with `name`, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Lower-cased media type, `text/plain` when absent.
    pub fn content_type(&self) -> String {
        self.header("Content-Type")
            .and_then(|v| v.split(';').next())
            .map(|t| t.trim().to_ascii_lowercase())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "text/plain".to_string())
    }

    /// Parameter `key` of header `name`, unquoted.
    pub fn param(&self, name: &str, key: &str) -> Option<String> {
        self.header(name)?.split(';').skip(1).find_map(|p| {
            let (k, v) = p.split_once('=')?;
            k.trim()
                .eq_ignore_ascii_case(key)
                .then(|| v.trim().trim_matches('"').to_string())
        })
    }

    pub fn filename(&self) -> Option<String> {
        self.param("Content-Disposition", "filename")
            .or_else(|| self.param("Content-Type", "name"))
    }

    /// Body with its `Content-Transfer-Encoding` undone. Bodies that do not
    /// decode cleanly are returned as stored.
    pub fn decoded(&self) -> Vec<u8> {
        let encoding = self
            .header("Content-Transfer-Encoding")
            .map(|e| e.trim().to_ascii_lowercase());
        match encoding.as_deref() {
            Some("base64") => {
                let compact: Vec<u8> = self
                    .body
                    .iter()
                    .copied()
                    .filter(|b| !b.is_ascii_whitespace())
                    .collect();
                BASE64.decode(compact).unwrap_or_else(|_| self.body.clone())
            }
            Some("quoted-printable") => decode_quoted_printable(&self.body),
            _ => self.body.clone(),
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.decoded()).trim_end().to_string()
    }
}

fn decode_quoted_printable(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        let rest = &input[i + 1..];
        match input[i] {
            // Soft line breaks.
            b'=' if rest.starts_with(b"\r\n") => i += 3,
            b'=' if rest.starts_with(b"\n") => i += 2,
            b'=' => {
                let byte = rest
                    .get(..2)
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok());
                match byte {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'=');
                        i += 1;
                    }
                }
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    out
}

/// A parsed message: the top-level part and its leaf parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rfc822Message {
    pub root: MimePart,
    pub parts: Vec<MimePart>,
}

impl Rfc822Message {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.root.header(name)
    }

    /// `Message-Id` without angle brackets.
    pub fn message_id(&self) -> Option<String> {
        self.header("Message-Id").map(strip_angles).filter(|s| !s.is_empty())
    }

    /// The first plain-text part that is not a named attachment.
    pub fn body_text(&self) -> String {
        self.parts
            .iter()
            .find(|p| p.content_type() == "text/plain" && p.filename().is_none())
            .map(MimePart::text)
            .unwrap_or_default()
    }

    /// Parts that are not the message body.
    pub fn attachments(&self) -> Vec<&MimePart> {
        let body_index = self
            .parts
            .iter()
            .position(|p| p.content_type() == "text/plain" && p.filename().is_none());
        self.parts
            .iter()
            .enumerate()
            .filter(|(i, p)| {
                Some(*i) != body_index
                    && (p.filename().is_some() || !p.content_type().starts_with("text/"))
            })
            .map(|(_, p)| p)
            .collect()
    }
}

fn strip_angles(s: &str) -> String {
    s.trim().trim_start_matches('<').trim_end_matches('>').to_string()
}

fn find(hay: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from >= hay.len() {
        return None;
    }
    hay[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

fn split_part(bytes: &[u8]) -> Result<MimePart> {
    let (head, body) = match (find(bytes, b"\r\n\r\n", 0), find(bytes, b"\n\n", 0)) {
        (Some(crlf), Some(lf)) if lf < crlf => (&bytes[..lf], &bytes[lf + 2..]),
        (Some(crlf), _) => (&bytes[..crlf], &bytes[crlf + 4..]),
        (None, Some(lf)) => (&bytes[..lf], &bytes[lf + 2..]),
        (None, None) => (bytes, &[][..]),
    };

    let mut headers: Vec<(String, String)> = Vec::new();
    for line in String::from_utf8_lossy(head).lines() {
        if line.starts_with([' ', '\t']) {
            if let Some((_, value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    if headers.is_empty() {
        return Err(PipelineError::validation("message has no headers"));
    }
    Ok(MimePart {
        headers,
        body: body.to_vec(),
    })
}

/// Leaf parts of a (possibly multipart) part.
fn leaves(part: MimePart, depth: usize) -> Vec<MimePart> {
    let boundary = part.param("Content-Type", "boundary");
    let multipart = part.content_type().starts_with("multipart/") && depth < 4;
    let (true, Some(boundary)) = (multipart, boundary) else {
        return vec![part];
    };

    let delimiter = format!("--{boundary}").into_bytes();
    let mut out = Vec::new();
    let mut cursor = find(&part.body, &delimiter, 0);
    while let Some(start) = cursor {
        let after = start + delimiter.len();
        if part.body[after..].starts_with(b"--") {
            break;
        }
        let next = find(&part.body, &delimiter, after);
        let end = next.unwrap_or(part.body.len());
        let mut segment = &part.body[after..end];
        segment = segment
            .strip_prefix(b"\r\n")
            .or_else(|| segment.strip_prefix(b"\n"))
            .unwrap_or(segment);
        segment = segment
            .strip_suffix(b"\r\n")
            .or_else(|| segment.strip_suffix(b"\n"))
            .unwrap_or(segment);
        match split_part(segment) {
            Ok(child) => out.extend(leaves(child, depth + 1)),
            Err(_) => out.push(MimePart {
                headers: Vec::new(),
                body: segment.to_vec(),
            }),
        }
        cursor = next;
    }
    out
}

/// Parse raw message bytes.
pub fn parse_rfc822(bytes: &[u8]) -> Result<Rfc822Message> {
    let root = split_part(bytes)?;
    let parts = leaves(root.clone(), 0);
    Ok(Rfc822Message { root, parts })
}

/// Shape raw message bytes as a raw document for ingestion.
pub fn raw_from_rfc822(bytes: &[u8]) -> Result<RawDocument> {
    let message = parse_rfc822(bytes)?;
    let provider_id = message
        .message_id()
        .unwrap_or_else(|| short_hash(bytes, 32));

    let mut raw = RawDocument::new("msg", RFC822_SCHEMA, provider_id);
    raw.fields.insert("size".into(), Value::from(bytes.len()));
    raw.attachments.insert(
        RFC822_ATTACHMENT.into(),
        Attachment::new("message/rfc822", bytes.to_vec()),
    );
    Ok(raw)
}

async fn open_message(
    source: &SourceDocument,
    ctx: &mut ExtensionContext<'_>,
) -> Result<Rfc822Message> {
    let raw = ctx
        .open_attachment(&source.doc_id, RFC822_ATTACHMENT)
        .await?
        .ok_or_else(|| {
            PipelineError::validation(format!("{} has no rfc822 attachment", source.doc_id))
        })?;
    parse_rfc822(&raw.data)
}

fn obj(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `rd.msg.rfc822` -> `rd.msg.body`, plus one `rd.msg.attachment` per part.
pub struct Rfc822ToBody;

#[async_trait]
impl ExtensionHandler for Rfc822ToBody {
    async fn handle(&self, source: &SourceDocument, ctx: &mut ExtensionContext<'_>) -> Result<()> {
        let message = open_message(source, ctx).await?;
        let body = message.body_text();
        let preview: String = body.chars().take(PREVIEW_CHARS).collect();

        let mut fields = Map::new();
        let headers = [
            ("from", "From"),
            ("to", "To"),
            ("cc", "Cc"),
            ("subject", "Subject"),
            ("date", "Date"),
        ];
        for (field, header) in headers {
            if let Some(value) = message.header(header) {
                fields.insert(field.into(), Value::from(value));
            }
        }
        if let Some(ts) = message
            .header("Date")
            .and_then(|d| chrono::DateTime::parse_from_rfc2822(d).ok())
        {
            fields.insert("timestamp".into(), Value::from(ts.to_rfc3339()));
        }
        if let Some(id) = message.message_id() {
            fields.insert("message_id".into(), Value::from(id));
        }
        fields.insert("body".into(), Value::from(body));
        fields.insert("body_preview".into(), Value::from(preview));
        ctx.emit(BODY_SCHEMA, fields)?;

        let message_key = source.rd_key.id().clone();
        for (index, part) in message.attachments().into_iter().enumerate() {
            let rd_key = RdKey::new("attach", json!([message_key, index]));
            let data = part.decoded();
            let fields = obj(json!({
                "message_id": message_key,
                "index": index,
                "content_type": part.content_type(),
                "filename": part.filename(),
                "length": data.len(),
            }));
            let doc_id = ctx.emit_keyed(rd_key, ATTACHMENT_SCHEMA, fields)?;
            let content = Attachment::new(part.content_type(), data);
            ctx.attach(&doc_id, "content", content)?;
        }
        Ok(())
    }
}

/// `rd.msg.rfc822` -> `rd.msg.conversation`.
pub struct Rfc822ToConversation;

/// Conversation a message belongs to, from the most explicit header present.
pub fn conversation_id(message: &Rfc822Message) -> Option<String> {
    if let Some(id) = message.header("X-Conversation-Id") {
        return Some(id.trim().to_string());
    }
    let first_ref = message
        .header("References")
        .and_then(|r| r.split_whitespace().next())
        .map(strip_angles);
    first_ref
        .or_else(|| message.header("In-Reply-To").map(strip_angles))
        .or_else(|| message.message_id())
        .filter(|id| !id.is_empty())
}

#[async_trait]
impl ExtensionHandler for Rfc822ToConversation {
    async fn handle(&self, source: &SourceDocument, ctx: &mut ExtensionContext<'_>) -> Result<()> {
        let message = open_message(source, ctx).await?;
        let conv_id = conversation_id(&message).unwrap_or_else(|| match source.rd_key.id() {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
        ctx.emit(CONVERSATION_SCHEMA, obj(json!({ "conversation_id": conv_id })))?;
        Ok(())
    }
}

/// `rd.msg.conversation` -> `rd.conv.summary` under `["conv", id]`.
///
/// Reads every message body of the conversation, so it records those reads
/// as dependencies and re-fires when a body changes.
pub struct ConversationSummary;

#[async_trait]
impl ExtensionHandler for ConversationSummary {
    async fn handle(&self, source: &SourceDocument, ctx: &mut ExtensionContext<'_>) -> Result<()> {
        let conv_id = source
            .field_str("conversation_id")
            .ok_or_else(|| PipelineError::validation("conversation without conversation_id"))?
            .to_string();

        let rows = ctx
            .query(&ViewQuery::ByField {
                schema_id: CONVERSATION_SCHEMA.into(),
                field: "conversation_id".into(),
                value: Value::from(conv_id.as_str()),
            })
            .await?;

        // Rows arrive in document creation order.
        let mut message_ids: Vec<Value> = Vec::new();
        let mut docs: Vec<String> = Vec::new();
        for row in rows {
            if docs.contains(&row.doc_id) {
                continue;
            }
            message_ids.push(row.rd_key.id().clone());
            docs.push(row.doc_id);
        }

        let mut subject = Value::Null;
        let mut participants: Vec<Value> = Vec::new();
        for doc_id in &docs {
            let Some(body) = ctx.open_schema(doc_id, BODY_SCHEMA).await? else {
                continue;
            };
            if subject.is_null() {
                subject = body.get("subject").cloned().unwrap_or(Value::Null);
            }
            if let Some(from) = body.get("from") {
                if !participants.contains(from) {
                    participants.push(from.clone());
                }
            }
        }

        let fields = obj(json!({
            "conversation_id": conv_id,
            "message_ids": message_ids,
            "message_count": docs.len(),
            "subject": subject,
            "participants": participants,
        }));
        ctx.emit_keyed(RdKey::new("conv", conv_id.as_str()), CONV_SUMMARY_SCHEMA, fields)?;
        Ok(())
    }
}

/// `rd.msg.attachment` -> deferred; summarised per message once per batch.
pub struct AttachmentSummary;

#[async_trait]
impl ExtensionHandler for AttachmentSummary {
    async fn handle(&self, source: &SourceDocument, ctx: &mut ExtensionContext<'_>) -> Result<()> {
        let Some(message_id) = source.fields.get("message_id") else {
            return Ok(());
        };
        ctx.process_later(json!({
            "message_id": message_id,
            "source": source.source_ref(),
        }));
        Ok(())
    }
}

#[async_trait]
impl LaterHandler for AttachmentSummary {
    async fn handle_later(&self, tokens: Vec<Value>, ctx: &mut ExtensionContext<'_>) -> Result<()> {
        let mut by_message: BTreeMap<String, (Value, SourceRef)> = BTreeMap::new();
        for token in tokens {
            let Some(message_id) = token.get("message_id").cloned() else {
                continue;
            };
            let source = token.get("source").cloned().unwrap_or(Value::Null);
            let source: SourceRef = serde_json::from_value(source)?;
            by_message.entry(message_id.to_string()).or_insert((message_id, source));
        }

        for (message_id, source) in by_message.into_values() {
            let rows = ctx
                .query(&ViewQuery::ByField {
                    schema_id: ATTACHMENT_SCHEMA.into(),
                    field: "message_id".into(),
                    value: message_id.clone(),
                })
                .await?;

            let mut parts: Vec<&Map<String, Value>> = rows.iter().map(|r| &r.fields).collect();
            parts.sort_by_key(|f| f.get("index").and_then(Value::as_u64).unwrap_or(0));
            let total: u64 = parts
                .iter()
                .filter_map(|f| f.get("length").and_then(Value::as_u64))
                .sum();
            let content_types: Vec<Value> = parts
                .iter()
                .map(|f| f.get("content_type").cloned().unwrap_or(Value::Null))
                .collect();
            let filenames: Vec<Value> = parts
                .iter()
                .filter_map(|f| f.get("filename").filter(|v| !v.is_null()).cloned())
                .collect();
            let fields = obj(json!({
                "message_id": message_id,
                "count": parts.len(),
                "total_length": total,
                "content_types": content_types,
                "filenames": filenames,
            }));
            ctx.emit_for(source, RdKey::new("msg", message_id), ATTACHMENT_SUMMARY_SCHEMA, fields);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

impl HandlerCatalog {
    /// Catalog holding the built-in handlers.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        let attachments = Arc::new(AttachmentSummary);
        catalog.register("rfc822-to-body", Arc::new(Rfc822ToBody));
        catalog.register("rfc822-to-conversation", Arc::new(Rfc822ToConversation));
        catalog.register("conversation-summary", Arc::new(ConversationSummary));
        catalog.register("attachment-summary", attachments.clone());
        catalog.register_later("attachment-summary", attachments);
        catalog
    }
}

fn descriptor(
    id: &str,
    handler: &str,
    category: ExtensionCategory,
    sources: &[&str],
    emits: &[&str],
) -> ExtensionDescriptor {
    ExtensionDescriptor {
        id: id.into(),
        handler: handler.into(),
        later_handler: None,
        source_schemas: sources.iter().map(|s| s.to_string()).collect(),
        emits: emits.iter().map(|s| s.to_string()).collect(),
        category,
        confidence: None,
        uses_dependencies: false,
        enabled: true,
    }
}

/// Descriptors used when the config lists no extensions.
pub fn builtin_descriptors() -> Vec<ExtensionDescriptor> {
    let mut summary = descriptor(
        "rd.ext.core.conversation-summary",
        "conversation-summary",
        ExtensionCategory::Extender,
        &[CONVERSATION_SCHEMA],
        &[CONV_SUMMARY_SCHEMA],
    );
    summary.uses_dependencies = true;

    let mut attachments = descriptor(
        "rd.ext.core.attachment-summary",
        "attachment-summary",
        ExtensionCategory::Smart,
        &[ATTACHMENT_SCHEMA],
        &[ATTACHMENT_SUMMARY_SCHEMA],
    );
    attachments.later_handler = Some("attachment-summary".into());

    vec![
        descriptor(
            "rd.ext.core.rfc822-to-body",
            "rfc822-to-body",
            ExtensionCategory::Provider,
            &[RFC822_SCHEMA],
            &[BODY_SCHEMA, ATTACHMENT_SCHEMA],
        ),
        descriptor(
            "rd.ext.core.rfc822-to-conversation",
            "rfc822-to-conversation",
            ExtensionCategory::Provider,
            &[RFC822_SCHEMA],
            &[CONVERSATION_SCHEMA],
        ),
        summary,
        attachments,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ExtensionRegistry;

    const PLAIN: &str = "From: Ann <ann@example.com>\r\n\
To: bob@example.com\r\n\
Subject: Lunch\r\n\
\x20plans\r\n\
Date: Tue, 1 Jul 2025 10:00:00 +0000\r\n\
Message-Id: <m1@example.com>\r\n\
\r\n\
See you at noon.\r\n";

    const MULTIPART: &str = "From: ann@example.com\n\
Subject: Files\n\
Message-Id: <m2@example.com>\n\
References: <root@example.com> <m1@example.com>\n\
Content-Type: multipart/mixed; boundary=\"XYZ\"\n\
\n\
preamble\n\
--XYZ\n\
Content-Type: text/plain\n\
\n\
Body text\n\
--XYZ\n\
Content-Type: application/pdf; name=\"a.pdf\"\n\
Content-Disposition: attachment; filename=\"a.pdf\"\n\
\n\
%PDF-1.4\n\
--XYZ--\n";

    #[test]
    fn parses_headers_with_folding() {
        let msg = parse_rfc822(PLAIN.as_bytes()).expect("parse");
        assert_eq!(msg.header("subject"), Some("Lunch plans"));
        assert_eq!(msg.message_id().as_deref(), Some("m1@example.com"));
        assert_eq!(msg.body_text(), "See you at noon.");
        assert!(msg.attachments().is_empty());
    }

    #[test]
    fn parses_multipart_attachments() {
        let msg = parse_rfc822(MULTIPART.as_bytes()).expect("parse");
        assert_eq!(msg.parts.len(), 2);
        assert_eq!(msg.body_text(), "Body text");
        let atts = msg.attachments();
        assert_eq!(atts.len(), 1);
        assert_eq!(atts[0].content_type(), "application/pdf");
        assert_eq!(atts[0].filename().as_deref(), Some("a.pdf"));
        assert_eq!(atts[0].body, b"%PDF-1.4".to_vec());
    }

    const ENCODED: &str = "From: ann@example.com\n\
Message-Id: <m3@example.com>\n\
Content-Type: multipart/mixed; boundary=b1\n\
\n\
--b1\n\
Content-Type: text/plain; charset=utf-8\n\
Content-Transfer-Encoding: quoted-printable\n\
\n\
Caf=C3=A9 at noon, a long line that was wrapped by the sen=\n\
der.\n\
--b1\n\
Content-Type: application/octet-stream\n\
Content-Disposition: attachment; filename=\"hi.bin\"\n\
Content-Transfer-Encoding: base64\n\
\n\
aGVsbG8g\n\
d29ybGQ=\n\
--b1--\n";

    #[test]
    fn transfer_encodings_are_decoded() {
        let msg = parse_rfc822(ENCODED.as_bytes()).expect("parse");
        assert_eq!(
            msg.body_text(),
            "Café at noon, a long line that was wrapped by the sender."
        );
        let atts = msg.attachments();
        assert_eq!(atts.len(), 1);
        assert_eq!(atts[0].decoded(), b"hello world".to_vec());
        assert_eq!(decode_quoted_printable(b"a=3Db=ZZ"), b"a=b=ZZ".to_vec());
    }

    #[test]
    fn conversation_prefers_explicit_headers() {
        let plain = parse_rfc822(PLAIN.as_bytes()).expect("parse");
        assert_eq!(conversation_id(&plain).as_deref(), Some("m1@example.com"));
        let reply = parse_rfc822(MULTIPART.as_bytes()).expect("parse");
        assert_eq!(conversation_id(&reply).as_deref(), Some("root@example.com"));
        let tagged = parse_rfc822(b"X-Conversation-Id: c-9\nSubject: x\n\nhi").expect("parse");
        assert_eq!(conversation_id(&tagged).as_deref(), Some("c-9"));
    }

    #[test]
    fn headerless_input_rejected() {
        assert!(parse_rfc822(b"just text").is_err());
    }

    #[test]
    fn raw_document_keyed_by_message_id() {
        let raw = raw_from_rfc822(PLAIN.as_bytes()).expect("raw");
        assert_eq!(raw.rd_key(), RdKey::new("msg", "m1@example.com"));
        assert_eq!(raw.doc_type, RFC822_SCHEMA);
        assert!(raw.attachments.contains_key(RFC822_ATTACHMENT));
    }

    #[test]
    fn builtin_descriptors_all_load() {
        let (registry, report) =
            ExtensionRegistry::load(&builtin_descriptors(), &HandlerCatalog::builtin());
        assert!(report.rejected.is_empty(), "{:?}", report.rejected);
        assert_eq!(registry.len(), 4);
    }
}
