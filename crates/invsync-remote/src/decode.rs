//! Response decoding: JSON pages and NDJSON bulk reports.
//!
//! Page bodies are `{"records": [...], "next_cursor": "..."}` (a bare array
//! is accepted as a final page). Reports are newline-delimited JSON: one
//! header line listing column names, then one array per row.
//!
//! A record that cannot be decoded is reported as a [`MalformedItem`] and
//! does not poison its page; a body that cannot be decoded at all is a
//! [`RemoteError::Malformed`].

use serde_json::{Map, Value};

use futures::stream::{BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;

use invsync_core::{NaturalKey, RecordKind, RemoteRecord, Timestamp};

use crate::error::{RemoteError, Result};
use crate::source::BodyStream;

pub const JSON: &str = "application/json";
pub const NDJSON: &str = "application/x-ndjson";

/// Field carrying the remote modification time, in Unix milliseconds.
pub const LAST_MODIFIED_FIELD: &str = "last_modified";

/// Maximum characters of a raw body kept for diagnostics.
pub const SNIPPET_LIMIT: usize = 500;

/// Names of the natural key field per kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFields {
    pub item: String,
    pub vendor: String,
}

impl KeyFields {
    pub fn for_kind(&self, kind: RecordKind) -> &str {
        match kind {
            RecordKind::Item => &self.item,
            RecordKind::Vendor => &self.vendor,
        }
    }
}

impl Default for KeyFields {
    fn default() -> Self {
        Self {
            item: "sku".to_string(),
            vendor: "vendor_id".to_string(),
        }
    }
}

/// A record the remote returned but that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedItem {
    pub kind: RecordKind,
    /// Position in the page or report.
    pub index: usize,
    /// The key, when it could be read.
    pub key: Option<String>,
    pub reason: String,
    /// Bounded raw form of the record.
    pub raw: String,
}

/// One decoded page.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<RemoteRecord>,
    pub next_cursor: Option<String>,
    pub malformed: Vec<MalformedItem>,
}

/// One item of a bulk report.
#[derive(Debug, Clone)]
pub enum DumpItem {
    Record(RemoteRecord),
    Malformed(MalformedItem),
}

fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// `application/json` or any `+json` media type. Parameters are ignored.
pub fn is_json(content_type: Option<&str>) -> bool {
    content_type
        .map(media_type)
        .map_or(false, |m| m == JSON || m.ends_with("+json"))
}

/// `application/x-ndjson` or another ndjson spelling.
pub fn is_ndjson(content_type: Option<&str>) -> bool {
    content_type
        .map(media_type)
        .map_or(false, |m| m == NDJSON || m.ends_with("ndjson"))
}

/// A bounded, lossy text view of a raw body.
pub fn snippet(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.chars().count() <= SNIPPET_LIMIT {
        return text.into_owned();
    }
    let mut out: String = text.chars().take(SNIPPET_LIMIT).collect();
    out.push_str("... (truncated)");
    out
}

/// Decode one JSON page body.
pub fn decode_page(kind: RecordKind, key_field: &str, body: &[u8]) -> Result<Page> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| RemoteError::malformed(format!("invalid JSON page: {}", e), snippet(body)))?;

    let (items, next_cursor) = match value {
        Value::Array(items) => (items, None),
        Value::Object(mut obj) => {
            let items = match obj.remove("records") {
                Some(Value::Array(items)) => items,
                _ => {
                    return Err(RemoteError::malformed(
                        "page has no records array",
                        snippet(body),
                    ))
                }
            };
            let next_cursor = match obj.remove("next_cursor") {
                None | Some(Value::Null) => None,
                Some(Value::String(s)) if s.is_empty() => None,
                Some(Value::String(s)) => Some(s),
                Some(Value::Number(n)) => Some(n.to_string()),
                Some(other) => {
                    return Err(RemoteError::malformed(
                        format!("invalid next_cursor: {}", other),
                        snippet(body),
                    ))
                }
            };
            (items, next_cursor)
        }
        _ => return Err(RemoteError::malformed("page is not an object", snippet(body))),
    };

    let mut page = Page {
        next_cursor,
        ..Page::default()
    };
    for (index, item) in items.into_iter().enumerate() {
        match item {
            Value::Object(obj) => match record_from_object(kind, key_field, obj) {
                Ok(record) => page.records.push(record),
                Err(bad) => page.malformed.push(bad.at(kind, index)),
            },
            other => page.malformed.push(MalformedItem {
                kind,
                index,
                key: None,
                reason: "record is not an object".to_string(),
                raw: snippet(other.to_string().as_bytes()),
            }),
        }
    }
    Ok(page)
}

struct BadRecord {
    key: Option<String>,
    reason: String,
    raw: String,
}

impl BadRecord {
    fn at(self, kind: RecordKind, index: usize) -> MalformedItem {
        MalformedItem {
            kind,
            index,
            key: self.key,
            reason: self.reason,
            raw: self.raw,
        }
    }
}

fn record_from_object(
    kind: RecordKind,
    key_field: &str,
    mut obj: Map<String, Value>,
) -> std::result::Result<RemoteRecord, BadRecord> {
    let raw = || snippet(Value::Object(obj.clone()).to_string().as_bytes());

    let key_text = match obj.get(key_field) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) if n.is_i64() || n.is_u64() => n.to_string(),
        Some(_) => {
            return Err(BadRecord {
                key: None,
                reason: format!("{} is not a string or integer", key_field),
                raw: raw(),
            })
        }
        None => {
            return Err(BadRecord {
                key: None,
                reason: format!("missing {}", key_field),
                raw: raw(),
            })
        }
    };
    let key = NaturalKey::new(&key_text).map_err(|e| BadRecord {
        key: Some(key_text.clone()),
        reason: e.to_string(),
        raw: raw(),
    })?;

    let modified_at = match obj.get(LAST_MODIFIED_FIELD) {
        None | Some(Value::Null) => None,
        Some(v) => match parse_last_modified(v) {
            Some(at) => Some(at),
            None => {
                return Err(BadRecord {
                    key: Some(key_text),
                    reason: format!("invalid {}", LAST_MODIFIED_FIELD),
                    raw: raw(),
                })
            }
        },
    };

    obj.remove(key_field);
    obj.remove(LAST_MODIFIED_FIELD);

    let mut record = RemoteRecord::new(kind, key);
    record.fields = obj.into_iter().collect();
    record.remote_modified_at = modified_at;
    Ok(record)
}

/// Integer milliseconds, as a number or a numeric string.
pub fn parse_last_modified(value: &Value) -> Option<Timestamp> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Incremental decoder for NDJSON report lines.
pub struct ReportDecoder {
    kind: RecordKind,
    key_field: String,
    columns: Option<Vec<String>>,
    rows: usize,
}

impl ReportDecoder {
    pub fn new(kind: RecordKind, key_field: impl Into<String>) -> Self {
        Self {
            kind,
            key_field: key_field.into(),
            columns: None,
            rows: 0,
        }
    }

    /// Whether the header line has been read.
    pub fn has_header(&self) -> bool {
        self.columns.is_some()
    }

    /// Feed one line (without its newline). Blank lines yield nothing.
    ///
    /// An invalid header fails the whole report, as does a header without
    /// the key column once a row arrives. An invalid row yields a
    /// [`DumpItem::Malformed`].
    pub fn feed_line(&mut self, line: &[u8]) -> Result<Option<DumpItem>> {
        if line.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }

        if self.columns.is_none() {
            let header: Vec<String> = serde_json::from_slice(line).map_err(|e| {
                RemoteError::malformed(format!("invalid report header: {}", e), snippet(line))
            })?;
            self.columns = Some(header);
            return Ok(None);
        }
        let columns = self.columns.as_deref().unwrap_or_default();
        if !columns.iter().any(|c| c == &self.key_field) {
            return Err(RemoteError::malformed(
                format!("report header lacks {}", self.key_field),
                snippet(line),
            ));
        }

        let index = self.rows;
        self.rows += 1;

        let malformed = |reason: String| {
            Ok(Some(DumpItem::Malformed(MalformedItem {
                kind: self.kind,
                index,
                key: None,
                reason,
                raw: snippet(line),
            })))
        };

        let row: Vec<Value> = match serde_json::from_slice(line) {
            Ok(row) => row,
            Err(e) => return malformed(format!("invalid row: {}", e)),
        };
        if row.len() != columns.len() {
            return malformed(format!(
                "row has {} values, header has {}",
                row.len(),
                columns.len()
            ));
        }

        let obj: Map<String, Value> = columns
            .iter()
            .cloned()
            .zip(row)
            .filter(|(_, v)| !v.is_null())
            .collect();
        match record_from_object(self.kind, &self.key_field, obj) {
            Ok(record) => Ok(Some(DumpItem::Record(record))),
            Err(bad) => Ok(Some(DumpItem::Malformed(bad.at(self.kind, index)))),
        }
    }
}

struct ReportState {
    body: BodyStream,
    buf: Vec<u8>,
    decoder: ReportDecoder,
    cancel: CancellationToken,
    exhausted: bool,
    finished: bool,
}

impl ReportState {
    fn take_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.buf.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(line)
    }
}

/// Lazily decode a streamed NDJSON report.
///
/// Rows are yielded as they arrive. The stream ends after the first error,
/// and yields `Cancelled` if the token fires mid-stream.
pub fn decode_report(
    kind: RecordKind,
    key_field: &str,
    body: BodyStream,
    cancel: CancellationToken,
) -> BoxStream<'static, Result<DumpItem>> {
    let state = ReportState {
        body,
        buf: Vec::new(),
        decoder: ReportDecoder::new(kind, key_field),
        cancel,
        exhausted: false,
        finished: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }
        loop {
            if let Some(line) = state.take_line() {
                match state.decoder.feed_line(&line) {
                    Ok(Some(item)) => return Some((Ok(item), state)),
                    Ok(None) => continue,
                    Err(e) => {
                        state.finished = true;
                        return Some((Err(e), state));
                    }
                }
            }

            if state.exhausted {
                // A final line may lack its newline.
                if !state.buf.is_empty() {
                    let line = std::mem::take(&mut state.buf);
                    match state.decoder.feed_line(&line) {
                        Ok(Some(item)) => return Some((Ok(item), state)),
                        Ok(None) => {}
                        Err(e) => {
                            state.finished = true;
                            return Some((Err(e), state));
                        }
                    }
                }
                state.finished = true;
                if !state.decoder.has_header() {
                    return Some((
                        Err(RemoteError::malformed("report has no header", String::new())),
                        state,
                    ));
                }
                return None;
            }

            let next = tokio::select! {
                biased;
                _ = state.cancel.cancelled() => {
                    state.finished = true;
                    return Some((Err(RemoteError::Cancelled), state));
                }
                next = state.body.next() => next,
            };
            match next {
                Some(Ok(chunk)) => state.buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(e), state));
                }
                None => state.exhausted = true,
            }
        }
    })
    .boxed()
}
