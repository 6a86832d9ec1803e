//! Work item files: a `key: value` header followed by a free-form body.
//!
//! ```text
//! ---
//! type: customer_email
//! created: 2026-01-01T09:30:00Z
//! status: pending
//! classification: order_query
//! ---
//!
//! body owned by the reasoning collaborator
//! ```
//!
//! The fenced form is what this crate writes. Unfenced headers (leading
//! `key: value` lines up to the first blank line) are accepted on read.
//! Only header keys are interpreted; the body passes through untouched.

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, VaultError};
use crate::types::{ItemKind, Stage};

pub const REQUIRED_KEYS: &[&str] = &["type", "created", "status"];

const FENCE: &str = "---";

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// Ordered header block. Order is preserved so rewrites stay diff-friendly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    entries: Vec<(String, String)>,
}

impl Header {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Replace the value of `key`, or append it if absent.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// WorkItem
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub stage: Stage,
    pub header: Header,
    pub body: String,
}

impl WorkItem {
    /// A fresh item with the required header keys filled in.
    pub fn new(
        id: impl Into<String>,
        stage: Stage,
        item_type: impl Into<String>,
        status: impl Into<String>,
        created: DateTime<Utc>,
    ) -> Self {
        let mut header = Header::default();
        header.set("type", item_type);
        header.set("created", created.to_rfc3339());
        header.set("status", status);
        Self {
            id: id.into(),
            stage,
            header,
            body: String::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn item_type(&self) -> &str {
        self.header.get("type").unwrap_or_default()
    }

    pub fn kind(&self) -> ItemKind {
        ItemKind::from_type_header(self.item_type())
    }

    pub fn status(&self) -> &str {
        self.header.get("status").unwrap_or_default()
    }

    pub fn classification(&self) -> Option<&str> {
        self.header.get("classification")
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.header.get("created").and_then(parse_timestamp)
    }

    pub fn expires(&self) -> Option<DateTime<Utc>> {
        self.header.get("expires").and_then(parse_timestamp)
    }

    /// Parse file content. `path` is only used in error messages.
    pub fn parse(id: &str, stage: Stage, text: &str, path: &Path) -> Result<Self> {
        let (header, body) = split_header(text, path)?;
        for key in REQUIRED_KEYS {
            if header.get(key).map_or(true, str::is_empty) {
                return Err(VaultError::MissingHeaderKey {
                    key: (*key).to_string(),
                    path: path.display().to_string(),
                });
            }
        }
        if header.get("created").and_then(parse_timestamp).is_none() {
            return Err(VaultError::MalformedHeader {
                path: path.display().to_string(),
                reason: "unparseable 'created' timestamp".into(),
            });
        }
        Ok(Self {
            id: id.to_string(),
            stage,
            header,
            body,
        })
    }

    pub fn render(&self) -> String {
        let mut out = String::with_capacity(self.body.len() + 128);
        out.push_str(FENCE);
        out.push('\n');
        for (k, v) in self.header.iter() {
            out.push_str(k);
            out.push_str(": ");
            out.push_str(v);
            out.push('\n');
        }
        out.push_str(FENCE);
        out.push('\n');
        if !self.body.is_empty() {
            out.push('\n');
            out.push_str(&self.body);
            if !self.body.ends_with('\n') {
                out.push('\n');
            }
        }
        out
    }
}

fn split_header(text: &str, path: &Path) -> Result<(Header, String)> {
    let malformed = |reason: String| VaultError::MalformedHeader {
        path: path.display().to_string(),
        reason,
    };

    let mut lines = text.split_inclusive('\n');
    let mut header = Header::default();
    let mut consumed = 0usize;

    let fenced = text.starts_with(FENCE);
    if fenced {
        let first = lines.next().unwrap_or_default();
        consumed += first.len();
        let mut closed = false;
        for raw in lines.by_ref() {
            consumed += raw.len();
            let line = raw.trim_end_matches(['\r', '\n']);
            if line.trim() == FENCE {
                closed = true;
                break;
            }
            if line.trim().is_empty() {
                continue;
            }
            let (k, v) = parse_line(line)
                .ok_or_else(|| malformed(format!("not a key: value line: '{line}'")))?;
            header.set(k, v);
        }
        if !closed {
            return Err(malformed("header fence is never closed".into()));
        }
    } else {
        for raw in lines.by_ref() {
            consumed += raw.len();
            let line = raw.trim_end_matches(['\r', '\n']);
            if line.trim().is_empty() {
                break;
            }
            let (k, v) = parse_line(line)
                .ok_or_else(|| malformed(format!("not a key: value line: '{line}'")))?;
            header.set(k, v);
        }
    }

    if header.is_empty() {
        return Err(malformed("no header".into()));
    }

    let rest = text.get(consumed..).unwrap_or_default();
    let body = rest.trim_start_matches(['\r', '\n']).to_string();
    Ok((header, body))
}

fn parse_line(line: &str) -> Option<(String, String)> {
    let (k, v) = line.split_once(':')?;
    let k = k.trim();
    if k.is_empty() || k.contains(char::is_whitespace) {
        return None;
    }
    Some((k.to_string(), v.trim().to_string()))
}

/// Accepts RFC 3339, naive ISO-8601 (interpreted as local time), or a bare date.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, fmt) {
            return Local
                .from_local_datetime(&naive)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc));
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .and_then(|naive| Local.from_local_datetime(&naive).earliest())
        .map(|dt| dt.with_timezone(&Utc))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn p() -> &'static Path {
        Path::new("Pending_Approval/x.md")
    }

    #[test]
    fn parses_fenced_header_and_keeps_body() {
        let text = "---\ntype: email_reply\ncreated: 2026-01-01T09:30:00Z\nstatus: pending\nsubject: Re: order #42\n---\n\n## Draft\nHello there\n";
        let item = WorkItem::parse("EMAIL_REPLY_1", Stage::PendingApproval, text, p()).unwrap();
        assert_eq!(item.item_type(), "email_reply");
        assert_eq!(item.kind(), ItemKind::Email);
        assert_eq!(item.header.get("subject"), Some("Re: order #42"));
        assert_eq!(item.body, "## Draft\nHello there\n");
        assert_eq!(
            item.created().unwrap(),
            "2026-01-01T09:30:00Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    #[test]
    fn parses_unfenced_header() {
        let text = "type: plan\ncreated: 2026-01-02\nstatus: draft\n\nfree text";
        let item = WorkItem::parse("PLAN_1", Stage::NeedsAction, text, p()).unwrap();
        assert_eq!(item.kind(), ItemKind::Plan);
        assert_eq!(item.body, "free text");
    }

    #[test]
    fn missing_required_key_is_an_error() {
        let text = "---\ntype: email\nstatus: pending\n---\n";
        let err = WorkItem::parse("x", Stage::NeedsAction, text, p()).unwrap_err();
        assert!(matches!(err, VaultError::MissingHeaderKey { ref key, .. } if key == "created"));
    }

    #[test]
    fn unclosed_fence_is_malformed() {
        let text = "---\ntype: email\ncreated: 2026-01-01\nstatus: pending\n";
        let err = WorkItem::parse("x", Stage::NeedsAction, text, p()).unwrap_err();
        assert!(matches!(err, VaultError::MalformedHeader { .. }));
    }

    #[test]
    fn body_without_header_is_malformed() {
        let err = WorkItem::parse("x", Stage::NeedsAction, "just a note", p()).unwrap_err();
        assert!(matches!(err, VaultError::MalformedHeader { .. }));
    }

    #[test]
    fn render_then_parse_preserves_header_order() {
        let created = Utc::now();
        let mut item = WorkItem::new("EMAIL_abc", Stage::NeedsAction, "customer_email", "pending", created)
            .with_body("hello");
        item.header.set("expires", (created + Duration::hours(24)).to_rfc3339());
        item.header.set("status", "executed");
        let text = item.render();
        assert!(text.starts_with("---\ntype: customer_email\ncreated: "));
        let back = WorkItem::parse("EMAIL_abc", Stage::NeedsAction, &text, p()).unwrap();
        let keys: Vec<_> = back.header.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["type", "created", "status", "expires"]);
        assert_eq!(back.status(), "executed");
        assert_eq!(back.body, "hello\n");
        assert!(back.expires().is_some());
    }

    #[test]
    fn naive_timestamps_are_accepted() {
        assert!(parse_timestamp("2026-01-01T20:00:00.123456").is_some());
        assert!(parse_timestamp("2026-01-01").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }
}
