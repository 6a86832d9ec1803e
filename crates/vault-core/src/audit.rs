//! Append-only audit trail, one JSON array per UTC calendar day.
//!
//! `Logs/2026-01-03.json`:
//! ```json
//! [
//!   {"timestamp": "...", "actor": "approval_router", "action_type": "email_send",
//!    "target": "EMAIL_REPLY_1.md", "result": "success"}
//! ]
//! ```
//!
//! Appends rewrite the day file through [`crate::io::atomic_write`] with all
//! earlier entries byte-for-byte preserved, under a process-wide lock shared
//! by every [`AuditLog`] so concurrent writers in one process never lose each
//! other's entries. Separate processes on one vault are not serialized.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::Result;
use crate::io::atomic_write;
use crate::item::parse_timestamp;
use crate::paths;

/// Well-known `action_type` values.
pub mod actions {
    pub const WATCHER_STARTED: &str = "watcher_started";
    pub const WATCHER_CRASHED: &str = "watcher_crashed";
    pub const WATCHER_RESTARTED: &str = "watcher_restarted";
    pub const WATCHER_ERROR: &str = "watcher_error";
    pub const ACTION_FILE_CREATED: &str = "action_file_created";
    pub const ACTION_FILE_FAILED: &str = "action_file_failed";
    pub const ITEM_FILTERED: &str = "item_filtered";
    pub const FILE_DETECTED: &str = "file_detected";
    pub const ITEM_QUARANTINED: &str = "item_quarantined";
    pub const APPROVAL_EXPIRED: &str = "approval_expired";
    pub const UNROUTABLE_APPROVAL: &str = "unroutable_approval";
    pub const APPROVAL_EXECUTED: &str = "approval_executed";
    pub const APPROVAL_ESCALATED: &str = "approval_escalated";
    pub const JOB_FIRED: &str = "job_fired";
    pub const DAILY_SUMMARY: &str = "daily_summary";
    pub const WEEKLY_BRIEFING: &str = "weekly_briefing";
    pub const REFLECTION_GENERATED: &str = "reflection_generated";
    pub const ORCHESTRATOR_STARTED: &str = "orchestrator_started";
    pub const ORCHESTRATOR_STOPPED: &str = "orchestrator_stopped";
}

// ---------------------------------------------------------------------------
// AuditResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    Success,
    Error,
    DryRun,
    /// Any other value found in a log written by an older or foreign actor.
    #[serde(other)]
    Other,
}

impl AuditResult {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditResult::Success => "success",
            AuditResult::Error => "error",
            AuditResult::DryRun => "dry_run",
            AuditResult::Other => "other",
        }
    }
}

// ---------------------------------------------------------------------------
// AuditEntry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    #[serde(deserialize_with = "deserialize_lenient_ts")]
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action_type: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    pub result: AuditResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditEntry {
    pub fn new(
        actor: impl Into<String>,
        action_type: impl Into<String>,
        target: impl Into<String>,
        result: AuditResult,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            actor: actor.into(),
            action_type: action_type.into(),
            target: target.into(),
            parameters: Map::new(),
            result,
            error: None,
        }
    }

    pub fn success(actor: impl Into<String>, action_type: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(actor, action_type, target, AuditResult::Success)
    }

    pub fn failure(
        actor: impl Into<String>,
        action_type: impl Into<String>,
        target: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self::new(actor, action_type, target, AuditResult::Error).with_error(error)
    }

    pub fn dry_run(actor: impl Into<String>, action_type: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(actor, action_type, target, AuditResult::DryRun)
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn day(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }

    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.parameters.get(key).and_then(Value::as_u64)
    }
}

fn deserialize_lenient_ts<'de, D>(d: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(d)?;
    parse_timestamp(&raw).ok_or_else(|| serde::de::Error::custom(format!("bad timestamp: {raw}")))
}

// ---------------------------------------------------------------------------
// DayLog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayStatus {
    Present,
    Missing,
    Unreadable,
}

/// One day of audit entries as seen by a reader. Missing and unreadable
/// files read as zero entries.
#[derive(Debug, Clone)]
pub struct DayLog {
    pub day: NaiveDate,
    pub status: DayStatus,
    pub entries: Vec<AuditEntry>,
}

// ---------------------------------------------------------------------------
// AuditLog
// ---------------------------------------------------------------------------

/// Held across the read-modify-write of a day file.
static APPEND_LOCK: Mutex<()> = Mutex::new(());

pub struct AuditLog {
    root: PathBuf,
}

impl AuditLog {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Append one entry to the log for the entry's UTC day.
    pub fn append(&self, entry: &AuditEntry) -> Result<()> {
        let _guard = APPEND_LOCK
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let path = paths::audit_log_path(&self.root, entry.day());
        let mut existing: Vec<Value> = match std::fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => Vec::new(),
            Ok(text) => match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(e) => {
                    // Keep the unreadable file for a human instead of overwriting it.
                    let aside = path.with_extension(format!(
                        "json.corrupt-{}",
                        Utc::now().format("%Y%m%dT%H%M%S")
                    ));
                    tracing::warn!(path = %path.display(), error = %e, "audit log unreadable; moved aside");
                    std::fs::rename(&path, &aside)?;
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        existing.push(serde_json::to_value(entry)?);
        let data = serde_json::to_vec_pretty(&existing)?;
        atomic_write(&path, &data)
    }

    /// Best-effort append used on paths where a failed audit write must not
    /// change control flow. Failures go to the operational log.
    pub fn record(&self, entry: AuditEntry) {
        if let Err(e) = self.append(&entry) {
            tracing::error!(
                action_type = %entry.action_type,
                target = %entry.target,
                error = %e,
                "failed to write audit entry"
            );
        }
    }

    /// Read one day. Entries that fail to deserialize are skipped.
    pub fn read_day(&self, day: NaiveDate) -> DayLog {
        let path = paths::audit_log_path(&self.root, day);
        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(_) => {
                return DayLog {
                    day,
                    status: DayStatus::Missing,
                    entries: Vec::new(),
                }
            }
        };
        let raw: Vec<Value> = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unreadable audit log");
                return DayLog {
                    day,
                    status: DayStatus::Unreadable,
                    entries: Vec::new(),
                };
            }
        };
        let entries = raw
            .into_iter()
            .filter_map(|v| serde_json::from_value::<AuditEntry>(v).ok())
            .collect();
        DayLog {
            day,
            status: DayStatus::Present,
            entries,
        }
    }

    /// The trailing `days` calendar days ending at `today`, oldest first.
    pub fn read_window(&self, today: NaiveDate, days: u32) -> Vec<DayLog> {
        (0..days)
            .rev()
            .filter_map(|back| today.checked_sub_days(chrono::Days::new(u64::from(back))))
            .map(|day| self.read_day(day))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, d).unwrap()
    }

    fn at(d: u32) -> DateTime<Utc> {
        day(d).and_hms_opt(12, 0, 0).unwrap().and_utc()
    }

    #[test]
    fn append_groups_by_utc_day() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path());
        log.append(&AuditEntry::success("t", "a", "x").at(at(1))).unwrap();
        log.append(&AuditEntry::success("t", "b", "y").at(at(1))).unwrap();
        log.append(&AuditEntry::success("t", "c", "z").at(at(2))).unwrap();

        assert_eq!(log.read_day(day(1)).entries.len(), 2);
        assert_eq!(log.read_day(day(2)).entries.len(), 1);
        assert!(dir.path().join("Logs/2026-01-01.json").exists());
    }

    #[test]
    fn append_preserves_existing_entries_exactly() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path());
        let first = AuditEntry::failure("router", "email_send", "E.md", "smtp down")
            .with_param("attempt", 1)
            .at(at(3));
        log.append(&first).unwrap();
        log.append(&AuditEntry::success("router", "email_send", "E.md").at(at(3)))
            .unwrap();
        let read = log.read_day(day(3));
        assert_eq!(read.entries[0], first);
        assert_eq!(read.entries[1].result, AuditResult::Success);
    }

    #[test]
    fn missing_day_reads_as_zero_entries() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path());
        let d = log.read_day(day(9));
        assert_eq!(d.status, DayStatus::Missing);
        assert!(d.entries.is_empty());
    }

    #[test]
    fn unreadable_day_is_tolerated_and_moved_aside_on_append() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("Logs")).unwrap();
        std::fs::write(dir.path().join("Logs/2026-01-04.json"), "{not json").unwrap();
        let log = AuditLog::new(dir.path());
        assert_eq!(log.read_day(day(4)).status, DayStatus::Unreadable);

        log.append(&AuditEntry::success("t", "a", "x").at(at(4))).unwrap();
        assert_eq!(log.read_day(day(4)).entries.len(), 1);
        let aside = std::fs::read_dir(dir.path().join("Logs"))
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().contains("corrupt"))
            .count();
        assert_eq!(aside, 1);
    }

    #[test]
    fn reads_foreign_entries_with_naive_timestamps_and_unknown_results() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("Logs")).unwrap();
        std::fs::write(
            dir.path().join("Logs/2026-01-05.json"),
            r#"[{"timestamp": "2026-01-05T10:00:00.123456", "actor": "Orchestrator",
                "action_type": "file_detected", "target": "EMAIL_1.md", "result": "routed",
                "skill": "email-responder"}]"#,
        )
        .unwrap();
        let log = AuditLog::new(dir.path());
        let d = log.read_day(day(5));
        assert_eq!(d.entries.len(), 1);
        assert_eq!(d.entries[0].result, AuditResult::Other);
    }

    #[test]
    fn read_window_is_oldest_first() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path());
        let w = log.read_window(day(7), 7);
        assert_eq!(w.len(), 7);
        assert_eq!(w[0].day, day(1));
        assert_eq!(w[6].day, day(7));
    }

    #[test]
    fn concurrent_appends_lose_nothing() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(AuditLog::new(dir.path()));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    for j in 0..10 {
                        log.append(&AuditEntry::success(format!("u{i}"), "tick", format!("{j}")).at(at(6)))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(log.read_day(day(6)).entries.len(), 80);
    }

    #[test]
    fn separate_logs_on_one_vault_lose_nothing() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let root = root.clone();
                std::thread::spawn(move || {
                    let log = AuditLog::new(&root);
                    for j in 0..10 {
                        log.append(&AuditEntry::success(format!("u{i}"), "tick", format!("{j}")).at(at(7)))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(AuditLog::new(&root).read_day(day(7)).entries.len(), 40);
    }
}
