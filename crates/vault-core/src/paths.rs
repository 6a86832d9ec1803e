use crate::error::{Result, VaultError};
use crate::types::Stage;
use chrono::NaiveDate;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const NEEDS_ACTION_DIR: &str = "Needs_Action";
pub const PENDING_APPROVAL_DIR: &str = "Pending_Approval";
pub const APPROVED_DIR: &str = "Approved";
pub const REJECTED_DIR: &str = "Rejected";
pub const DONE_DIR: &str = "Done";
pub const QUARANTINE_DIR: &str = "Quarantine";
pub const LOGS_DIR: &str = "Logs";
pub const BRIEFINGS_DIR: &str = "Briefings";
pub const ORDERS_DIR: &str = "Orders";

pub const STATE_DIR: &str = ".vault";
pub const CONFIG_FILE: &str = ".vault/config.yaml";
pub const INDEX_FILE: &str = ".vault/index.redb";

pub const ITEM_EXTENSION: &str = "md";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn stage_dir(root: &Path, stage: Stage) -> PathBuf {
    root.join(stage.dir_name())
}

pub fn item_path(root: &Path, stage: Stage, id: &str) -> PathBuf {
    stage_dir(root, stage).join(format!("{id}.{ITEM_EXTENSION}"))
}

pub fn logs_dir(root: &Path) -> PathBuf {
    root.join(LOGS_DIR)
}

/// One audit file per UTC calendar day: `Logs/YYYY-MM-DD.json`.
pub fn audit_log_path(root: &Path, day: NaiveDate) -> PathBuf {
    logs_dir(root).join(format!("{}.json", day.format("%Y-%m-%d")))
}

pub fn briefings_dir(root: &Path) -> PathBuf {
    root.join(BRIEFINGS_DIR)
}

pub fn orders_dir(root: &Path) -> PathBuf {
    root.join(ORDERS_DIR)
}

pub fn state_dir(root: &Path) -> PathBuf {
    root.join(STATE_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn index_path(root: &Path) -> PathBuf {
    root.join(INDEX_FILE)
}

/// Item id for a file in a stage directory: the file name without `.md`.
/// Returns `None` for hidden files, temp files, and non-markdown files.
pub fn item_id_from_path(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    if name.starts_with('.') {
        return None;
    }
    let stem = name.strip_suffix(&format!(".{ITEM_EXTENSION}"))?;
    if stem.is_empty() {
        return None;
    }
    Some(stem.to_string())
}

// ---------------------------------------------------------------------------
// Item id validation
// ---------------------------------------------------------------------------

static ID_RE: OnceLock<Regex> = OnceLock::new();
static UNSAFE_RE: OnceLock<Regex> = OnceLock::new();

fn id_re() -> &'static Regex {
    ID_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_\-.]*$").unwrap())
}

fn unsafe_re() -> &'static Regex {
    UNSAFE_RE.get_or_init(|| Regex::new(r"[^A-Za-z0-9_\-]+").unwrap())
}

pub fn validate_item_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > 200 || id.contains("..") || !id_re().is_match(id) {
        return Err(VaultError::InvalidItemId(id.to_string()));
    }
    Ok(())
}

/// Reduce an arbitrary source key to an id-safe fragment.
///
/// Deterministic: the same key always yields the same fragment, so a source
/// item re-delivered after a restart maps to the same file name.
pub fn sanitize_key(key: &str) -> String {
    let cleaned = unsafe_re().replace_all(key.trim(), "_");
    let cleaned = cleaned.trim_matches('_');
    let mut out: String = cleaned.chars().take(96).collect();
    if out.is_empty() {
        out.push('x');
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
