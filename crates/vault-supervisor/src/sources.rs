use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use vault_core::config::{CommandPollerConfig, DropFolderConfig};
use vault_core::item::WorkItem;
use vault_core::paths::sanitize_key;
use vault_core::types::Stage;

use crate::process::{self, CommandSpec};
use crate::watcher::{Admission, Source, SourceItem};
use crate::{Result, SupervisorError};

// ─── DropFolderSource ─────────────────────────────────────────────────────

/// Exports dropped into a folder under the vault root, one work item per
/// file. The file name is the key.
pub struct DropFolderSource {
    config: DropFolderConfig,
    dir: PathBuf,
}

impl DropFolderSource {
    pub fn new(config: DropFolderConfig, vault_root: &Path) -> Self {
        let dir = vault_root.join(&config.dir);
        Self { config, dir }
    }

    fn matches_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| {
                self.config
                    .extensions
                    .iter()
                    .any(|want| want.eq_ignore_ascii_case(ext))
            })
    }

    /// `<prefix>_<stem>` for the first configured extension, and
    /// `<prefix>_<stem>_<ext>` for the others, so `batch.csv` and
    /// `batch.tsv` never share an id.
    fn item_id(&self, file_name: &str) -> String {
        let path = Path::new(file_name);
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(file_name);
        let ext = path.extension().and_then(|e| e.to_str());
        let primary = match (ext, self.config.extensions.first()) {
            (Some(ext), Some(first)) => first.eq_ignore_ascii_case(ext),
            (None, _) => true,
            (Some(_), None) => false,
        };
        match ext {
            Some(ext) if !primary => format!(
                "{}_{}_{}",
                self.config.id_prefix,
                sanitize_key(stem),
                sanitize_key(&ext.to_ascii_lowercase())
            ),
            _ => format!("{}_{}", self.config.id_prefix, sanitize_key(stem)),
        }
    }
}

#[async_trait]
impl Source for DropFolderSource {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn poll(&self) -> Result<Vec<SourceItem>> {
        let mut rd = match tokio::fs::read_dir(&self.dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut found = Vec::new();
        while let Some(entry) = rd.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_file() || !self.matches_extension(&path) {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let modified = entry.metadata().await?.modified()?;
            found.push((modified, file_name.to_string(), path.clone()));
        }
        found.sort();

        Ok(found
            .into_iter()
            .map(|(_, file_name, path)| SourceItem {
                key: file_name,
                kind: self.config.item_type.clone(),
                fields: BTreeMap::from([("source_file".to_string(), path.display().to_string())]),
                body: String::new(),
                classification: None,
            })
            .collect())
    }

    fn admit(&self, item: &SourceItem, now: DateTime<Utc>) -> Admission {
        let id = self.item_id(&item.key);
        let source_file = item.fields.get("source_file").cloned().unwrap_or_default();

        let mut work = WorkItem::new(
            id,
            Stage::NeedsAction,
            &self.config.item_type,
            "pending_processing",
            now,
        )
        .with_body(format!(
            "# New order file\n\nA new export was dropped into `{}/`.\n\n- File: `{}`\n\n\
             ## Next steps\n\n- [ ] Read the orders\n- [ ] Draft follow-ups for approval\n",
            self.config.dir, item.key
        ));
        work.header.set("source_file", source_file);
        work.header.set("detected", now.to_rfc3339());
        Admission::Accept(work)
    }
}

// ─── CommandSource ────────────────────────────────────────────────────────

/// An external poll command that prints a JSON array of items on stdout.
pub struct CommandSource {
    config: CommandPollerConfig,
    vault_root: PathBuf,
    timeout: Duration,
    blocklist: Vec<Regex>,
}

impl CommandSource {
    pub fn new(config: CommandPollerConfig, vault_root: &Path, timeout: Duration) -> Result<Self> {
        let blocklist = config
            .sender_blocklist
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    SupervisorError::Config(format!("{}: bad blocklist pattern '{p}': {e}", config.name))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            config,
            vault_root: vault_root.to_path_buf(),
            timeout,
            blocklist,
        })
    }

    fn blocked_reason(&self, item: &SourceItem) -> Option<String> {
        if let Some(field) = &self.config.sender_field {
            if let Some(sender) = item.fields.get(field) {
                if let Some(re) = self.blocklist.iter().find(|re| re.is_match(sender)) {
                    return Some(format!("sender matches blocklist '{}'", re.as_str()));
                }
            }
        }
        let class = item.classification.as_deref()?;
        self.config
            .blocked_classifications
            .iter()
            .any(|b| b.eq_ignore_ascii_case(class))
            .then(|| format!("classification '{class}'"))
    }
}

#[async_trait]
impl Source for CommandSource {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn poll(&self) -> Result<Vec<SourceItem>> {
        let spec = CommandSpec::from_argv(&self.config.command, self.timeout)?
            .current_dir(&self.vault_root);
        let out = process::run(&spec).await?;
        if out.stdout.trim().is_empty() {
            return Ok(Vec::new());
        }
        let mut items: Vec<SourceItem> =
            serde_json::from_str(&out.stdout).map_err(|source| SupervisorError::Parse {
                what: format!("{} output", self.config.name),
                source,
            })?;
        for item in &mut items {
            if item.kind.is_empty() {
                item.kind = self.config.item_type.clone();
            }
        }
        Ok(items)
    }

    fn admit(&self, item: &SourceItem, now: DateTime<Utc>) -> Admission {
        if let Some(reason) = self.blocked_reason(item) {
            return Admission::Filter { reason };
        }
        let id = format!("{}_{}", self.config.id_prefix, sanitize_key(&item.key));
        let mut work = WorkItem::new(id, Stage::NeedsAction, &self.config.item_type, "pending", now)
            .with_body(item.body.clone());
        for (key, value) in &item.fields {
            if let Some(key) = header_key(key) {
                work.header.set(key, single_line(value));
            }
        }
        if let Some(class) = &item.classification {
            work.header.set("classification", single_line(class));
        }
        work.header.set("source", self.config.name.as_str());
        Admission::Accept(work)
    }
}

/// Source field names usable as header keys. Required keys are owned by
/// the watcher and never overwritten.
fn header_key(key: &str) -> Option<String> {
    let k = key.trim().to_ascii_lowercase().replace([' ', '-'], "_");
    let valid = !k.is_empty() && k.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    (valid && !vault_core::item::REQUIRED_KEYS.contains(&k.as_str())).then_some(k)
}

fn single_line(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ─── Tests ────────────────────────────────────────────────────────────────
