//! The `Vault` handle: stage directories, the item index, and the audit log
//! behind one mode-aware API.
//!
//! In [`ExecutionMode::DryRun`] nothing under the vault root changes except
//! `Logs/`. Mutations update an in-memory index instead, and directory scans
//! hide items that index says have already moved, so a simulated run
//! proceeds the way a live one would without touching files.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::audit::AuditLog;
use crate::error::{Result, VaultError};
use crate::index::{ItemIndex, ItemRecord};
use crate::io;
use crate::item::WorkItem;
use crate::paths;
use crate::types::{ExecutionMode, ItemKind, Stage};

// ---------------------------------------------------------------------------
// ItemFile
// ---------------------------------------------------------------------------

/// A file found in a stage directory. Not yet parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemFile {
    pub id: String,
    pub stage: Stage,
    pub path: PathBuf,
    /// Filesystem creation time, falling back to mtime.
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

impl ItemFile {
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.id, paths::ITEM_EXTENSION)
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotItem {
    pub id: String,
    /// Header `created` when parseable, else the file timestamp.
    pub created: DateTime<Utc>,
    pub age_hours: f64,
}

/// Point-in-time view of the stage directories, with ages.
#[derive(Debug, Clone, Serialize)]
pub struct VaultSnapshot {
    pub taken_at: DateTime<Utc>,
    pub stages: BTreeMap<Stage, Vec<SnapshotItem>>,
}

impl VaultSnapshot {
    pub fn items(&self, stage: Stage) -> &[SnapshotItem] {
        self.stages.get(&stage).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn count(&self, stage: Stage) -> usize {
        self.items(stage).len()
    }

    pub fn older_than(&self, stage: Stage, age: chrono::Duration) -> Vec<&SnapshotItem> {
        let hours = age.num_minutes() as f64 / 60.0;
        self.items(stage)
            .iter()
            .filter(|i| i.age_hours > hours)
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

// ---------------------------------------------------------------------------
// Vault
// ---------------------------------------------------------------------------

pub struct Vault {
    root: PathBuf,
    mode: ExecutionMode,
    index: ItemIndex,
    audit: AuditLog,
}

impl Vault {
    /// Open the vault at `root`. The root must already exist.
    ///
    /// Live mode creates any missing stage directories and opens the index
    /// file; dry-run opens an in-memory index. Either way the index is
    /// reconciled against the directories before returning.
    pub fn open(root: &Path, mode: ExecutionMode) -> Result<Self> {
        if !root.is_dir() {
            return Err(VaultError::VaultRootMissing(root.display().to_string()));
        }
        let index = match mode {
            ExecutionMode::Live => {
                Self::create_layout(root)?;
                ItemIndex::open(&paths::index_path(root))?
            }
            ExecutionMode::DryRun => ItemIndex::in_memory()?,
        };
        let vault = Self {
            root: root.to_path_buf(),
            mode,
            index,
            audit: AuditLog::new(root),
        };
        let report = vault.reconcile()?;
        tracing::debug!(
            added = report.added,
            updated = report.updated,
            removed = report.removed,
            "index reconciled"
        );
        Ok(vault)
    }

    /// Create the stage, log, briefing, drop and state directories.
    pub fn create_layout(root: &Path) -> Result<()> {
        for stage in Stage::all() {
            io::ensure_dir(&paths::stage_dir(root, *stage))?;
        }
        io::ensure_dir(&paths::logs_dir(root))?;
        io::ensure_dir(&paths::briefings_dir(root))?;
        io::ensure_dir(&paths::orders_dir(root))?;
        io::ensure_dir(&paths::state_dir(root))?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn is_dry_run(&self) -> bool {
        self.mode.is_dry_run()
    }

    pub fn index(&self) -> &ItemIndex {
        &self.index
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    // -----------------------------------------------------------------------
    // Reading
    // -----------------------------------------------------------------------

    /// Files in one stage directory, oldest first by creation time.
    pub fn scan_stage(&self, stage: Stage) -> Result<Vec<ItemFile>> {
        let mut files = scan_dir(&paths::stage_dir(&self.root, stage), stage)?;
        if self.is_dry_run() {
            // Hide items a simulated transition already took elsewhere.
            let mut kept = Vec::with_capacity(files.len());
            for f in files {
                match self.index.item(&f.id)? {
                    Some(rec) if rec.stage != stage => {}
                    _ => kept.push(f),
                }
            }
            files = kept;
        }
        Ok(files)
    }

    pub fn read_item(&self, file: &ItemFile) -> Result<WorkItem> {
        let text = std::fs::read_to_string(&file.path)?;
        WorkItem::parse(&file.id, file.stage, &text, &file.path)
    }

    /// The stage whose directory currently holds `id`, if any.
    pub fn locate(&self, id: &str) -> Option<Stage> {
        if self.is_dry_run() {
            if let Ok(Some(rec)) = self.index.item(id) {
                return Some(rec.stage);
            }
        }
        Stage::all()
            .iter()
            .copied()
            .find(|s| paths::item_path(&self.root, *s, id).is_file())
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Write a new item into its stage directory.
    ///
    /// Returns `Ok(false)` without writing when an item with the same id
    /// already exists in any stage.
    pub fn create_item(&self, item: &WorkItem) -> Result<bool> {
        paths::validate_item_id(&item.id)?;
        if self.locate(&item.id).is_some() {
            return Ok(false);
        }
        if !self.is_dry_run() {
            let path = paths::item_path(&self.root, item.stage, &item.id);
            io::atomic_write(&path, item.render().as_bytes())?;
        }
        self.index.upsert_item(&record_for(item))?;
        Ok(true)
    }

    /// Rewrite an item in place, e.g. to record an error on it.
    ///
    /// Fails with [`VaultError::ItemNotFound`] when the file has left
    /// `file.path` since it was scanned; the write never re-creates it.
    pub fn rewrite_item(&self, file: &ItemFile, item: &WorkItem) -> Result<()> {
        if item.stage != file.stage {
            return Err(VaultError::StageConflict {
                id: item.id.clone(),
                expected: file.stage.to_string(),
                actual: item.stage.to_string(),
            });
        }
        if self.is_dry_run() {
            return Ok(());
        }
        if !file.path.is_file() {
            return Err(VaultError::ItemNotFound(file.id.clone()));
        }
        io::atomic_write(&file.path, item.render().as_bytes())
    }

    /// Move an item to `to`, then write `item` at its new path.
    ///
    /// The rename comes first so an item someone else moved in the
    /// meantime fails with [`VaultError::ItemNotFound`] and is left where
    /// they put it. Returns the id the item carries after the move.
    pub fn transition(&self, file: &ItemFile, item: &WorkItem, to: Stage) -> Result<String> {
        let new_id = self.move_item(file, to)?;
        if !self.is_dry_run() {
            let path = paths::item_path(&self.root, to, &new_id);
            io::atomic_write(&path, item.render().as_bytes())?;
        }
        Ok(new_id)
    }

    /// Move an item to another stage. The only stage transition there is.
    ///
    /// A name collision in the destination gets a numeric suffix; the
    /// returned id is the one the item carries after the move.
    pub fn move_item(&self, file: &ItemFile, to: Stage) -> Result<String> {
        let kind = self
            .index
            .item(&file.id)?
            .map(|r| r.kind)
            .unwrap_or(ItemKind::Other);

        let new_id = if self.is_dry_run() {
            file.id.clone()
        } else {
            let dest = match io::move_into(&file.path, &paths::stage_dir(&self.root, to)) {
                Ok(dest) => dest,
                Err(VaultError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(VaultError::ItemNotFound(file.id.clone()));
                }
                Err(e) => return Err(e),
            };
            let new_id = paths::item_id_from_path(&dest).unwrap_or_else(|| file.id.clone());
            if new_id != file.id {
                self.index.remove_item(&file.id)?;
            }
            new_id
        };

        self.index.upsert_item(&ItemRecord {
            id: new_id.clone(),
            stage: to,
            kind,
            created: Some(file.created),
            updated_at: Utc::now(),
        })?;
        tracing::debug!(item = %file.id, from = %file.stage, to = %to, "item moved");
        Ok(new_id)
    }

    /// Record an item found on disk in the index. Returns true when the
    /// index did not already know it in this stage.
    pub fn register(&self, file: &ItemFile, kind: ItemKind) -> Result<bool> {
        let known = self
            .index
            .item(&file.id)?
            .is_some_and(|r| r.stage == file.stage && r.kind == kind);
        if known {
            return Ok(false);
        }
        self.index.upsert_item(&ItemRecord {
            id: file.id.clone(),
            stage: file.stage,
            kind,
            created: Some(file.created),
            updated_at: Utc::now(),
        })?;
        Ok(true)
    }

    /// Write a briefing or report under `Briefings/`. Returns `None` in
    /// dry-run mode, where nothing is written.
    pub fn write_briefing(&self, file_name: &str, content: &str) -> Result<Option<PathBuf>> {
        let path = paths::briefings_dir(&self.root).join(file_name);
        if self.is_dry_run() {
            return Ok(None);
        }
        io::atomic_write(&path, content.as_bytes())?;
        Ok(Some(path))
    }

    // -----------------------------------------------------------------------
    // Reconciliation and snapshots
    // -----------------------------------------------------------------------

    /// Rebuild the `items` table from the stage directories.
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        let existing: HashMap<String, ItemRecord> = self
            .index
            .items()?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();

        let mut report = ReconcileReport::default();
        let mut records = Vec::new();
        let now = Utc::now();
        for stage in Stage::all() {
            for file in scan_dir(&paths::stage_dir(&self.root, *stage), *stage)? {
                let (kind, created) = match self.read_item(&file) {
                    Ok(item) => (item.kind(), item.created().or(Some(file.created))),
                    Err(_) => (ItemKind::Other, Some(file.created)),
                };
                match existing.get(&file.id) {
                    None => report.added += 1,
                    Some(prev) if prev.stage != *stage => report.updated += 1,
                    Some(_) => {}
                }
                records.push(ItemRecord {
                    id: file.id,
                    stage: *stage,
                    kind,
                    created,
                    updated_at: now,
                });
            }
        }
        report.removed = existing
            .keys()
            .filter(|id| !records.iter().any(|r| &r.id == *id))
            .count();
        self.index.replace_items(&records)?;
        Ok(report)
    }

    /// Snapshot the active stages with item ages relative to `now`.
    pub fn snapshot(&self, now: DateTime<Utc>) -> Result<VaultSnapshot> {
        let mut stages = BTreeMap::new();
        for stage in Stage::all().iter().copied().filter(|s| !s.is_terminal()) {
            let mut items = Vec::new();
            for file in self.scan_stage(stage)? {
                let created = self
                    .read_item(&file)
                    .ok()
                    .and_then(|i| i.created())
                    .unwrap_or(file.created);
                let age = now.signed_duration_since(created);
                items.push(SnapshotItem {
                    id: file.id,
                    created,
                    age_hours: age.num_seconds().max(0) as f64 / 3600.0,
                });
            }
            stages.insert(stage, items);
        }
        for stage in [Stage::Done, Stage::Rejected] {
            let items = self
                .scan_stage(stage)?
                .into_iter()
                .map(|f| SnapshotItem {
                    id: f.id,
                    created: f.created,
                    age_hours: 0.0,
                })
                .collect();
            stages.insert(stage, items);
        }
        Ok(VaultSnapshot {
            taken_at: now,
            stages,
        })
    }
}

fn record_for(item: &WorkItem) -> ItemRecord {
    ItemRecord {
        id: item.id.clone(),
        stage: item.stage,
        kind: item.kind(),
        created: item.created(),
        updated_at: Utc::now(),
    }
}

fn scan_dir(dir: &Path, stage: Stage) -> Result<Vec<ItemFile>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let Some(id) = paths::item_id_from_path(&path) else {
            continue;
        };
        let meta = match entry.metadata() {
            Ok(m) if m.is_file() => m,
            _ => continue,
        };
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let created = meta.created().unwrap_or(modified);
        files.push(ItemFile {
            id,
            stage,
            path,
            created: DateTime::<Utc>::from(created),
            modified: DateTime::<Utc>::from(modified),
        });
    }
    files.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
    Ok(files)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn live() -> (TempDir, Vault) {
        let dir = TempDir::new().unwrap();
        let vault = Vault::open(dir.path(), ExecutionMode::Live).unwrap();
        (dir, vault)
    }

    fn email(id: &str, stage: Stage) -> WorkItem {
        WorkItem::new(id, stage, "email_reply", "pending", Utc::now()).with_body("hi")
    }

    #[test]
    fn open_missing_root_fails() {
        let dir = TempDir::new().unwrap();
        let err = Vault::open(&dir.path().join("nope"), ExecutionMode::Live)
            .err()
            .unwrap();
        assert!(matches!(err, VaultError::VaultRootMissing(_)));
    }

    #[test]
    fn open_creates_layout() {
        let (dir, _vault) = live();
        for name in ["Needs_Action", "Pending_Approval", "Approved", "Rejected", "Done", "Logs"] {
            assert!(dir.path().join(name).is_dir(), "{name}");
        }
    }

    #[test]
    fn create_item_is_idempotent_across_stages() {
        let (_dir, vault) = live();
        assert!(vault.create_item(&email("EMAIL_REPLY_1", Stage::PendingApproval)).unwrap());
        assert!(!vault.create_item(&email("EMAIL_REPLY_1", Stage::NeedsAction)).unwrap());
        assert_eq!(vault.locate("EMAIL_REPLY_1"), Some(Stage::PendingApproval));
    }

    #[test]
    fn move_item_leaves_exactly_one_copy() {
        let (dir, vault) = live();
        vault.create_item(&email("EMAIL_REPLY_1", Stage::Approved)).unwrap();
        let file = vault.scan_stage(Stage::Approved).unwrap().remove(0);
        let id = vault.move_item(&file, Stage::Done).unwrap();
        assert_eq!(id, "EMAIL_REPLY_1");
        assert!(!dir.path().join("Approved/EMAIL_REPLY_1.md").exists());
        assert!(dir.path().join("Done/EMAIL_REPLY_1.md").exists());
        assert_eq!(vault.index().item(&id).unwrap().unwrap().stage, Stage::Done);
    }

    #[test]
    fn move_collision_gets_suffix() {
        let (dir, vault) = live();
        std::fs::write(dir.path().join("Done/EMAIL_REPLY_1.md"), "old").unwrap();
        std::fs::write(
            dir.path().join("Approved/EMAIL_REPLY_1.md"),
            email("EMAIL_REPLY_1", Stage::Approved).render(),
        )
        .unwrap();
        let file = vault.scan_stage(Stage::Approved).unwrap().remove(0);
        let id = vault.move_item(&file, Stage::Done).unwrap();
        assert_eq!(id, "EMAIL_REPLY_1_1");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("Done/EMAIL_REPLY_1.md")).unwrap(),
            "old"
        );
    }

    #[test]
    fn reconcile_picks_up_external_moves() {
        let (dir, vault) = live();
        vault.create_item(&email("EMAIL_REPLY_1", Stage::PendingApproval)).unwrap();
        std::fs::rename(
            dir.path().join("Pending_Approval/EMAIL_REPLY_1.md"),
            dir.path().join("Approved/EMAIL_REPLY_1.md"),
        )
        .unwrap();
        std::fs::write(dir.path().join("Needs_Action/garbage.md"), "no header").unwrap();
        let report = vault.reconcile().unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(report.added, 1);
        let rec = vault.index().item("EMAIL_REPLY_1").unwrap().unwrap();
        assert_eq!(rec.stage, Stage::Approved);
    }

    #[test]
    fn dry_run_changes_nothing_on_disk() {
        let dir = TempDir::new().unwrap();
        Vault::create_layout(dir.path()).unwrap();
        std::fs::write(
            dir.path().join("Approved/EMAIL_REPLY_1.md"),
            email("EMAIL_REPLY_1", Stage::Approved).render(),
        )
        .unwrap();
        let vault = Vault::open(dir.path(), ExecutionMode::DryRun).unwrap();
        assert!(!dir.path().join(".vault/index.redb").exists());

        let file = vault.scan_stage(Stage::Approved).unwrap().remove(0);
        vault.move_item(&file, Stage::Done).unwrap();
        assert!(dir.path().join("Approved/EMAIL_REPLY_1.md").exists());
        assert!(!dir.path().join("Done/EMAIL_REPLY_1.md").exists());
        // The simulated move hides the file from further Approved scans.
        assert!(vault.scan_stage(Stage::Approved).unwrap().is_empty());

        assert!(vault.create_item(&email("EMAIL_new", Stage::NeedsAction)).unwrap());
        assert!(!dir.path().join("Needs_Action/EMAIL_new.md").exists());
        assert!(vault.write_briefing("x.md", "x").unwrap().is_none());
    }

    #[test]
    fn snapshot_reports_ages_from_header() {
        let (_dir, vault) = live();
        let old = WorkItem::new(
            "EMAIL_REPLY_old",
            Stage::PendingApproval,
            "email_reply",
            "pending",
            Utc::now() - chrono::Duration::hours(30),
        );
        vault.create_item(&old).unwrap();
        vault.create_item(&email("EMAIL_REPLY_new", Stage::PendingApproval)).unwrap();
        let snap = vault.snapshot(Utc::now()).unwrap();
        assert_eq!(snap.count(Stage::PendingApproval), 2);
        let lagging = snap.older_than(Stage::PendingApproval, chrono::Duration::hours(24));
        assert_eq!(lagging.len(), 1);
        assert_eq!(lagging[0].id, "EMAIL_REPLY_old");
    }

    #[test]
    fn transition_moves_then_rewrites_at_destination() {
        let (dir, vault) = live();
        vault.create_item(&email("EMAIL_REPLY_1", Stage::PendingApproval)).unwrap();
        let file = vault.scan_stage(Stage::PendingApproval).unwrap().remove(0);
        let mut item = vault.read_item(&file).unwrap();
        item.header.set("status", "expired");

        let id = vault.transition(&file, &item, Stage::Done).unwrap();
        assert_eq!(id, "EMAIL_REPLY_1");
        assert!(!file.path.exists());
        let text = std::fs::read_to_string(dir.path().join("Done/EMAIL_REPLY_1.md")).unwrap();
        assert!(text.contains("status: expired"));
    }

    #[test]
    fn transition_of_externally_moved_item_leaves_one_copy() {
        let (dir, vault) = live();
        vault.create_item(&email("EMAIL_REPLY_x", Stage::PendingApproval)).unwrap();
        let file = vault.scan_stage(Stage::PendingApproval).unwrap().remove(0);
        let mut item = vault.read_item(&file).unwrap();
        item.header.set("status", "expired");

        // A human approves it between the scan and the transition.
        std::fs::rename(&file.path, dir.path().join("Approved/EMAIL_REPLY_x.md")).unwrap();

        let err = vault.transition(&file, &item, Stage::Done).unwrap_err();
        assert!(matches!(err, VaultError::ItemNotFound(_)));
        let held: Vec<Stage> = Stage::all()
            .iter()
            .copied()
            .filter(|s| paths::item_path(dir.path(), *s, "EMAIL_REPLY_x").exists())
            .collect();
        assert_eq!(held, vec![Stage::Approved]);
        let text = std::fs::read_to_string(dir.path().join("Approved/EMAIL_REPLY_x.md")).unwrap();
        assert!(!text.contains("expired"));
    }

    #[test]
    fn rewrite_does_not_recreate_moved_file() {
        let (dir, vault) = live();
        vault.create_item(&email("EMAIL_REPLY_1", Stage::Approved)).unwrap();
        let file = vault.scan_stage(Stage::Approved).unwrap().remove(0);
        let mut item = vault.read_item(&file).unwrap();
        item.header.set("last_error", "boom");
        std::fs::rename(&file.path, dir.path().join("Rejected/EMAIL_REPLY_1.md")).unwrap();

        let err = vault.rewrite_item(&file, &item).unwrap_err();
        assert!(matches!(err, VaultError::ItemNotFound(_)));
        assert!(!file.path.exists());
    }

    #[test]
    fn scan_follows_creation_order_not_name() {
        let (dir, vault) = live();
        for id in ["EMAIL_c", "EMAIL_a", "EMAIL_b"] {
            std::fs::write(
                dir.path().join(format!("Needs_Action/{id}.md")),
                email(id, Stage::NeedsAction).render(),
            )
            .unwrap();
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        let ids: Vec<String> = vault
            .scan_stage(Stage::NeedsAction)
            .unwrap()
            .into_iter()
            .map(|f| f.id)
            .collect();
        assert_eq!(ids, ["EMAIL_c", "EMAIL_a", "EMAIL_b"]);
    }
}
