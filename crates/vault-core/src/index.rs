//! Embedded item index using redb.
//!
//! # Tables
//!
//! All values are JSON-encoded; keys are UTF-8 strings.
//!
//! | table         | key                      | value           |
//! |---------------|--------------------------|-----------------|
//! | `items`       | item id                  | [`ItemRecord`]  |
//! | `checkpoints` | `source` `\x1f` `key`    | [`Checkpoint`]  |
//! | `jobs`        | job name                 | [`JobRecord`]   |
//! | `escalations` | item id                  | [`Escalation`]  |
//!
//! The stage directories stay the ground truth. `items` is a mirror kept in
//! step by [`crate::vault::Vault`] and rebuilt by reconciliation on open,
//! so a crash between a rename and an index write heals on the next start.

use std::path::Path;

use chrono::{DateTime, Utc};
use redb::backends::InMemoryBackend;
use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};
use crate::types::{ItemKind, Stage};

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

const ITEMS: JsonTable = TableDefinition::new("items");
const CHECKPOINTS: JsonTable = TableDefinition::new("checkpoints");
const JOBS: JsonTable = TableDefinition::new("jobs");
const ESCALATIONS: JsonTable = TableDefinition::new("escalations");

const ALL_TABLES: [JsonTable; 4] = [ITEMS, CHECKPOINTS, JOBS, ESCALATIONS];

fn checkpoint_key(source: &str, key: &str) -> String {
    format!("{source}\u{1f}{key}")
}

fn idx<E: std::fmt::Display>(e: E) -> VaultError {
    VaultError::Index(e.to_string())
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub id: String,
    pub stage: Stage,
    pub kind: ItemKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Marks a source item as ingested. Written only after the item file is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub source: String,
    pub key: String,
    pub item_id: String,
    pub seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub name: String,
    pub last_fired: DateTime<Utc>,
    pub succeeded: bool,
}

/// An approval whose handler exhausted its retries. The router leaves it
/// alone until a human moves the file out of `Approved`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub item_id: String,
    pub handler: String,
    pub error: String,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// ItemIndex
// ---------------------------------------------------------------------------

pub struct ItemIndex {
    db: Database,
}

impl ItemIndex {
    /// Open or create the index file at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(idx)?;
        Self::init(db)
    }

    /// An index that lives only in memory. Used for dry runs.
    pub fn in_memory() -> Result<Self> {
        let db = Database::builder()
            .create_with_backend(InMemoryBackend::new())
            .map_err(idx)?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self> {
        // Create every table up front so read transactions never miss one.
        let wt = db.begin_write().map_err(idx)?;
        for def in ALL_TABLES {
            wt.open_table(def).map_err(idx)?;
        }
        wt.commit().map_err(idx)?;
        Ok(Self { db })
    }

    // -- generic JSON helpers ---------------------------------------------

    fn get<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> Result<Option<T>> {
        let rt = self.db.begin_read().map_err(idx)?;
        let table = rt.open_table(def).map_err(idx)?;
        let Some(guard) = table.get(key).map_err(idx)? else {
            return Ok(None);
        };
        let value = serde_json::from_slice(guard.value()).map_err(idx)?;
        Ok(Some(value))
    }

    fn put<T: Serialize>(&self, def: JsonTable, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value).map_err(idx)?;
        let wt = self.db.begin_write().map_err(idx)?;
        {
            let mut table = wt.open_table(def).map_err(idx)?;
            table.insert(key, bytes.as_slice()).map_err(idx)?;
        }
        wt.commit().map_err(idx)?;
        Ok(())
    }

    fn delete(&self, def: JsonTable, key: &str) -> Result<bool> {
        let wt = self.db.begin_write().map_err(idx)?;
        let existed = {
            let mut table = wt.open_table(def).map_err(idx)?;
            let removed = table.remove(key).map_err(idx)?;
            removed.is_some()
        };
        wt.commit().map_err(idx)?;
        Ok(existed)
    }

    fn list<T: DeserializeOwned>(&self, def: JsonTable) -> Result<Vec<T>> {
        let rt = self.db.begin_read().map_err(idx)?;
        let table = rt.open_table(def).map_err(idx)?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(idx)? {
            let (_, v) = entry.map_err(idx)?;
            out.push(serde_json::from_slice(v.value()).map_err(idx)?);
        }
        Ok(out)
    }

    // -- items --------------------------------------------------------------

    pub fn item(&self, id: &str) -> Result<Option<ItemRecord>> {
        self.get(ITEMS, id)
    }

    pub fn upsert_item(&self, record: &ItemRecord) -> Result<()> {
        self.put(ITEMS, &record.id, record)
    }

    pub fn remove_item(&self, id: &str) -> Result<bool> {
        self.delete(ITEMS, id)
    }

    /// All item records, ordered by id.
    pub fn items(&self) -> Result<Vec<ItemRecord>> {
        self.list(ITEMS)
    }

    /// Replace the whole `items` table in one transaction.
    pub fn replace_items(&self, records: &[ItemRecord]) -> Result<()> {
        let wt = self.db.begin_write().map_err(idx)?;
        {
            let mut table = wt.open_table(ITEMS).map_err(idx)?;
            let mut stale = Vec::new();
            for entry in table.iter().map_err(idx)? {
                let (k, _) = entry.map_err(idx)?;
                stale.push(k.value().to_string());
            }
            for key in &stale {
                table.remove(key.as_str()).map_err(idx)?;
            }
            for record in records {
                let bytes = serde_json::to_vec(record).map_err(idx)?;
                table
                    .insert(record.id.as_str(), bytes.as_slice())
                    .map_err(idx)?;
            }
        }
        wt.commit().map_err(idx)?;
        Ok(())
    }

    // -- checkpoints ----------------------------------------------------------

    pub fn checkpoint(&self, source: &str, key: &str) -> Result<Option<Checkpoint>> {
        self.get(CHECKPOINTS, &checkpoint_key(source, key))
    }

    pub fn record_checkpoint(&self, cp: &Checkpoint) -> Result<()> {
        self.put(CHECKPOINTS, &checkpoint_key(&cp.source, &cp.key), cp)
    }

    // -- jobs ----------------------------------------------------------------

    pub fn job(&self, name: &str) -> Result<Option<JobRecord>> {
        self.get(JOBS, name)
    }

    pub fn record_job(&self, record: &JobRecord) -> Result<()> {
        self.put(JOBS, &record.name, record)
    }

    // -- escalations ---------------------------------------------------------

    pub fn escalation(&self, item_id: &str) -> Result<Option<Escalation>> {
        self.get(ESCALATIONS, item_id)
    }

    pub fn record_escalation(&self, e: &Escalation) -> Result<()> {
        self.put(ESCALATIONS, &e.item_id, e)
    }

    pub fn clear_escalation(&self, item_id: &str) -> Result<bool> {
        self.delete(ESCALATIONS, item_id)
    }

    pub fn escalations(&self) -> Result<Vec<Escalation>> {
        self.list(ESCALATIONS)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
