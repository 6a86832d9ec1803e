//! The generic source watcher.
//!
//! A [`Watcher`] owns one [`Source`] and composes it with the vault, the
//! audit log and a retry policy. Each tick:
//!
//! 1. polls the source under the retry policy (`source_poll` entries),
//! 2. skips keys already checkpointed,
//! 3. asks the source to admit or filter each item,
//! 4. writes admitted items into their stage directory, then checkpoints.
//!
//! The checkpoint is written only after the item file, so a crash in
//! between re-delivers the item; the deterministic id turns that into a
//! no-op.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use vault_core::audit::{actions, AuditEntry};
use vault_core::index::Checkpoint;
use vault_core::item::WorkItem;
use vault_core::retry::{RetryPolicy, RetryState};

use crate::context::SupervisorContext;
use crate::error::{RetryError, UnitError};
use crate::retry::Retrier;
use crate::unit::Unit;
use crate::Result;

pub const SOURCE_POLL: &str = "source_poll";

// ─── Source ───────────────────────────────────────────────────────────────

/// One item as delivered by a source, before admission.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SourceItem {
    /// Stable identity within the source; the item id derives from it.
    pub key: String,
    /// Recorded as the `kind` parameter of ingestion audit entries.
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub classification: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Accept(WorkItem),
    Filter { reason: String },
}

#[async_trait]
pub trait Source: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch items currently available. Already-ingested items may be
    /// returned again; the watcher deduplicates by key.
    async fn poll(&self) -> Result<Vec<SourceItem>>;

    /// Turn a source item into a work item, or filter it out.
    fn admit(&self, item: &SourceItem, now: DateTime<Utc>) -> Admission;
}

// ─── Watcher ──────────────────────────────────────────────────────────────

pub struct Watcher<S: Source> {
    source: S,
    ctx: Arc<SupervisorContext>,
    policy: RetryPolicy,
    retry: RetryState,
}

impl<S: Source> Watcher<S> {
    pub fn new(source: S, ctx: Arc<SupervisorContext>) -> Self {
        let policy = ctx.config.retry.watcher.clone();
        Self {
            source,
            ctx,
            policy,
            retry: RetryState::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn retry_state(&self) -> &RetryState {
        &self.retry
    }

    fn ingest(&self, item: &SourceItem, now: DateTime<Utc>) -> Result<()> {
        let name = self.source.name();
        let vault = &self.ctx.vault;
        if vault.index().checkpoint(name, &item.key)?.is_some() {
            return Ok(());
        }

        let item_id = match self.source.admit(item, now) {
            Admission::Filter { reason } => {
                self.ctx.audit().record(
                    self.ctx
                        .effect(name, actions::ITEM_FILTERED, &item.key)
                        .with_param("kind", item.kind.as_str())
                        .with_param("reason", reason.as_str()),
                );
                tracing::debug!(source = name, key = %item.key, %reason, "item filtered");
                String::new()
            }
            Admission::Accept(work) => {
                let created = match vault.create_item(&work) {
                    Ok(c) => c,
                    Err(e) => {
                        self.ctx.audit().record(
                            AuditEntry::failure(name, actions::ACTION_FILE_FAILED, &work.id, e.to_string())
                                .with_param("kind", item.kind.as_str()),
                        );
                        return Err(e.into());
                    }
                };
                if created {
                    self.ctx.audit().record(
                        self.ctx
                            .effect(name, actions::ACTION_FILE_CREATED, format!("{}.md", work.id))
                            .with_param("kind", item.kind.as_str())
                            .with_param("stage", work.stage.dir_name()),
                    );
                    tracing::info!(source = name, item = %work.id, "action file created");
                } else {
                    tracing::debug!(source = name, item = %work.id, "already in vault; skipping");
                }
                work.id
            }
        };

        vault.index().record_checkpoint(&Checkpoint {
            source: name.to_string(),
            key: item.key.clone(),
            item_id,
            seen_at: now,
        })?;
        Ok(())
    }
}

#[async_trait]
impl<S: Source> Unit for Watcher<S> {
    fn name(&self) -> &str {
        self.source.name()
    }

    async fn tick(&mut self) -> std::result::Result<(), UnitError> {
        let Self {
            source,
            ctx,
            policy,
            retry,
        } = &mut *self;
        let name = source.name();
        let retrier = Retrier {
            policy,
            audit: ctx.audit(),
            actor: name,
            action_type: SOURCE_POLL,
            target: name,
            timeout: ctx.external_timeout(),
            stop: ctx.stop_signal(),
        };
        let source_ref: &S = source;
        let items = match retrier.run(retry, move |_| source_ref.poll()).await {
            Ok(items) => items,
            Err(RetryError::Exhausted { attempts, last }) => {
                return Err(UnitError::crashed(
                    name,
                    format!("poll failed {attempts} time(s): {last}"),
                ));
            }
            Err(e @ RetryError::AwaitingAcknowledgement) => {
                return Err(UnitError::crashed(name, e));
            }
            Err(RetryError::Interrupted { .. }) => return Ok(()),
        };

        let now = Utc::now();
        for item in &items {
            if let Err(e) = self.ingest(item, now) {
                tracing::warn!(source = self.source.name(), key = %item.key, error = %e, "ingest failed; will retry next poll");
            }
        }
        Ok(())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;
    use vault_core::audit::AuditResult;
    use vault_core::config::Config;
    use vault_core::types::{ExecutionMode, Stage};
    use vault_core::vault::Vault;

    use crate::SupervisorError;

    struct FakeSource {
        items: Mutex<Vec<SourceItem>>,
        failures_left: AtomicU32,
    }

    impl FakeSource {
        fn new(items: Vec<SourceItem>) -> Self {
            Self {
                items: Mutex::new(items),
                failures_left: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Source for FakeSource {
        fn name(&self) -> &str {
            "fake_watcher"
        }

        async fn poll(&self) -> Result<Vec<SourceItem>> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(SupervisorError::Config("source down".into()));
            }
            Ok(self.items.lock().unwrap().clone())
        }

        fn admit(&self, item: &SourceItem, now: DateTime<Utc>) -> Admission {
            if item.classification.as_deref() == Some("spam") {
                return Admission::Filter {
                    reason: "classification spam".into(),
                };
            }
            Admission::Accept(
                WorkItem::new(
                    format!("EMAIL_{}", item.key),
                    Stage::NeedsAction,
                    "customer_email",
                    "pending",
                    now,
                )
                .with_body(item.body.clone()),
            )
        }
    }

    fn item(key: &str, classification: Option<&str>) -> SourceItem {
        SourceItem {
            key: key.into(),
            kind: "email".into(),
            fields: BTreeMap::new(),
            body: "hello".into(),
            classification: classification.map(str::to_string),
        }
    }

    fn ctx(dir: &TempDir, mode: ExecutionMode) -> Arc<SupervisorContext> {
        let mut cfg = Config::default();
        cfg.retry.watcher = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2));
        SupervisorContext::new(Vault::open(dir.path(), mode).unwrap(), cfg)
    }

    fn today(ctx: &SupervisorContext) -> Vec<AuditEntry> {
        ctx.audit().read_day(Utc::now().date_naive()).entries
    }

    #[tokio::test]
    async fn ingests_once_across_restarts() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir, ExecutionMode::Live);
        let mut w = Watcher::new(FakeSource::new(vec![item("a1", None)]), Arc::clone(&ctx));
        w.tick().await.unwrap();
        w.tick().await.unwrap();
        // A rebuilt watcher shares the persisted checkpoints.
        let mut rebuilt = Watcher::new(FakeSource::new(vec![item("a1", None)]), Arc::clone(&ctx));
        rebuilt.tick().await.unwrap();

        assert!(dir.path().join("Needs_Action/EMAIL_a1.md").exists());
        let created = today(&ctx)
            .into_iter()
            .filter(|e| e.action_type == actions::ACTION_FILE_CREATED)
            .count();
        assert_eq!(created, 1);
    }

    #[tokio::test]
    async fn redelivery_without_checkpoint_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir, ExecutionMode::Live);
        let w = Watcher::new(FakeSource::new(vec![]), Arc::clone(&ctx));
        // The file exists but the checkpoint write never happened.
        let now = Utc::now();
        if let Admission::Accept(work) = w.source.admit(&item("a2", None), now) {
            ctx.vault.create_item(&work).unwrap();
        }
        w.ingest(&item("a2", None), now).unwrap();
        let created = today(&ctx)
            .into_iter()
            .filter(|e| e.action_type == actions::ACTION_FILE_CREATED)
            .count();
        assert_eq!(created, 0);
        assert!(ctx.vault.index().checkpoint("fake_watcher", "a2").unwrap().is_some());
    }

    #[tokio::test]
    async fn filtered_items_are_audited_with_kind() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir, ExecutionMode::Live);
        let mut w = Watcher::new(FakeSource::new(vec![item("s1", Some("spam"))]), Arc::clone(&ctx));
        w.tick().await.unwrap();
        let filtered: Vec<_> = today(&ctx)
            .into_iter()
            .filter(|e| e.action_type == actions::ITEM_FILTERED)
            .collect();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].param_str("kind"), Some("email"));
        assert!(!dir.path().join("Needs_Action/EMAIL_s1.md").exists());
    }

    #[tokio::test]
    async fn transient_poll_failures_are_retried() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir, ExecutionMode::Live);
        let source = FakeSource::new(vec![item("b1", None)]);
        source.failures_left.store(2, Ordering::SeqCst);
        let mut w = Watcher::new(source, Arc::clone(&ctx));
        w.tick().await.unwrap();
        assert!(dir.path().join("Needs_Action/EMAIL_b1.md").exists());
        let polls: Vec<_> = today(&ctx)
            .into_iter()
            .filter(|e| e.action_type == SOURCE_POLL)
            .map(|e| e.result)
            .collect();
        assert_eq!(polls, [AuditResult::Error, AuditResult::Error, AuditResult::Success]);
    }

    #[tokio::test]
    async fn exhausted_poll_crashes_the_unit() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir, ExecutionMode::Live);
        let source = FakeSource::new(vec![]);
        source.failures_left.store(10, Ordering::SeqCst);
        let mut w = Watcher::new(source, Arc::clone(&ctx));
        let err = w.tick().await.unwrap_err();
        assert!(matches!(err, UnitError::Crashed { .. }));
        assert!(w.retry_state().is_exhausted());
    }

    #[tokio::test]
    async fn dry_run_writes_nothing_but_logs() {
        let dir = TempDir::new().unwrap();
        Vault::create_layout(dir.path()).unwrap();
        let ctx = ctx(&dir, ExecutionMode::DryRun);
        let mut w = Watcher::new(FakeSource::new(vec![item("c1", None)]), Arc::clone(&ctx));
        w.tick().await.unwrap();
        w.tick().await.unwrap();
        assert!(!dir.path().join("Needs_Action/EMAIL_c1.md").exists());
        let created: Vec<_> = today(&ctx)
            .into_iter()
            .filter(|e| e.action_type == actions::ACTION_FILE_CREATED)
            .collect();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].result, AuditResult::DryRun);
    }
}
