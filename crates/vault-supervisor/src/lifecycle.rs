//! Units that watch the vault itself rather than an outside source: the
//! Needs_Action monitor and the approval expiry sweeper.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use vault_core::audit::actions;
use vault_core::types::Stage;
use vault_core::vault::ItemFile;
use vault_core::VaultError;

use crate::context::SupervisorContext;
use crate::error::UnitError;
use crate::unit::Unit;

// ─── Shared helpers ───────────────────────────────────────────────────────

/// Header problems that no retry will fix.
pub(crate) fn is_data_error(e: &VaultError) -> bool {
    matches!(
        e,
        VaultError::MalformedHeader { .. } | VaultError::MissingHeaderKey { .. }
    )
}

/// List a stage for a unit tick. A vanished vault root is fatal; any other
/// listing failure crashes the unit so it gets restarted.
pub(crate) fn scan(ctx: &SupervisorContext, unit: &str, stage: Stage) -> Result<Vec<ItemFile>, UnitError> {
    if !ctx.vault.root().is_dir() {
        return Err(UnitError::Fatal {
            unit: unit.to_string(),
            reason: format!("vault root {} is gone", ctx.vault.root().display()),
        });
    }
    ctx.vault
        .scan_stage(stage)
        .map_err(|e| UnitError::crashed(unit, format!("cannot list {}: {e}", stage.dir_name())))
}

/// Move an item with an unreadable header out of the lifecycle.
pub(crate) fn quarantine(ctx: &SupervisorContext, actor: &str, file: &ItemFile, reason: &VaultError) {
    match ctx.vault.move_item(file, Stage::Quarantine) {
        Ok(_) => {
            ctx.audit().record(
                ctx.effect(actor, actions::ITEM_QUARANTINED, file.file_name())
                    .with_param("from", file.stage.dir_name())
                    .with_param("reason", reason.to_string()),
            );
            tracing::warn!(item = %file.id, from = %file.stage, error = %reason, "item quarantined");
        }
        Err(e) => {
            tracing::error!(item = %file.id, error = %e, "failed to quarantine malformed item");
        }
    }
}

/// Suggested collaborator skill for a Needs_Action item, by id prefix.
pub fn route_skill(id: &str) -> &'static str {
    const ROUTES: &[(&str, &str)] = &[
        ("EMAIL_", "email-responder"),
        ("NEW_ORDERS_", "order-reader"),
        ("ORDERS_", "order-reader"),
        ("LINKEDIN_", "linkedin-poster"),
        ("PLAN_", "plan-creator"),
    ];
    ROUTES
        .iter()
        .find(|(prefix, _)| id.starts_with(prefix))
        .map_or("unknown", |(_, skill)| skill)
}

// ─── NeedsActionMonitor ───────────────────────────────────────────────────

/// Notices new Needs_Action items, whoever wrote them, and announces them
/// with a suggested skill.
pub struct NeedsActionMonitor {
    ctx: Arc<SupervisorContext>,
    seen: HashSet<String>,
}

impl NeedsActionMonitor {
    pub const NAME: &'static str = "needs_action_monitor";

    pub fn new(ctx: Arc<SupervisorContext>) -> Self {
        Self {
            ctx,
            seen: HashSet::new(),
        }
    }
}

#[async_trait]
impl Unit for NeedsActionMonitor {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn tick(&mut self) -> Result<(), UnitError> {
        let files = scan(&self.ctx, Self::NAME, Stage::NeedsAction)?;
        let present: HashSet<String> = files.iter().map(|f| f.id.clone()).collect();
        self.seen.retain(|id| present.contains(id));

        for file in files {
            if self.seen.contains(&file.id) {
                continue;
            }
            let item = match self.ctx.vault.read_item(&file) {
                Ok(item) => item,
                Err(e) if is_data_error(&e) => {
                    quarantine(&self.ctx, Self::NAME, &file, &e);
                    continue;
                }
                Err(e) => {
                    tracing::warn!(item = %file.id, error = %e, "cannot read item; will retry");
                    continue;
                }
            };
            if let Err(e) = self.ctx.vault.register(&file, item.kind()) {
                tracing::warn!(item = %file.id, error = %e, "index update failed");
            }
            let skill = route_skill(&file.id);
            self.ctx.audit().record(
                vault_core::audit::AuditEntry::success(Self::NAME, actions::FILE_DETECTED, file.file_name())
                    .with_param("skill", skill)
                    .with_param("kind", item.kind().as_str()),
            );
            tracing::info!(item = %file.id, skill, "new item in Needs_Action");
            self.seen.insert(file.id);
        }
        Ok(())
    }
}

// ─── ExpirySweeper ────────────────────────────────────────────────────────

/// Retires Pending_Approval items nobody acted on in time. Expired items go
/// to Done marked `expired`; they are never executed.
pub struct ExpirySweeper {
    ctx: Arc<SupervisorContext>,
}

impl ExpirySweeper {
    pub const NAME: &'static str = "expiry_sweeper";

    pub fn new(ctx: Arc<SupervisorContext>) -> Self {
        Self { ctx }
    }

    fn sweep(&self, file: &ItemFile, now: DateTime<Utc>) -> vault_core::Result<bool> {
        let mut item = self.ctx.vault.read_item(file)?;
        let lag = self.ctx.config.thresholds.approval_lag();
        let deadline = item
            .expires()
            .or_else(|| item.created().map(|c| c + lag))
            .unwrap_or(file.modified + lag);
        if now < deadline {
            return Ok(false);
        }

        item.header.set("status", "expired");
        item.header.set("expired_at", now.to_rfc3339());
        let new_id = self.ctx.vault.transition(file, &item, Stage::Done)?;
        self.ctx.audit().record(
            self.ctx
                .effect(Self::NAME, actions::APPROVAL_EXPIRED, file.file_name())
                .with_param("deadline", deadline.to_rfc3339())
                .with_param("moved_to", format!("{}/{new_id}.md", Stage::Done.dir_name())),
        );
        tracing::info!(item = %file.id, %deadline, "approval expired");
        Ok(true)
    }
}

#[async_trait]
impl Unit for ExpirySweeper {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn tick(&mut self) -> Result<(), UnitError> {
        let now = Utc::now();
        for file in scan(&self.ctx, Self::NAME, Stage::PendingApproval)? {
            match self.sweep(&file, now) {
                Ok(_) => {}
                Err(e) if is_data_error(&e) => quarantine(&self.ctx, Self::NAME, &file, &e),
                Err(VaultError::ItemNotFound(_)) => {
                    tracing::info!(item = %file.id, "left Pending_Approval before expiry; skipped");
                }
                Err(e) => tracing::warn!(item = %file.id, error = %e, "expiry check failed"),
            }
        }
        Ok(())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;
    use vault_core::audit::{AuditEntry, AuditResult};
    use vault_core::config::Config;
    use vault_core::item::WorkItem;
    use vault_core::types::ExecutionMode;
    use vault_core::vault::Vault;

    fn ctx(dir: &TempDir, mode: ExecutionMode) -> Arc<SupervisorContext> {
        Vault::create_layout(dir.path()).unwrap();
        SupervisorContext::new(Vault::open(dir.path(), mode).unwrap(), Config::default())
    }

    fn entries(ctx: &SupervisorContext, action: &str) -> Vec<AuditEntry> {
        ctx.audit()
            .read_day(Utc::now().date_naive())
            .entries
            .into_iter()
            .filter(|e| e.action_type == action)
            .collect()
    }

    fn write(dir: &TempDir, stage: &str, name: &str, text: &str) {
        std::fs::write(dir.path().join(stage).join(name), text).unwrap();
    }

    #[test]
    fn skill_routing_by_prefix() {
        assert_eq!(route_skill("EMAIL_abc"), "email-responder");
        assert_eq!(route_skill("NEW_ORDERS_batch"), "order-reader");
        assert_eq!(route_skill("ORDERS_x"), "order-reader");
        assert_eq!(route_skill("LINKEDIN_post"), "linkedin-poster");
        assert_eq!(route_skill("PLAN_q3"), "plan-creator");
        assert_eq!(route_skill("MISC_1"), "unknown");
    }

    #[tokio::test]
    async fn monitor_announces_each_item_once() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir, ExecutionMode::Live);
        let mut monitor = NeedsActionMonitor::new(Arc::clone(&ctx));
        write(
            &dir,
            "Needs_Action",
            "EMAIL_1.md",
            "---\ntype: customer_email\ncreated: 2026-01-01T00:00:00Z\nstatus: pending\n---\nHi\n",
        );
        monitor.tick().await.unwrap();
        monitor.tick().await.unwrap();

        let detected = entries(&ctx, actions::FILE_DETECTED);
        assert_eq!(detected.len(), 1);
        assert_eq!(detected[0].param_str("skill"), Some("email-responder"));
    }

    #[tokio::test]
    async fn malformed_item_is_quarantined() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir, ExecutionMode::Live);
        let mut monitor = NeedsActionMonitor::new(Arc::clone(&ctx));
        write(&dir, "Needs_Action", "BROKEN.md", "no header here\n");
        monitor.tick().await.unwrap();

        assert!(!dir.path().join("Needs_Action/BROKEN.md").exists());
        assert!(dir.path().join("Quarantine/BROKEN.md").exists());
        assert_eq!(entries(&ctx, actions::ITEM_QUARANTINED).len(), 1);
        assert_eq!(ctx.vault.locate("BROKEN"), Some(Stage::Quarantine));
    }

    #[tokio::test]
    async fn overdue_approval_expires_to_done() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir, ExecutionMode::Live);
        let old = Utc::now() - Duration::hours(30);
        let item = WorkItem::new("EMAIL_REPLY_old", Stage::PendingApproval, "email_reply", "pending_approval", old);
        ctx.vault.create_item(&item).unwrap();
        let fresh = WorkItem::new(
            "EMAIL_REPLY_new",
            Stage::PendingApproval,
            "email_reply",
            "pending_approval",
            Utc::now(),
        );
        ctx.vault.create_item(&fresh).unwrap();

        ExpirySweeper::new(Arc::clone(&ctx)).tick().await.unwrap();

        let done = dir.path().join("Done/EMAIL_REPLY_old.md");
        let text = std::fs::read_to_string(&done).unwrap();
        assert!(text.contains("status: expired"));
        assert!(text.contains("expired_at:"));
        assert!(dir.path().join("Pending_Approval/EMAIL_REPLY_new.md").exists());
        let expired = entries(&ctx, actions::APPROVAL_EXPIRED);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].target, "EMAIL_REPLY_old.md");
        assert!(entries(&ctx, actions::APPROVAL_EXECUTED).is_empty());
    }

    #[tokio::test]
    async fn approval_during_sweep_is_not_expired() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir, ExecutionMode::Live);
        let old = Utc::now() - Duration::hours(30);
        let item = WorkItem::new("EMAIL_REPLY_x", Stage::PendingApproval, "email_reply", "pending_approval", old);
        ctx.vault.create_item(&item).unwrap();
        let file = ctx.vault.scan_stage(Stage::PendingApproval).unwrap().remove(0);

        // Approved by a human after the scan, before the sweep acts.
        std::fs::rename(&file.path, dir.path().join("Approved/EMAIL_REPLY_x.md")).unwrap();

        let sweeper = ExpirySweeper::new(Arc::clone(&ctx));
        let err = sweeper.sweep(&file, Utc::now()).unwrap_err();
        assert!(matches!(err, VaultError::ItemNotFound(_)));
        assert!(!dir.path().join("Pending_Approval/EMAIL_REPLY_x.md").exists());
        assert!(!dir.path().join("Done/EMAIL_REPLY_x.md").exists());
        let approved = std::fs::read_to_string(dir.path().join("Approved/EMAIL_REPLY_x.md")).unwrap();
        assert!(approved.contains("status: pending_approval"));
        assert!(entries(&ctx, actions::APPROVAL_EXPIRED).is_empty());
    }

    #[tokio::test]
    async fn monitor_announces_in_creation_order() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir, ExecutionMode::Live);
        for name in ["EMAIL_z", "PLAN_m", "EMAIL_a"] {
            write(
                &dir,
                "Needs_Action",
                &format!("{name}.md"),
                "---\ntype: customer_email\ncreated: 2026-01-01T00:00:00Z\nstatus: pending\n---\n",
            );
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        NeedsActionMonitor::new(Arc::clone(&ctx)).tick().await.unwrap();

        let order: Vec<String> = entries(&ctx, actions::FILE_DETECTED)
            .into_iter()
            .map(|e| e.target)
            .collect();
        assert_eq!(order, ["EMAIL_z.md", "PLAN_m.md", "EMAIL_a.md"]);
    }

    #[tokio::test]
    async fn explicit_expires_wins_over_lag() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir, ExecutionMode::Live);
        let mut item = WorkItem::new("LINKEDIN_soon", Stage::PendingApproval, "linkedin_post", "pending", Utc::now());
        item.header.set("expires", (Utc::now() - Duration::minutes(1)).to_rfc3339());
        ctx.vault.create_item(&item).unwrap();

        ExpirySweeper::new(Arc::clone(&ctx)).tick().await.unwrap();
        assert!(dir.path().join("Done/LINKEDIN_soon.md").exists());
    }

    #[tokio::test]
    async fn dry_run_expiry_leaves_files_alone() {
        let dir = TempDir::new().unwrap();
        let old = Utc::now() - Duration::hours(30);
        let item = WorkItem::new("EMAIL_REPLY_old", Stage::PendingApproval, "email_reply", "pending", old);
        Vault::create_layout(dir.path()).unwrap();
        std::fs::write(
            dir.path().join("Pending_Approval/EMAIL_REPLY_old.md"),
            item.render(),
        )
        .unwrap();
        let ctx = ctx(&dir, ExecutionMode::DryRun);
        let mut sweeper = ExpirySweeper::new(Arc::clone(&ctx));
        sweeper.tick().await.unwrap();
        sweeper.tick().await.unwrap();

        assert!(dir.path().join("Pending_Approval/EMAIL_REPLY_old.md").exists());
        assert!(!dir.path().join("Done/EMAIL_REPLY_old.md").exists());
        let expired = entries(&ctx, actions::APPROVAL_EXPIRED);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].result, AuditResult::DryRun);
    }

    #[tokio::test]
    async fn missing_root_is_fatal() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir, ExecutionMode::Live);
        let mut sweeper = ExpirySweeper::new(Arc::clone(&ctx));
        let root = dir.path().to_path_buf();
        drop(dir);
        assert!(!root.exists());
        assert!(matches!(sweeper.tick().await, Err(UnitError::Fatal { .. })));
    }
}
