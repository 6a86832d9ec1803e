//! Approval routing: executes human-approved items exactly once.
//!
//! Files in `Approved/` are matched against ordered prefix rules. A matched
//! file is handed to its action collaborator under the router retry policy;
//! only a confirmed success moves it to `Done`. A file whose execution
//! failed stays in `Approved/` with the error recorded and is escalated: it
//! is not retried until someone takes it out of `Approved/`.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use vault_core::audit::{actions, AuditEntry};
use vault_core::config::ApprovalRule;
use vault_core::index::Escalation;
use vault_core::item::WorkItem;
use vault_core::retry::{RetryPolicy, RetryState};
use vault_core::types::Stage;
use vault_core::vault::ItemFile;
use vault_core::VaultError;

use crate::context::SupervisorContext;
use crate::error::{RetryError, UnitError};
use crate::lifecycle::{is_data_error, quarantine, scan};
use crate::process::{self, CommandSpec};
use crate::retry::Retrier;
use crate::unit::Unit;
use crate::Result;

// ─── ActionCollaborator ───────────────────────────────────────────────────

/// Performs the external effect for one approved file. Never moves the
/// file; that is the router's job.
#[async_trait]
pub trait ActionCollaborator: Send + Sync {
    async fn execute(&self, file: &Path, vault_root: &Path) -> Result<()>;
}

/// A collaborator program invoked as `<argv...> --file <path> --vault <root>`.
pub struct CommandAction {
    command: Vec<String>,
    timeout: std::time::Duration,
}

impl CommandAction {
    pub fn new(command: Vec<String>, timeout: std::time::Duration) -> Self {
        Self { command, timeout }
    }
}

#[async_trait]
impl ActionCollaborator for CommandAction {
    async fn execute(&self, file: &Path, vault_root: &Path) -> Result<()> {
        let spec = CommandSpec::from_argv(&self.command, self.timeout)?
            .arg("--file")
            .arg(file.display().to_string())
            .arg("--vault")
            .arg(vault_root.display().to_string())
            .current_dir(vault_root);
        process::run(&spec).await?;
        Ok(())
    }
}

// ─── ApprovalRouter ───────────────────────────────────────────────────────

pub struct ApprovalRouter {
    ctx: Arc<SupervisorContext>,
    rules: Vec<ApprovalRule>,
    collaborators: HashMap<String, Arc<dyn ActionCollaborator>>,
    policy: RetryPolicy,
    /// Ids already reported as unroutable by this router instance.
    unroutable: HashSet<String>,
}

impl ApprovalRouter {
    pub const NAME: &'static str = "approval_router";

    pub fn new(ctx: Arc<SupervisorContext>) -> Self {
        let rules = ctx.config.approval.rules.clone();
        let timeout = ctx.external_timeout();
        let collaborators = rules
            .iter()
            .map(|r| {
                let action: Arc<dyn ActionCollaborator> =
                    Arc::new(CommandAction::new(r.command.clone(), timeout));
                (r.handler.clone(), action)
            })
            .collect();
        let policy = ctx.config.retry.router.clone();
        Self {
            ctx,
            rules,
            collaborators,
            policy,
            unroutable: HashSet::new(),
        }
    }

    /// Replace the collaborator behind `handler`.
    pub fn with_collaborator(mut self, handler: &str, action: Arc<dyn ActionCollaborator>) -> Self {
        self.collaborators.insert(handler.to_string(), action);
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// First rule whose prefix matches `id`.
    pub fn route(&self, id: &str) -> Option<&ApprovalRule> {
        self.rules.iter().find(|r| id.starts_with(&r.prefix))
    }

    /// Forget escalations for items that have left `Approved/`.
    fn release_escalations(&self, present: &HashSet<&str>) {
        let escalations = match self.ctx.vault.index().escalations() {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "cannot read escalations");
                return;
            }
        };
        for esc in escalations {
            if !present.contains(esc.item_id.as_str()) {
                if let Err(e) = self.ctx.vault.index().clear_escalation(&esc.item_id) {
                    tracing::warn!(item = %esc.item_id, error = %e, "cannot clear escalation");
                }
            }
        }
    }

    fn escalate(&self, file: &ItemFile, handler: &str, error: String) {
        let esc = Escalation {
            item_id: file.id.clone(),
            handler: handler.to_string(),
            error: error.clone(),
            at: Utc::now(),
        };
        if let Err(e) = self.ctx.vault.index().record_escalation(&esc) {
            tracing::error!(item = %file.id, error = %e, "cannot record escalation");
        }
        self.ctx.audit().record(
            AuditEntry::failure(Self::NAME, actions::WATCHER_CRASHED, file.file_name(), error.clone())
                .with_param("handler", handler),
        );
        self.ctx.audit().record(
            AuditEntry::failure(Self::NAME, actions::APPROVAL_ESCALATED, file.file_name(), error)
                .with_param("handler", handler),
        );
    }

    /// Move the item to `Done/` stamped `executed`. Fails with
    /// `ItemNotFound` if it already left `Approved/`.
    fn complete(&self, file: &ItemFile, mut item: WorkItem) -> vault_core::Result<String> {
        item.header.set("status", "executed");
        item.header.set("executed_at", Utc::now().to_rfc3339());
        self.ctx.vault.transition(file, &item, Stage::Done)
    }

    async fn dispatch(&self, file: &ItemFile, item: WorkItem, rule: &ApprovalRule) {
        let target = file.file_name();

        if self.ctx.is_dry_run() {
            self.ctx.audit().record(
                AuditEntry::dry_run(Self::NAME, rule.action_type.as_str(), target.as_str())
                    .with_param("handler", rule.handler.as_str()),
            );
            if let Err(e) = self.complete(file, item) {
                tracing::warn!(item = %file.id, error = %e, "simulated move failed");
            }
            self.ctx.audit().record(
                AuditEntry::dry_run(Self::NAME, actions::APPROVAL_EXECUTED, target.as_str())
                    .with_param("handler", rule.handler.as_str()),
            );
            return;
        }

        let Some(collaborator) = self.collaborators.get(&rule.handler) else {
            self.escalate(file, &rule.handler, format!("no collaborator for handler '{}'", rule.handler));
            return;
        };
        let collaborator: &dyn ActionCollaborator = collaborator.as_ref();
        let path = file.path.as_path();
        let root = self.ctx.vault.root();

        let retrier = Retrier {
            policy: &self.policy,
            audit: self.ctx.audit(),
            actor: &rule.handler,
            action_type: &rule.action_type,
            target: &target,
            timeout: self.ctx.external_timeout(),
            stop: self.ctx.stop_signal(),
        };
        let mut state = RetryState::default();
        match retrier
            .run(&mut state, move |_| collaborator.execute(path, root))
            .await
        {
            Ok(()) => match self.complete(file, item) {
                Ok(new_id) => {
                    self.ctx.audit().record(
                        AuditEntry::success(Self::NAME, actions::APPROVAL_EXECUTED, target.as_str())
                            .with_param("handler", rule.handler.as_str())
                            .with_param("moved_to", format!("{}/{new_id}.md", Stage::Done.dir_name())),
                    );
                    tracing::info!(item = %file.id, handler = %rule.handler, "approval executed");
                }
                Err(e) => {
                    // Executed but still in Approved/; escalate so it is not sent twice.
                    self.escalate(
                        file,
                        &rule.handler,
                        format!("executed but could not be moved to Done: {e}"),
                    );
                }
            },
            Err(RetryError::Interrupted { attempts, .. }) => {
                // Not escalated: the next run starts this item over.
                tracing::info!(item = %file.id, attempts, "shutdown before retry; left in Approved");
            }
            Err(err) => {
                let message = match &err {
                    RetryError::Exhausted { last, .. } => last.to_string(),
                    _ => err.to_string(),
                };
                let mut failed = item;
                failed.header.set("last_error", message.split_whitespace().collect::<Vec<_>>().join(" "));
                failed.header.set("failed_at", Utc::now().to_rfc3339());
                match self.ctx.vault.rewrite_item(file, &failed) {
                    Ok(()) => {}
                    Err(VaultError::ItemNotFound(_)) => {
                        tracing::info!(item = %file.id, "left Approved/ during execution; error not written back");
                    }
                    Err(e) => tracing::warn!(item = %file.id, error = %e, "cannot record failure in item"),
                }
                tracing::error!(item = %file.id, handler = %rule.handler, error = %err, "approval escalated");
                self.escalate(file, &rule.handler, err.to_string());
            }
        }
    }
}

#[async_trait]
impl Unit for ApprovalRouter {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn tick(&mut self) -> std::result::Result<(), UnitError> {
        let files = scan(&self.ctx, Self::NAME, Stage::Approved)?;
        let present: HashSet<&str> = files.iter().map(|f| f.id.as_str()).collect();
        self.release_escalations(&present);
        self.unroutable.retain(|id| present.contains(id.as_str()));

        for file in &files {
            match self.ctx.vault.index().escalation(&file.id) {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(item = %file.id, error = %e, "cannot check escalation; skipping");
                    continue;
                }
            }

            let item = match self.ctx.vault.read_item(file) {
                Ok(item) => item,
                Err(e) if is_data_error(&e) => {
                    quarantine(&self.ctx, Self::NAME, file, &e);
                    continue;
                }
                Err(e) => {
                    tracing::warn!(item = %file.id, error = %e, "cannot read approved item");
                    continue;
                }
            };

            let Some(rule) = self.route(&file.id).cloned() else {
                if self.unroutable.insert(file.id.clone()) {
                    self.ctx.audit().record(AuditEntry::failure(
                        Self::NAME,
                        actions::UNROUTABLE_APPROVAL,
                        file.file_name(),
                        "no handler matches this file name",
                    ));
                    tracing::warn!(item = %file.id, "unroutable approval left in place");
                }
                continue;
            };

            if item.status() == "executed" {
                // A previous run executed it but stopped before the move.
                match self.ctx.vault.move_item(file, Stage::Done) {
                    Ok(_) => tracing::info!(item = %file.id, "completed interrupted move"),
                    Err(e) => tracing::warn!(item = %file.id, error = %e, "cannot move executed item"),
                }
                continue;
            }

            self.dispatch(file, item, &rule).await;
        }
        Ok(())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────
