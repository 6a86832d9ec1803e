use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use vault_core::audit::{AuditEntry, AuditLog};
use vault_core::config::Config;
use vault_core::types::ExecutionMode;
use vault_core::vault::Vault;

/// Everything a unit needs, handed over at construction. The execution
/// mode travels with the vault handle.
pub struct SupervisorContext {
    pub vault: Arc<Vault>,
    pub config: Arc<Config>,
    stop: watch::Sender<bool>,
}

impl SupervisorContext {
    pub fn new(vault: Vault, config: Config) -> Arc<Self> {
        Arc::new(Self {
            vault: Arc::new(vault),
            config: Arc::new(config),
            stop: watch::Sender::new(false),
        })
    }

    /// Receiver that turns true once shutdown has been requested. Units use
    /// it to cut retry backoff short; ticks themselves still run to the end.
    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    pub fn request_stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn mode(&self) -> ExecutionMode {
        self.vault.mode()
    }

    pub fn is_dry_run(&self) -> bool {
        self.vault.is_dry_run()
    }

    pub fn audit(&self) -> &AuditLog {
        self.vault.audit()
    }

    pub fn external_timeout(&self) -> Duration {
        self.config.supervisor.external_timeout()
    }

    /// Entry for an effect that just happened, or would have in dry-run.
    pub fn effect(
        &self,
        actor: impl Into<String>,
        action_type: impl Into<String>,
        target: impl Into<String>,
    ) -> AuditEntry {
        if self.is_dry_run() {
            AuditEntry::dry_run(actor, action_type, target)
        } else {
            AuditEntry::success(actor, action_type, target)
        }
    }
}
