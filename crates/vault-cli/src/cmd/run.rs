use anyhow::Context;
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use vault_core::config::{Config, WarnLevel};
use vault_core::types::ExecutionMode;
use vault_core::vault::Vault;
use vault_supervisor::{Orchestrator, SupervisorContext};

// ---------------------------------------------------------------------------
// RunExit: typed non-zero exit codes for unrecoverable startup failures
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum RunExit {
    VaultMissing(PathBuf),
    ConfigInvalid { errors: usize },
    AllUnitsFailed,
}

impl RunExit {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunExit::VaultMissing(_) => 2,
            RunExit::ConfigInvalid { .. } => 3,
            RunExit::AllUnitsFailed => 4,
        }
    }
}

impl std::fmt::Display for RunExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunExit::VaultMissing(root) => {
                write!(f, "vault root {} does not exist or is not a directory", root.display())
            }
            RunExit::ConfigInvalid { errors } => {
                write!(f, "config has {errors} error(s); run `vault config validate`")
            }
            RunExit::AllUnitsFailed => write!(f, "every unit failed fatally; nothing left to run"),
        }
    }
}

impl std::error::Error for RunExit {}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

pub fn run(root: &Path, dry_run: bool) -> anyhow::Result<()> {
    if !root.is_dir() {
        return Err(RunExit::VaultMissing(root.to_path_buf()).into());
    }

    let config = Config::load(root).context("failed to load config")?;
    let mut errors = 0;
    for w in config.validate() {
        match w.level {
            WarnLevel::Warning => tracing::warn!("config: {}", w.message),
            WarnLevel::Error => {
                tracing::error!("config: {}", w.message);
                errors += 1;
            }
        }
    }
    if errors > 0 {
        return Err(RunExit::ConfigInvalid { errors }.into());
    }

    let mode = ExecutionMode::from_dry_run(dry_run);
    let vault = Vault::open(root, mode).context("failed to open vault")?;
    let ctx = SupervisorContext::new(vault, config);
    let orchestrator = Orchestrator::from_config(ctx).context("failed to build units")?;

    println!(
        "Supervising {} ({}) with units: {}",
        root.display(),
        if dry_run { "dry run" } else { "live" },
        orchestrator.unit_names().join(", ")
    );

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(async move {
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(async move {
            wait_for_signal().await;
            tracing::info!("shutdown requested");
            let _ = stop_tx.send(true);
        });
        orchestrator.run(stop_rx).await
    });

    for unit in &report.units {
        if let Some(reason) = &unit.fatal {
            eprintln!("unit {} stopped: {reason}", unit.name);
        }
    }
    if report.all_fatal() {
        return Err(RunExit::AllUnitsFailed.into());
    }
    println!("Stopped{}.", if report.forced { " (forced after grace period)" } else { "" });
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "cannot listen for SIGTERM; Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
