//! Runs every unit on its own task and restarts only the one that crashed.
//!
//! Each unit gets a supervision loop: build the unit, tick it until it
//! stops, and on a crash or panic wait out a cooldown (doubling up to the
//! configured maximum) before building a fresh instance. A fatal error ends
//! that unit's supervision without touching the others.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinSet;
use vault_core::audit::{actions, AuditEntry};
use vault_core::schedule::jobs_from_config;

use crate::context::SupervisorContext;
use crate::error::UnitError;
use crate::lifecycle::{ExpirySweeper, NeedsActionMonitor};
use crate::router::ApprovalRouter;
use crate::scheduler::Scheduler;
use crate::sources::{CommandSource, DropFolderSource};
use crate::unit::{run_loop, Unit};
use crate::watcher::Watcher;
use crate::Result;

pub const ORCHESTRATOR: &str = "orchestrator";

// ─── UnitSpec ─────────────────────────────────────────────────────────────

pub type UnitFactory = Box<dyn Fn() -> Result<Box<dyn Unit>> + Send + Sync>;

/// How to build one unit and how often to tick it. The factory is called
/// again for every restart, so a crashed unit never reuses its state.
pub struct UnitSpec {
    pub name: String,
    pub interval: Duration,
    pub factory: UnitFactory,
}

impl UnitSpec {
    pub fn new(
        name: impl Into<String>,
        interval: Duration,
        factory: impl Fn() -> Result<Box<dyn Unit>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            interval,
            factory: Box::new(factory),
        }
    }
}

/// How one unit's supervision ended.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitReport {
    pub name: String,
    pub restarts: u32,
    pub fatal: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    pub units: Vec<UnitReport>,
    /// True when some unit did not stop within the shutdown grace period.
    pub forced: bool,
}

impl RunReport {
    /// Every unit died of a fatal error; nothing was left running.
    pub fn all_fatal(&self) -> bool {
        !self.units.is_empty() && self.units.iter().all(|u| u.fatal.is_some())
    }
}

// ─── Orchestrator ─────────────────────────────────────────────────────────

pub struct Orchestrator {
    ctx: Arc<SupervisorContext>,
    units: Vec<UnitSpec>,
    cooldown: Duration,
    max_cooldown: Duration,
    grace: Duration,
}

impl Orchestrator {
    pub fn new(ctx: Arc<SupervisorContext>) -> Self {
        let sup = &ctx.config.supervisor;
        let (cooldown, max_cooldown, grace) = (sup.restart_cooldown(), sup.max_cooldown(), sup.shutdown_grace());
        Self {
            ctx,
            units: Vec::new(),
            cooldown,
            max_cooldown,
            grace,
        }
    }

    /// The standard unit set: one watcher per configured source, the
    /// Needs_Action monitor, the expiry sweeper, the approval router and
    /// the scheduler.
    pub fn from_config(ctx: Arc<SupervisorContext>) -> Result<Self> {
        let cfg = Arc::clone(&ctx.config);
        let sup = &cfg.supervisor;
        let root = ctx.vault.root().to_path_buf();
        let mut orch = Self::new(Arc::clone(&ctx));

        for df in &cfg.sources.drop_folders {
            let (ctx, df, root) = (Arc::clone(&ctx), df.clone(), root.clone());
            orch = orch.with_unit(UnitSpec::new(
                df.name.clone(),
                Duration::from_secs(df.poll_interval_secs),
                move || {
                    let source = DropFolderSource::new(df.clone(), &root);
                    Ok(Box::new(Watcher::new(source, Arc::clone(&ctx))) as Box<dyn Unit>)
                },
            ));
        }

        for poller in &cfg.sources.pollers {
            // Fail at startup rather than on every restart.
            CommandSource::new(poller.clone(), &root, sup.external_timeout())?;
            let (ctx, poller, root) = (Arc::clone(&ctx), poller.clone(), root.clone());
            orch = orch.with_unit(UnitSpec::new(
                poller.name.clone(),
                Duration::from_secs(poller.poll_interval_secs),
                move || {
                    let source = CommandSource::new(poller.clone(), &root, ctx.external_timeout())?;
                    Ok(Box::new(Watcher::new(source, Arc::clone(&ctx))) as Box<dyn Unit>)
                },
            ));
        }

        let lifecycle = Duration::from_secs(sup.lifecycle_poll_secs);
        let c = Arc::clone(&ctx);
        orch = orch.with_unit(UnitSpec::new(NeedsActionMonitor::NAME, lifecycle, move || {
            Ok(Box::new(NeedsActionMonitor::new(Arc::clone(&c))) as Box<dyn Unit>)
        }));
        let c = Arc::clone(&ctx);
        orch = orch.with_unit(UnitSpec::new(ExpirySweeper::NAME, lifecycle, move || {
            Ok(Box::new(ExpirySweeper::new(Arc::clone(&c))) as Box<dyn Unit>)
        }));
        let c = Arc::clone(&ctx);
        orch = orch.with_unit(UnitSpec::new(ApprovalRouter::NAME, Duration::from_secs(sup.router_poll_secs), move || {
            Ok(Box::new(ApprovalRouter::new(Arc::clone(&c))) as Box<dyn Unit>)
        }));

        jobs_from_config(&cfg.schedule)?;
        let c = Arc::clone(&ctx);
        orch = orch.with_unit(UnitSpec::new(Scheduler::NAME, Duration::from_secs(sup.scheduler_tick_secs), move || {
            Ok(Box::new(Scheduler::new(Arc::clone(&c))?) as Box<dyn Unit>)
        }));

        Ok(orch)
    }

    pub fn with_unit(mut self, spec: UnitSpec) -> Self {
        self.units.push(spec);
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration, max_cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self.max_cooldown = max_cooldown.max(cooldown);
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn unit_names(&self) -> Vec<&str> {
        self.units.iter().map(|u| u.name.as_str()).collect()
    }

    /// Run until `shutdown` turns true (or its sender is dropped), or until
    /// every unit has ended on its own.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> RunReport {
        let Self {
            ctx,
            units,
            cooldown,
            max_cooldown,
            grace,
        } = self;

        ctx.audit().record(
            AuditEntry::success(ORCHESTRATOR, actions::ORCHESTRATOR_STARTED, ctx.vault.root().display().to_string())
                .with_param("dry_run", ctx.is_dry_run())
                .with_param("units", units.len()),
        );
        tracing::info!(units = units.len(), dry_run = ctx.is_dry_run(), "orchestrator started");

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut set = JoinSet::new();
        for spec in units {
            let sup = Supervision {
                ctx: Arc::clone(&ctx),
                cooldown,
                max_cooldown,
                stop: stop_rx.clone(),
            };
            set.spawn(sup.supervise(spec));
        }

        let mut report = RunReport::default();
        let stop_requested = *shutdown.borrow();
        if !stop_requested {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    joined = set.join_next() => match joined {
                        Some(Ok(unit)) => report.units.push(unit),
                        Some(Err(e)) => tracing::error!(error = %e, "supervision task failed"),
                        None => {
                            tracing::warn!("every unit has ended");
                            break;
                        }
                    },
                }
            }
        }

        let _ = stop_tx.send(true);
        ctx.request_stop();
        let drained = tokio::time::timeout(grace, async {
            let mut rest = Vec::new();
            while let Some(joined) = set.join_next().await {
                if let Ok(unit) = joined {
                    rest.push(unit);
                }
            }
            rest
        })
        .await;
        match drained {
            Ok(rest) => report.units.extend(rest),
            Err(_) => {
                tracing::warn!(grace_secs = grace.as_secs(), "units did not stop in time; aborting");
                set.abort_all();
                report.forced = true;
            }
        }

        ctx.audit().record(
            AuditEntry::success(ORCHESTRATOR, actions::ORCHESTRATOR_STOPPED, ctx.vault.root().display().to_string())
                .with_param("forced", report.forced),
        );
        tracing::info!(forced = report.forced, "orchestrator stopped");
        report
    }
}

// ─── Supervision ──────────────────────────────────────────────────────────

struct Supervision {
    ctx: Arc<SupervisorContext>,
    cooldown: Duration,
    max_cooldown: Duration,
    stop: watch::Receiver<bool>,
}

impl Supervision {
    fn crashed(&self, name: &str, reason: &str, fatal: bool, restart_in: Option<Duration>) {
        let mut entry = AuditEntry::failure(name, actions::WATCHER_CRASHED, name, reason).with_param("fatal", fatal);
        if let Some(d) = restart_in {
            entry = entry.with_param("restart_in_secs", d.as_secs_f64());
        }
        self.ctx.audit().record(entry);
    }

    async fn supervise(mut self, spec: UnitSpec) -> UnitReport {
        let name = spec.name.clone();
        let mut restarts = 0u32;
        let mut cooldown = self.cooldown;

        loop {
            let mut unit = match (spec.factory)() {
                Ok(u) => u,
                Err(e) => {
                    let reason = format!("cannot build unit: {e}");
                    tracing::error!(unit = %name, %reason, "unit will not be restarted");
                    self.crashed(&name, &reason, true, None);
                    return UnitReport { name, restarts, fatal: Some(reason) };
                }
            };

            let action = if restarts == 0 {
                actions::WATCHER_STARTED
            } else {
                actions::WATCHER_RESTARTED
            };
            self.ctx
                .audit()
                .record(AuditEntry::success(&name, action, &name).with_param("restarts", restarts));
            tracing::info!(unit = %name, restarts, "unit started");

            let started = Instant::now();
            let outcome = AssertUnwindSafe(run_loop(&mut *unit, spec.interval, self.stop.clone()))
                .catch_unwind()
                .await;
            let reason = match outcome {
                Ok(Ok(())) => return UnitReport { name, restarts, fatal: None },
                Ok(Err(UnitError::Fatal { reason, .. })) => {
                    tracing::error!(unit = %name, %reason, "unit failed fatally");
                    self.crashed(&name, &reason, true, None);
                    return UnitReport { name, restarts, fatal: Some(reason) };
                }
                Ok(Err(UnitError::Crashed { reason, .. })) => reason,
                Err(panic) => panic_message(panic.as_ref()),
            };

            // A unit that stayed healthy for a while starts over at the base cooldown.
            if started.elapsed() > self.max_cooldown {
                cooldown = self.cooldown;
            }
            tracing::warn!(unit = %name, %reason, cooldown_secs = cooldown.as_secs_f64(), "unit crashed; restarting after cooldown");
            self.crashed(&name, &reason, false, Some(cooldown));

            tokio::select! {
                _ = tokio::time::sleep(cooldown) => {}
                _ = wait_for_stop(&mut self.stop) => {
                    return UnitReport { name, restarts, fatal: None };
                }
            }
            restarts += 1;
            cooldown = (cooldown * 2).min(self.max_cooldown);
        }
    }
}

async fn wait_for_stop(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────
