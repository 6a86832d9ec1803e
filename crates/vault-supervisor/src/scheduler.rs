use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use vault_core::audit::actions;
use vault_core::index::JobRecord;
use vault_core::schedule::{jobs_from_config, ScheduledJob};

use crate::context::SupervisorContext;
use crate::error::UnitError;
use crate::jobs::{self, JOB_ACTOR};
use crate::unit::Unit;
use crate::Result;

// ─── Clock ────────────────────────────────────────────────────────────────

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// ─── Scheduler ────────────────────────────────────────────────────────────

/// Fires report jobs at local wall-clock times. Firing times are persisted
/// in the index, so a restart inside a trigger window does not fire twice.
pub struct Scheduler {
    ctx: Arc<SupervisorContext>,
    jobs: Vec<ScheduledJob>,
    clock: Arc<dyn Clock>,
}

impl Scheduler {
    pub const NAME: &'static str = "scheduler";

    pub fn new(ctx: Arc<SupervisorContext>) -> Result<Self> {
        let jobs = jobs_from_config(&ctx.config.schedule)?;
        Ok(Self {
            ctx,
            jobs,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn jobs(&self) -> &[ScheduledJob] {
        &self.jobs
    }

    fn last_fired(&self, job: &ScheduledJob) -> Option<chrono::NaiveDateTime> {
        match self.ctx.vault.index().job(&job.name) {
            Ok(rec) => rec.map(|r| r.last_fired.with_timezone(&Local).naive_local()),
            Err(e) => {
                tracing::warn!(job = %job.name, error = %e, "cannot read job record");
                None
            }
        }
    }

    async fn fire(&self, job: &ScheduledJob, now: DateTime<Utc>) {
        let ctx = Arc::clone(&self.ctx);
        let action = job.action;
        let outcome = tokio::task::spawn_blocking(move || jobs::run_job(&ctx, action, now)).await;

        let succeeded = match outcome {
            Ok(Ok(out)) => {
                let mut entry = self
                    .ctx
                    .effect(JOB_ACTOR, actions::JOB_FIRED, job.name.as_str())
                    .with_param("action", action.as_str())
                    .with_param("summary", out.summary.as_str());
                if let Some(path) = &out.path {
                    entry = entry.with_param("path", path.display().to_string());
                }
                self.ctx.audit().record(entry);
                tracing::info!(job = %job.name, summary = %out.summary, "job fired");
                true
            }
            Ok(Err(e)) => {
                tracing::error!(job = %job.name, error = %e, "job failed");
                self.ctx
                    .audit()
                    .record(jobs::failure_entry(&job.name, action, &e.to_string()));
                false
            }
            Err(e) => {
                tracing::error!(job = %job.name, error = %e, "job panicked");
                self.ctx
                    .audit()
                    .record(jobs::failure_entry(&job.name, action, &format!("job task failed: {e}")));
                false
            }
        };

        let record = JobRecord {
            name: job.name.clone(),
            last_fired: now,
            succeeded,
        };
        if let Err(e) = self.ctx.vault.index().record_job(&record) {
            tracing::warn!(job = %job.name, error = %e, "cannot persist job record");
        }
    }
}

#[async_trait]
impl Unit for Scheduler {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn tick(&mut self) -> std::result::Result<(), UnitError> {
        let now = self.clock.now();
        let local = now.with_timezone(&Local).naive_local();
        let catch_up = chrono::Duration::minutes(i64::from(self.ctx.config.schedule.catch_up_minutes));

        for job in &self.jobs {
            if job.is_due(local, self.last_fired(job), catch_up) {
                self.fire(job, now).await;
            }
        }
        Ok(())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────
