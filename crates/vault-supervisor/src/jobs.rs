//! Report-writing jobs fired by the scheduler. All of them are synchronous
//! file work; the scheduler runs them on the blocking pool.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Local, NaiveDate, Utc};
use vault_core::audit::{actions, AuditEntry};
use vault_core::config::JobAction;
use vault_core::reflection::{ReflectionEngine, ReflectionReport};
use vault_core::types::Stage;
use vault_core::vault::VaultSnapshot;

use crate::context::SupervisorContext;
use crate::Result;

/// What a job produced. `path` is `None` in dry-run.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub path: Option<PathBuf>,
    pub summary: String,
}

pub const JOB_ACTOR: &str = "scheduler";

pub fn run_job(ctx: &SupervisorContext, action: JobAction, now: DateTime<Utc>) -> Result<JobOutcome> {
    match action {
        JobAction::DailySummary => daily_summary(ctx, now),
        JobAction::WeeklyBriefing => weekly_briefing(ctx, now),
        JobAction::Reflection => reflection(ctx, now),
    }
}

fn local_date(now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(&Local).date_naive()
}

fn stage_table(out: &mut String, snapshot: &VaultSnapshot) {
    let _ = writeln!(out, "| Stage | Items |");
    let _ = writeln!(out, "|-------|-------|");
    for stage in Stage::all() {
        let _ = writeln!(out, "| {} | {} |", stage.dir_name(), snapshot.count(*stage));
    }
}

// ─── Daily summary ────────────────────────────────────────────────────────

pub fn daily_summary(ctx: &SupervisorContext, now: DateTime<Utc>) -> Result<JobOutcome> {
    let date = local_date(now);
    let snapshot = ctx.vault.snapshot(now)?;
    let today = ctx.audit().read_day(now.date_naive());

    let mut counts: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
    for e in &today.entries {
        let c = counts.entry(e.action_type.as_str()).or_default();
        c.0 += 1;
        if e.result == vault_core::audit::AuditResult::Error {
            c.1 += 1;
        }
    }

    let mut out = String::new();
    let _ = writeln!(out, "---\ntype: daily_summary\ndate: {date}\ngenerated: {}\n---\n", now.to_rfc3339());
    let _ = writeln!(out, "# Daily Summary {date}\n");
    let _ = writeln!(out, "## Vault\n");
    stage_table(&mut out, &snapshot);
    let _ = writeln!(out, "\n## Activity today\n");
    if counts.is_empty() {
        let _ = writeln!(out, "No audit entries recorded today.");
    } else {
        let _ = writeln!(out, "| Action | Entries | Errors |");
        let _ = writeln!(out, "|--------|---------|--------|");
        for (action, (n, errors)) in &counts {
            let _ = writeln!(out, "| {action} | {n} | {errors} |");
        }
    }

    let file_name = format!("DAILY_{date}.md");
    let path = ctx.vault.write_briefing(&file_name, &out)?;
    ctx.audit().record(
        ctx.effect(JOB_ACTOR, actions::DAILY_SUMMARY, file_name.as_str())
            .with_param("entries", today.entries.len()),
    );
    Ok(JobOutcome {
        path,
        summary: format!("{} audit entries today", today.entries.len()),
    })
}

// ─── Weekly briefing ──────────────────────────────────────────────────────

#[derive(Debug, Default, PartialEq)]
pub struct WeeklyCounts {
    pub completed: usize,
    pub pending_approval: usize,
    pub awaiting_action: usize,
    pub emails: usize,
    pub orders: usize,
}

pub fn weekly_counts(ctx: &SupervisorContext, now: DateTime<Utc>) -> Result<WeeklyCounts> {
    let since = now - Duration::days(7);
    let completed = ctx
        .vault
        .scan_stage(Stage::Done)?
        .iter()
        .filter(|f| f.modified >= since)
        .count();
    let snapshot = ctx.vault.snapshot(now)?;

    let mut counts = WeeklyCounts {
        completed,
        pending_approval: snapshot.count(Stage::PendingApproval),
        awaiting_action: snapshot.count(Stage::NeedsAction),
        ..WeeklyCounts::default()
    };
    let created = ctx
        .audit()
        .read_window(now.date_naive(), 7)
        .into_iter()
        .flat_map(|d| d.entries)
        .filter(|e| e.action_type == actions::ACTION_FILE_CREATED);
    for e in created {
        let kind = e.param_str("kind").unwrap_or_default().to_ascii_lowercase();
        if kind.contains("email") {
            counts.emails += 1;
        } else if kind.contains("order") {
            counts.orders += 1;
        }
    }
    Ok(counts)
}

pub fn weekly_briefing(ctx: &SupervisorContext, now: DateTime<Utc>) -> Result<JobOutcome> {
    let date = local_date(now);
    let c = weekly_counts(ctx, now)?;

    let mut out = String::new();
    let _ = writeln!(out, "---\ntype: weekly_briefing\ndate: {date}\ngenerated: {}\n---\n", now.to_rfc3339());
    let _ = writeln!(out, "# Weekly Briefing {date}\n");
    let _ = writeln!(out, "| Metric | Count |");
    let _ = writeln!(out, "|--------|-------|");
    let _ = writeln!(out, "| Completed this week | {} |", c.completed);
    let _ = writeln!(out, "| Pending approval | {} |", c.pending_approval);
    let _ = writeln!(out, "| Awaiting action | {} |", c.awaiting_action);
    let _ = writeln!(out, "| Emails ingested | {} |", c.emails);
    let _ = writeln!(out, "| Order files ingested | {} |", c.orders);
    if c.pending_approval > 0 {
        let _ = writeln!(out, "\n{} item(s) are waiting for your review in `Pending_Approval/`.", c.pending_approval);
    }

    let file_name = format!("{date}_Weekly_Briefing.md");
    let path = ctx.vault.write_briefing(&file_name, &out)?;
    ctx.audit().record(
        ctx.effect(JOB_ACTOR, actions::WEEKLY_BRIEFING, file_name.as_str())
            .with_param("completed", c.completed)
            .with_param("pending_approval", c.pending_approval),
    );
    Ok(JobOutcome {
        path,
        summary: format!("{} completed, {} pending approval", c.completed, c.pending_approval),
    })
}

// ─── Reflection ───────────────────────────────────────────────────────────

pub fn reflection(ctx: &SupervisorContext, now: DateTime<Utc>) -> Result<JobOutcome> {
    let (report, path) = reflect(ctx, ctx.config.reflection.window_days, now)?;
    Ok(JobOutcome {
        path,
        summary: format!("score {}", report.score.as_str()),
    })
}

/// Generate a reflection over the trailing `window_days`, write it under
/// `Briefings/` and log `reflection_generated`.
pub fn reflect(
    ctx: &SupervisorContext,
    window_days: u32,
    now: DateTime<Utc>,
) -> Result<(ReflectionReport, Option<PathBuf>)> {
    let engine = ReflectionEngine::from_config(&ctx.config);
    let report = engine.generate(&ctx.vault, window_days, now)?;
    let path = engine.write(&ctx.vault, &report)?;
    ctx.audit().record(
        ctx.effect(JOB_ACTOR, actions::REFLECTION_GENERATED, report.file_name())
            .with_param("score", report.score.as_str())
            .with_param("window_days", report.window_days),
    );
    Ok((report, path))
}

/// `job_fired` entry for a job that returned an error or panicked.
pub fn failure_entry(job: &str, action: JobAction, error: &str) -> AuditEntry {
    AuditEntry::failure(JOB_ACTOR, actions::JOB_FIRED, job, error).with_param("action", action.as_str())
}

// ─── Tests ────────────────────────────────────────────────────────────────
