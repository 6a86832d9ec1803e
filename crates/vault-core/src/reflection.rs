//! Self-reflection: score the system's own audit trail.
//!
//! [`ReflectionEngine::analyze`] is pure over a window of [`DayLog`]s and a
//! [`VaultSnapshot`]; [`ReflectionEngine::generate`] gathers both from a
//! [`Vault`]. The only write is the rendered report.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::audit::{actions, AuditResult, DayLog, DayStatus};
use crate::config::{Config, Thresholds};
use crate::error::Result;
use crate::types::{Score, Stage};
use crate::vault::{Vault, VaultSnapshot};

/// Supervision bookkeeping, scored by watcher stability rather than as
/// actions in their own right.
const SUPERVISION_ACTIONS: &[&str] = &[
    actions::WATCHER_STARTED,
    actions::WATCHER_CRASHED,
    actions::WATCHER_RESTARTED,
    actions::ORCHESTRATOR_STARTED,
    actions::ORCHESTRATOR_STOPPED,
];

/// Days at the end of the window compared against the earlier days.
const RECENT_DAYS: usize = 3;

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Finding {
    pub area: String,
    pub score: Score,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActionStats {
    pub action_type: String,
    pub success: u32,
    pub error: u32,
    pub dry_run: u32,
}

impl ActionStats {
    /// Attempts that count toward the error rate.
    pub fn attempts(&self) -> u32 {
        self.success + self.error
    }

    pub fn error_rate(&self) -> f64 {
        ratio(self.error, self.attempts())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DayThroughput {
    pub day: NaiveDate,
    pub entries: usize,
    pub status: DayStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Up,
    Flat,
    Down,
    InsufficientData,
}

impl Trend {
    pub fn as_str(self) -> &'static str {
        match self {
            Trend::Up => "up",
            Trend::Flat => "flat",
            Trend::Down => "down",
            Trend::InsufficientData => "insufficient data",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FilterStats {
    pub kind: String,
    pub blocked: u32,
    pub passed: u32,
}

impl FilterStats {
    pub fn total(&self) -> u32 {
        self.blocked + self.passed
    }

    pub fn block_rate(&self) -> f64 {
        ratio(self.blocked, self.total())
    }
}

/// Immutable result of one reflection run.
#[derive(Debug, Clone, Serialize)]
pub struct ReflectionReport {
    pub window_days: u32,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub generated: DateTime<Utc>,
    pub score: Score,
    pub findings: Vec<Finding>,
    pub went_well: Vec<String>,
    pub needs_attention: Vec<String>,
    pub recommendations: Vec<String>,
    pub throughput: Vec<DayThroughput>,
    pub trend: Trend,
    pub dead_days: Vec<NaiveDate>,
    pub actions: Vec<ActionStats>,
    pub filter: FilterStats,
    pub crashes: BTreeMap<String, u32>,
    pub lagging_approvals: Vec<String>,
    pub stuck_inputs: Vec<String>,
}

impl ReflectionReport {
    pub fn finding(&self, area: &str) -> Option<&Finding> {
        self.findings.iter().find(|f| f.area == area)
    }

    pub fn file_name(&self) -> String {
        format!("REFLECTION_{}.md", self.period_end.format("%Y-%m-%d"))
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "---");
        let _ = writeln!(out, "type: reflection");
        let _ = writeln!(out, "period: {} days", self.window_days);
        let _ = writeln!(out, "generated: {}", self.generated.to_rfc3339());
        let _ = writeln!(out, "score: {}", self.score);
        let _ = writeln!(out, "---");
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "# Reflection: {} to {}",
            self.period_start.format("%Y-%m-%d"),
            self.period_end.format("%Y-%m-%d")
        );
        let _ = writeln!(out);
        let _ = writeln!(out, "Overall health: **{}**", self.score);
        let _ = writeln!(out);

        let _ = writeln!(out, "## Scorecard");
        let _ = writeln!(out, "| Area | Score | Detail |");
        let _ = writeln!(out, "|---|---|---|");
        for f in &self.findings {
            let _ = writeln!(out, "| {} | {} | {} |", f.area, f.score, f.detail);
        }
        let _ = writeln!(out);

        for (title, lines) in [
            ("What Went Well", &self.went_well),
            ("What Needs Attention", &self.needs_attention),
            ("Recommendations", &self.recommendations),
        ] {
            let _ = writeln!(out, "## {title}");
            if lines.is_empty() {
                let _ = writeln!(out, "- None");
            }
            for line in lines {
                let _ = writeln!(out, "- {line}");
            }
            let _ = writeln!(out);
        }

        let _ = writeln!(out, "## Raw Stats (last {} days)", self.window_days);
        let _ = writeln!(out);
        let _ = writeln!(out, "### Throughput");
        let _ = writeln!(out, "| Date | Entries | Log |");
        let _ = writeln!(out, "|---|---|---|");
        for d in &self.throughput {
            let status = match d.status {
                DayStatus::Present => "present",
                DayStatus::Missing => "missing",
                DayStatus::Unreadable => "unreadable",
            };
            let _ = writeln!(out, "| {} | {} | {} |", d.day.format("%Y-%m-%d"), d.entries, status);
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "Trend: {}", self.trend.as_str());
        let _ = writeln!(out);

        let _ = writeln!(out, "### Dead Days");
        if self.dead_days.is_empty() {
            let _ = writeln!(out, "None");
        } else {
            let days: Vec<String> = self
                .dead_days
                .iter()
                .map(|d| d.format("%Y-%m-%d").to_string())
                .collect();
            let _ = writeln!(out, "{}", days.join(", "));
        }
        let _ = writeln!(out);

        let _ = writeln!(out, "### Action Breakdown");
        let _ = writeln!(out, "| Action | Attempts | Success | Errors | Dry run | Error % |");
        let _ = writeln!(out, "|---|---|---|---|---|---|");
        if self.actions.is_empty() {
            let _ = writeln!(out, "| (none) | 0 | 0 | 0 | 0 | 0% |");
        }
        for a in &self.actions {
            let _ = writeln!(
                out,
                "| {} | {} | {} | {} | {} | {:.0}% |",
                a.action_type,
                a.attempts(),
                a.success,
                a.error,
                a.dry_run,
                a.error_rate() * 100.0
            );
        }
        let _ = writeln!(out);

        let _ = writeln!(out, "### Filter ({})", self.filter.kind);
        let _ = writeln!(out, "- Blocked: {}", self.filter.blocked);
        let _ = writeln!(out, "- Passed: {}", self.filter.passed);
        let _ = writeln!(out, "- Block rate: {:.1}%", self.filter.block_rate() * 100.0);
        let _ = writeln!(out);

        let _ = writeln!(out, "### Watcher Crashes");
        if self.crashes.is_empty() {
            let _ = writeln!(out, "None");
        }
        for (unit, count) in &self.crashes {
            let _ = writeln!(out, "- {unit}: {count}");
        }
        out
    }
}

// ---------------------------------------------------------------------------
// ReflectionEngine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ReflectionEngine {
    thresholds: Thresholds,
    filter_kind: String,
}

impl ReflectionEngine {
    pub fn new(thresholds: Thresholds, filter_kind: impl Into<String>) -> Self {
        Self {
            thresholds,
            filter_kind: filter_kind.into(),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(cfg.thresholds.clone(), cfg.filter.kind.clone())
    }

    /// Read the trailing window ending at `now`'s UTC date and a live
    /// snapshot, then score them.
    pub fn generate(
        &self,
        vault: &Vault,
        window_days: u32,
        now: DateTime<Utc>,
    ) -> Result<ReflectionReport> {
        let window_days = window_days.max(1);
        let days = vault.audit().read_window(now.date_naive(), window_days);
        let snapshot = vault.snapshot(now)?;
        Ok(self.analyze(&days, &snapshot, window_days, now))
    }

    /// Write the rendered report under `Briefings/`. `None` in dry-run.
    pub fn write(&self, vault: &Vault, report: &ReflectionReport) -> Result<Option<PathBuf>> {
        vault.write_briefing(&report.file_name(), &report.render())
    }

    pub fn analyze(
        &self,
        days: &[DayLog],
        snapshot: &VaultSnapshot,
        window_days: u32,
        now: DateTime<Utc>,
    ) -> ReflectionReport {
        let t = &self.thresholds;
        let mut notes = Notes::default();
        let mut findings = Vec::new();

        // -- tallies --------------------------------------------------------
        let mut by_action: BTreeMap<String, ActionStats> = BTreeMap::new();
        let mut crashes: BTreeMap<String, u32> = BTreeMap::new();
        let mut filter = FilterStats {
            kind: self.filter_kind.clone(),
            ..FilterStats::default()
        };
        for entry in days.iter().flat_map(|d| d.entries.iter()) {
            if entry.action_type == actions::WATCHER_CRASHED {
                *crashes.entry(entry.actor.clone()).or_default() += 1;
            }
            if entry.param_str("kind") == Some(filter.kind.as_str()) && entry.result != AuditResult::DryRun {
                if entry.action_type == actions::ITEM_FILTERED {
                    filter.blocked += 1;
                } else if entry.action_type == actions::ACTION_FILE_CREATED
                    && entry.result != AuditResult::Error
                {
                    filter.passed += 1;
                }
            }
            if SUPERVISION_ACTIONS.contains(&entry.action_type.as_str()) {
                continue;
            }
            let stats = by_action
                .entry(entry.action_type.clone())
                .or_insert_with(|| ActionStats {
                    action_type: entry.action_type.clone(),
                    ..ActionStats::default()
                });
            match entry.result {
                AuditResult::Error => stats.error += 1,
                AuditResult::DryRun => stats.dry_run += 1,
                // Unrecognized result values count as success.
                AuditResult::Success | AuditResult::Other => stats.success += 1,
            }
        }
        let action_list: Vec<ActionStats> = by_action.into_values().collect();

        // -- overall success ------------------------------------------------
        let ok: u32 = action_list.iter().map(|a| a.success).sum();
        let attempts: u32 = action_list.iter().map(|a| a.attempts()).sum();
        let success_rate = if attempts == 0 { 1.0 } else { ratio(ok, attempts) };
        let success_score = if success_rate >= 0.95 {
            Score::Green
        } else if success_rate >= 0.80 {
            Score::Yellow
        } else {
            Score::Red
        };
        let detail = if attempts == 0 {
            "no actions recorded".to_string()
        } else {
            format!("{:.0}% of {attempts} actions succeeded", success_rate * 100.0)
        };
        if success_score == Score::Green && attempts > 0 {
            notes.well(detail.clone());
        }
        findings.push(Finding {
            area: "action_success".into(),
            score: success_score,
            detail,
        });

        // -- per-action error rate -----------------------------------------
        for a in action_list.iter().filter(|a| a.error > 0) {
            let rate = a.error_rate();
            let score = if rate > 2.0 * t.error_rate {
                Score::Red
            } else if rate > t.error_rate {
                Score::Yellow
            } else {
                Score::Green
            };
            let detail = format!(
                "{:.0}% error rate ({} of {} attempts)",
                rate * 100.0,
                a.error,
                a.attempts()
            );
            if score != Score::Green {
                notes.attention(format!("{} failing: {detail}", a.action_type));
                notes.recommend(format!(
                    "Investigate {} failures; check the collaborator's credentials and logs",
                    a.action_type
                ));
            }
            findings.push(Finding {
                area: format!("action:{}", a.action_type),
                score,
                detail,
            });
        }

        // -- watcher stability ----------------------------------------------
        let total_crashes: u32 = crashes.values().sum();
        let stability = if total_crashes == 0 {
            Score::Green
        } else if total_crashes <= t.crash_count {
            Score::Yellow
        } else {
            Score::Red
        };
        let detail = if total_crashes == 0 {
            "no crashes".to_string()
        } else {
            let parts: Vec<String> = crashes.iter().map(|(u, n)| format!("{u} x{n}")).collect();
            format!("{total_crashes} crash(es): {}", parts.join(", "))
        };
        if stability == Score::Green {
            notes.well(format!("No watcher crashes in the last {window_days} days"));
        } else {
            notes.attention(format!("Watcher crashes: {detail}"));
            for (unit, n) in &crashes {
                notes.recommend(format!("{unit} crashed {n} time(s); check its source and credentials"));
            }
        }
        findings.push(Finding {
            area: "watcher_stability".into(),
            score: stability,
            detail,
        });

        // -- filter effectiveness -------------------------------------------
        let total = filter.total();
        let filter_score = if total > 0 && filter.blocked == total {
            if total > t.min_filter_sample {
                Score::Red
            } else {
                Score::Yellow
            }
        } else {
            Score::Green
        };
        let detail = if total == 0 {
            format!("no {} items seen", filter.kind)
        } else {
            format!(
                "{} blocked, {} passed ({:.0}% blocked)",
                filter.blocked,
                filter.passed,
                filter.block_rate() * 100.0
            )
        };
        if filter_score == Score::Green {
            if total > 0 {
                notes.well(format!("Filter working: {detail}"));
            }
        } else {
            notes.attention(format!("Every {} item was blocked ({total})", filter.kind));
            notes.recommend(format!(
                "All {} items were blocked; verify the sender blocklist and blocked classifications",
                filter.kind
            ));
        }
        findings.push(Finding {
            area: "filter_effectiveness".into(),
            score: filter_score,
            detail,
        });

        // -- approval lag ---------------------------------------------------
        let lagging: Vec<String> = snapshot
            .older_than(Stage::PendingApproval, t.approval_lag())
            .into_iter()
            .map(|i| i.id.clone())
            .collect();
        let lag_score = count_score(lagging.len(), 3);
        let detail = format!(
            "{} of {} pending item(s) older than {}h",
            lagging.len(),
            snapshot.count(Stage::PendingApproval),
            t.approval_lag_hours
        );
        if lag_score == Score::Green {
            notes.well(format!("No approvals waiting longer than {}h", t.approval_lag_hours));
        } else {
            notes.attention(format!("Waiting for review: {}", preview(&lagging)));
            notes.recommend(format!(
                "Review {} item(s) in {} waiting more than {}h",
                lagging.len(),
                Stage::PendingApproval.dir_name(),
                t.approval_lag_hours
            ));
        }
        findings.push(Finding {
            area: "approval_lag".into(),
            score: lag_score,
            detail,
        });

        // -- stuck inputs ---------------------------------------------------
        let stuck: Vec<String> = snapshot
            .older_than(Stage::NeedsAction, t.stuck_after())
            .into_iter()
            .map(|i| i.id.clone())
            .collect();
        let stuck_score = count_score(stuck.len(), 3);
        let detail = format!(
            "{} of {} input(s) older than {}h",
            stuck.len(),
            snapshot.count(Stage::NeedsAction),
            t.stuck_hours
        );
        if stuck_score != Score::Green {
            notes.attention(format!("Stuck in {}: {}", Stage::NeedsAction.dir_name(), preview(&stuck)));
            notes.recommend(format!(
                "{} item(s) in {} stuck more than {}h may need manual processing",
                stuck.len(),
                Stage::NeedsAction.dir_name(),
                t.stuck_hours
            ));
        }
        findings.push(Finding {
            area: "stuck_inputs".into(),
            score: stuck_score,
            detail,
        });

        // -- throughput trend -----------------------------------------------
        let throughput: Vec<DayThroughput> = days
            .iter()
            .map(|d| DayThroughput {
                day: d.day,
                entries: d.entries.len(),
                status: d.status,
            })
            .collect();
        let (trend, trend_score, detail) = self.throughput_trend(&throughput);
        if trend_score != Score::Green {
            notes.attention(format!("Throughput falling: {detail}"));
            notes.recommend("Throughput dropped sharply; check that every source is still delivering");
        }
        findings.push(Finding {
            area: "throughput_trend".into(),
            score: trend_score,
            detail,
        });

        // -- dead days ------------------------------------------------------
        let dead_days: Vec<NaiveDate> = throughput
            .iter()
            .filter(|d| d.entries == 0)
            .map(|d| d.day)
            .collect();
        let dead_score = if dead_days.is_empty() {
            Score::Green
        } else if dead_days.len() as u32 > t.dead_days_red {
            Score::Red
        } else {
            Score::Yellow
        };
        let detail = format!("{} of {} day(s) without log entries", dead_days.len(), throughput.len());
        if dead_score == Score::Green {
            notes.well("The supervisor logged activity every day");
        } else {
            notes.attention(format!("Dead days: {}", dead_days.len()));
            notes.recommend(format!(
                "Nothing ran on {} day(s); make sure the supervisor starts on boot",
                dead_days.len()
            ));
        }
        findings.push(Finding {
            area: "dead_days".into(),
            score: dead_score,
            detail,
        });

        let score = Score::worst(findings.iter().map(|f| f.score));
        if notes.recommendations.is_empty() {
            notes.recommend("No actionable recommendations");
        }

        let period_end = now.date_naive();
        let period_start = days.first().map(|d| d.day).unwrap_or(period_end);
        ReflectionReport {
            window_days,
            period_start,
            period_end,
            generated: now,
            score,
            findings,
            went_well: notes.went_well,
            needs_attention: notes.needs_attention,
            recommendations: notes.recommendations,
            throughput,
            trend,
            dead_days,
            actions: action_list,
            filter,
            crashes,
            lagging_approvals: lagging,
            stuck_inputs: stuck,
        }
    }

    /// Compare the most recent days against the rest of the window.
    fn throughput_trend(&self, days: &[DayThroughput]) -> (Trend, Score, String) {
        if days.len() <= RECENT_DAYS {
            return (Trend::InsufficientData, Score::Green, "window too short".into());
        }
        let split = days.len() - RECENT_DAYS;
        let avg = |s: &[DayThroughput]| s.iter().map(|d| d.entries as f64).sum::<f64>() / s.len() as f64;
        let older = avg(&days[..split]);
        let recent = avg(&days[split..]);
        let trend = if recent > older {
            Trend::Up
        } else if recent < older {
            Trend::Down
        } else {
            Trend::Flat
        };
        let detail = format!("recent {recent:.1}/day vs earlier {older:.1}/day");
        let score = if older > 0.0 && recent == 0.0 {
            Score::Red
        } else if older > 0.0 && recent < older * self.thresholds.throughput_drop_ratio {
            Score::Yellow
        } else {
            Score::Green
        };
        (trend, score, detail)
    }
}

#[derive(Default)]
struct Notes {
    went_well: Vec<String>,
    needs_attention: Vec<String>,
    recommendations: Vec<String>,
}

impl Notes {
    fn well(&mut self, s: impl Into<String>) {
        self.went_well.push(s.into());
    }
    fn attention(&mut self, s: impl Into<String>) {
        self.needs_attention.push(s.into());
    }
    fn recommend(&mut self, s: impl Into<String>) {
        self.recommendations.push(s.into());
    }
}

/// 0 → GREEN, up to `yellow_max` → YELLOW, above → RED.
fn count_score(n: usize, yellow_max: usize) -> Score {
    match n {
        0 => Score::Green,
        n if n <= yellow_max => Score::Yellow,
        _ => Score::Red,
    }
}

fn ratio(n: u32, d: u32) -> f64 {
    if d == 0 {
        0.0
    } else {
        f64::from(n) / f64::from(d)
    }
}

fn preview(ids: &[String]) -> String {
    const MAX: usize = 5;
    let mut s = ids.iter().take(MAX).cloned().collect::<Vec<_>>().join(", ");
    if ids.len() > MAX {
        let _ = write!(s, " and {} more", ids.len() - MAX);
    }
    s
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditEntry;
    use crate::vault::SnapshotItem;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, d).unwrap()
    }

    fn now() -> DateTime<Utc> {
        day(7).and_hms_opt(21, 0, 0).unwrap().and_utc()
    }

    fn log(d: u32, entries: Vec<AuditEntry>) -> DayLog {
        DayLog {
            day: day(d),
            status: DayStatus::Present,
            entries,
        }
    }

    fn missing(d: u32) -> DayLog {
        DayLog {
            day: day(d),
            status: DayStatus::Missing,
            entries: Vec::new(),
        }
    }

    fn ok(action: &str) -> AuditEntry {
        AuditEntry::success("approval_router", action, "x.md")
    }

    fn err(action: &str) -> AuditEntry {
        AuditEntry::failure("approval_router", action, "x.md", "boom")
    }

    fn snapshot(pending_ages: &[f64], needs_ages: &[f64]) -> VaultSnapshot {
        let items = |ages: &[f64], prefix: &str| {
            ages.iter()
                .enumerate()
                .map(|(i, h)| SnapshotItem {
                    id: format!("{prefix}_{i}"),
                    created: now(),
                    age_hours: *h,
                })
                .collect::<Vec<_>>()
        };
        let mut stages = BTreeMap::new();
        stages.insert(Stage::PendingApproval, items(pending_ages, "EMAIL_REPLY"));
        stages.insert(Stage::NeedsAction, items(needs_ages, "EMAIL"));
        VaultSnapshot {
            taken_at: now(),
            stages,
        }
    }

    fn engine() -> ReflectionEngine {
        ReflectionEngine::new(Thresholds::default(), "email")
    }

    fn steady_week() -> Vec<DayLog> {
        (1..=7).map(|d| log(d, vec![ok("file_detected"), ok("file_detected")])).collect()
    }

    #[test]
    fn healthy_week_is_green() {
        let report = engine().analyze(&steady_week(), &snapshot(&[1.0], &[2.0]), 7, now());
        assert_eq!(report.score, Score::Green, "{:#?}", report.findings);
        assert!(report.dead_days.is_empty());
        assert_eq!(report.recommendations, ["No actionable recommendations"]);
    }

    #[test]
    fn dead_day_and_email_send_error_rate() {
        let mut days = steady_week();
        days[2] = missing(3);
        days[4]
            .entries
            .extend([err("email_send"), ok("email_send"), ok("email_send"), ok("email_send")]);
        let report = engine().analyze(&days, &snapshot(&[], &[]), 7, now());

        assert_eq!(report.dead_days, [day(3)]);
        assert_eq!(report.finding("dead_days").unwrap().score, Score::Yellow);
        let email = report.finding("action:email_send").unwrap();
        assert!(email.score >= Score::Yellow);
        assert!(report.score >= Score::Yellow);
    }

    #[test]
    fn error_rate_above_twice_threshold_is_red() {
        let mut days = steady_week();
        days[6].entries.extend([err("linkedin_post"), err("linkedin_post"), ok("linkedin_post")]);
        let report = engine().analyze(&days, &snapshot(&[], &[]), 7, now());
        assert_eq!(report.finding("action:linkedin_post").unwrap().score, Score::Red);
    }

    #[test]
    fn unknown_results_count_as_success() {
        let mut days = steady_week();
        let mut routed = ok("file_detected");
        routed.result = AuditResult::Other;
        days[0].entries.push(routed);
        let report = engine().analyze(&days, &snapshot(&[], &[]), 7, now());
        assert_eq!(report.finding("action_success").unwrap().score, Score::Green);
    }

    #[test]
    fn crashes_above_limit_are_red() {
        let mut days = steady_week();
        for _ in 0..3 {
            days[5]
                .entries
                .push(AuditEntry::failure("gmail_watcher", actions::WATCHER_CRASHED, "gmail_watcher", "x"));
        }
        let report = engine().analyze(&days, &snapshot(&[], &[]), 7, now());
        assert_eq!(report.finding("watcher_stability").unwrap().score, Score::Red);
        assert_eq!(report.crashes.get("gmail_watcher"), Some(&3));
        // Crash entries are not scored as a failing action.
        assert!(report.finding("action:watcher_crashed").is_none());
        assert_eq!(report.score, Score::Red);
    }

    #[test]
    fn approval_lag_and_stuck_inputs() {
        let report = engine().analyze(&steady_week(), &snapshot(&[25.0, 2.0], &[49.0]), 7, now());
        assert_eq!(report.lagging_approvals, ["EMAIL_REPLY_0"]);
        assert_eq!(report.finding("approval_lag").unwrap().score, Score::Yellow);
        assert_eq!(report.stuck_inputs, ["EMAIL_0"]);
        assert_eq!(report.finding("stuck_inputs").unwrap().score, Score::Yellow);
    }

    #[test]
    fn total_blocking_is_flagged() {
        let mut days = steady_week();
        for _ in 0..6 {
            days[1].entries.push(
                AuditEntry::success("gmail_watcher", actions::ITEM_FILTERED, "m").with_param("kind", "email"),
            );
        }
        let report = engine().analyze(&days, &snapshot(&[], &[]), 7, now());
        assert_eq!(report.filter.blocked, 6);
        assert_eq!(report.finding("filter_effectiveness").unwrap().score, Score::Red);
    }

    #[test]
    fn sharp_drop_in_throughput() {
        let mut days: Vec<DayLog> = (1..=4)
            .map(|d| log(d, (0..10).map(|_| ok("file_detected")).collect()))
            .collect();
        days.extend((5..=7).map(|d| log(d, vec![ok("file_detected")])));
        let report = engine().analyze(&days, &snapshot(&[], &[]), 7, now());
        assert_eq!(report.trend, Trend::Down);
        assert_eq!(report.finding("throughput_trend").unwrap().score, Score::Yellow);
    }

    #[test]
    fn render_has_header_and_scorecard() {
        let report = engine().analyze(&steady_week(), &snapshot(&[], &[]), 7, now());
        let text = report.render();
        assert!(text.starts_with("---\ntype: reflection\nperiod: 7 days\n"));
        assert!(text.contains("score: GREEN"));
        assert!(text.contains("| Area | Score | Detail |"));
        assert!(text.contains("| dead_days | GREEN |"));
        assert_eq!(report.file_name(), "REFLECTION_2026-01-07.md");
    }
}
