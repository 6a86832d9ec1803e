//! Wall-clock job triggers.
//!
//! Evaluation is pure: callers pass local "now" and the last firing time
//! (both naive local), so the due logic is testable without a clock.

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

use crate::config::{JobAction, JobConfig, ScheduleConfig};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub name: String,
    pub action: JobAction,
    pub time: NaiveTime,
    /// `None` fires daily; `Some` fires once per ISO week on that day.
    pub weekday: Option<Weekday>,
}

impl ScheduledJob {
    pub fn from_config(cfg: &JobConfig) -> Result<Self> {
        Ok(Self {
            name: cfg.name.clone(),
            action: cfg.action,
            time: cfg.trigger_time()?,
            weekday: cfg.weekday,
        })
    }

    pub fn is_weekly(&self) -> bool {
        self.weekday.is_some()
    }

    /// The trigger instant on `date`, if the job runs that day.
    pub fn trigger_on(&self, date: NaiveDate) -> Option<NaiveDateTime> {
        if let Some(day) = self.weekday {
            if date.weekday() != day {
                return None;
            }
        }
        Some(date.and_time(self.time))
    }

    /// The latest trigger at or before `now`, looking back one day so a
    /// window opened late in the evening still covers the small hours.
    pub fn last_trigger(&self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        let today = now.date();
        self.trigger_on(today)
            .filter(|t| *t <= now)
            .or_else(|| today.pred_opt().and_then(|d| self.trigger_on(d)))
    }

    /// True when `now` falls in `[trigger, trigger + catch_up)` and the job
    /// has not fired since that trigger. One trigger per date (daily) or
    /// per ISO week (weekly), so this is the once-per-period rule keyed on
    /// the trigger rather than on `now`.
    pub fn is_due(
        &self,
        now: NaiveDateTime,
        last_fired: Option<NaiveDateTime>,
        catch_up: Duration,
    ) -> bool {
        let Some(trigger) = self.last_trigger(now) else {
            return false;
        };
        if now < trigger || now >= trigger + catch_up {
            return false;
        }
        last_fired.map_or(true, |last| last < trigger)
    }
}

/// Parse every job in the schedule section, in configured order.
pub fn jobs_from_config(cfg: &ScheduleConfig) -> Result<Vec<ScheduledJob>> {
    cfg.jobs.iter().map(ScheduledJob::from_config).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
