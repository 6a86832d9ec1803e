use crate::error::{Result, VaultError};
use crate::paths;
use crate::retry::RetryPolicy;
use crate::types::Stage;
use chrono::{NaiveTime, Weekday};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

impl ConfigWarning {
    fn warning(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Warning,
            message: message.into(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Error,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

/// Scoring policy for reflection and the lifecycle monitors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Per-action error rate above which the action scores YELLOW. Twice
    /// this rate scores RED.
    #[serde(default = "default_error_rate")]
    pub error_rate: f64,
    /// `watcher_crashed` entries tolerated in the window before RED.
    #[serde(default = "default_crash_count")]
    pub crash_count: u32,
    #[serde(default = "default_approval_lag_hours")]
    pub approval_lag_hours: u32,
    #[serde(default = "default_stuck_hours")]
    pub stuck_hours: u32,
    /// A day whose throughput falls below this fraction of the preceding
    /// days' average counts as a sharp drop.
    #[serde(default = "default_throughput_drop_ratio")]
    pub throughput_drop_ratio: f64,
    /// More dead days than this scores RED.
    #[serde(default = "default_dead_days_red")]
    pub dead_days_red: u32,
    /// A 100% block rate only scores RED above this many filtered items.
    #[serde(default = "default_min_filter_sample")]
    pub min_filter_sample: u32,
}

fn default_error_rate() -> f64 {
    0.20
}
fn default_crash_count() -> u32 {
    2
}
fn default_approval_lag_hours() -> u32 {
    24
}
fn default_stuck_hours() -> u32 {
    48
}
fn default_throughput_drop_ratio() -> f64 {
    0.5
}
fn default_dead_days_red() -> u32 {
    3
}
fn default_min_filter_sample() -> u32 {
    5
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            error_rate: default_error_rate(),
            crash_count: default_crash_count(),
            approval_lag_hours: default_approval_lag_hours(),
            stuck_hours: default_stuck_hours(),
            throughput_drop_ratio: default_throughput_drop_ratio(),
            dead_days_red: default_dead_days_red(),
            min_filter_sample: default_min_filter_sample(),
        }
    }
}

impl Thresholds {
    pub fn approval_lag(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.approval_lag_hours))
    }

    pub fn stuck_after(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.stuck_hours))
    }
}

// ---------------------------------------------------------------------------
// RetryConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub watcher: RetryPolicy,
    #[serde(default = "RetryPolicy::side_effecting")]
    pub router: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            watcher: RetryPolicy::default(),
            router: RetryPolicy::side_effecting(),
        }
    }
}

// ---------------------------------------------------------------------------
// SupervisorConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_lifecycle_poll")]
    pub lifecycle_poll_secs: u64,
    #[serde(default = "default_router_poll")]
    pub router_poll_secs: u64,
    #[serde(default = "default_scheduler_tick")]
    pub scheduler_tick_secs: u64,
    #[serde(default = "default_restart_cooldown")]
    pub restart_cooldown_secs: u64,
    #[serde(default = "default_max_cooldown")]
    pub max_cooldown_secs: u64,
    /// Upper bound on any single call to an external program.
    #[serde(default = "default_external_timeout")]
    pub external_timeout_secs: u64,
    /// How long `run` waits for in-flight ticks after a stop request.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_lifecycle_poll() -> u64 {
    30
}
fn default_router_poll() -> u64 {
    5
}
fn default_scheduler_tick() -> u64 {
    60
}
fn default_restart_cooldown() -> u64 {
    30
}
fn default_max_cooldown() -> u64 {
    600
}
fn default_external_timeout() -> u64 {
    60
}
fn default_shutdown_grace() -> u64 {
    90
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            lifecycle_poll_secs: default_lifecycle_poll(),
            router_poll_secs: default_router_poll(),
            scheduler_tick_secs: default_scheduler_tick(),
            restart_cooldown_secs: default_restart_cooldown(),
            max_cooldown_secs: default_max_cooldown(),
            external_timeout_secs: default_external_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl SupervisorConfig {
    pub fn external_timeout(&self) -> Duration {
        Duration::from_secs(self.external_timeout_secs)
    }

    pub fn restart_cooldown(&self) -> Duration {
        Duration::from_secs(self.restart_cooldown_secs)
    }

    pub fn max_cooldown(&self) -> Duration {
        Duration::from_secs(self.max_cooldown_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// A directory outside the stage tree where exports are dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropFolderConfig {
    pub name: String,
    #[serde(default = "default_drop_dir")]
    pub dir: String,
    #[serde(default = "default_drop_extensions")]
    pub extensions: Vec<String>,
    #[serde(default = "default_drop_prefix")]
    pub id_prefix: String,
    #[serde(default = "default_drop_type")]
    pub item_type: String,
    #[serde(default = "default_drop_poll")]
    pub poll_interval_secs: u64,
}

fn default_drop_dir() -> String {
    paths::ORDERS_DIR.to_string()
}
fn default_drop_extensions() -> Vec<String> {
    vec!["csv".into(), "tsv".into()]
}
fn default_drop_prefix() -> String {
    "NEW_ORDERS".into()
}
fn default_drop_type() -> String {
    "new_order_file".into()
}
fn default_drop_poll() -> u64 {
    30
}

impl DropFolderConfig {
    pub fn orders() -> Self {
        Self {
            name: "orders_watcher".into(),
            dir: default_drop_dir(),
            extensions: default_drop_extensions(),
            id_prefix: default_drop_prefix(),
            item_type: default_drop_type(),
            poll_interval_secs: default_drop_poll(),
        }
    }
}

/// An external program that prints new source items as a JSON array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPollerConfig {
    pub name: String,
    pub command: Vec<String>,
    pub id_prefix: String,
    pub item_type: String,
    #[serde(default = "default_poller_poll")]
    pub poll_interval_secs: u64,
    /// Header field matched against `sender_blocklist`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_field: Option<String>,
    /// Regex patterns; a match on the sender field suppresses the item.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sender_blocklist: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_classifications: Vec<String>,
}

fn default_poller_poll() -> u64 {
    120
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcesConfig {
    #[serde(default)]
    pub drop_folders: Vec<DropFolderConfig>,
    #[serde(default)]
    pub pollers: Vec<CommandPollerConfig>,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            drop_folders: vec![DropFolderConfig::orders()],
            pollers: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Approval rules
// ---------------------------------------------------------------------------

/// One prefix rule. Rules are evaluated in file order; first match wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRule {
    pub prefix: String,
    pub handler: String,
    /// `action_type` recorded for every attempt, e.g. `email_send`.
    pub action_type: String,
    /// argv; the router appends `--file <path> --vault <root>`.
    pub command: Vec<String>,
}

impl ApprovalRule {
    fn new(prefix: &str, handler: &str, action_type: &str, program: &str) -> Self {
        Self {
            prefix: prefix.into(),
            handler: handler.into(),
            action_type: action_type.into(),
            command: vec![program.into()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalConfig {
    #[serde(default = "default_rules")]
    pub rules: Vec<ApprovalRule>,
}

fn default_rules() -> Vec<ApprovalRule> {
    vec![
        ApprovalRule::new("EMAIL_REPLY_", "email-responder", "email_send", "send-approved-email"),
        ApprovalRule::new("LINKEDIN_", "linkedin-poster", "linkedin_post", "post-linkedin"),
        ApprovalRule::new("TWITTER_", "twitter-poster", "twitter_post", "post-twitter"),
        ApprovalRule::new("FACEBOOK_", "facebook-poster", "facebook_post", "post-facebook"),
        ApprovalRule::new("INSTAGRAM_", "instagram-poster", "instagram_post", "post-instagram"),
    ]
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            rules: default_rules(),
        }
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobAction {
    DailySummary,
    WeeklyBriefing,
    Reflection,
}

impl JobAction {
    pub fn as_str(self) -> &'static str {
        match self {
            JobAction::DailySummary => "daily_summary",
            JobAction::WeeklyBriefing => "weekly_briefing",
            JobAction::Reflection => "reflection",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    pub action: JobAction,
    /// Local wall-clock trigger, `HH:MM`.
    pub at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weekday: Option<Weekday>,
}

impl JobConfig {
    pub fn trigger_time(&self) -> Result<NaiveTime> {
        NaiveTime::parse_from_str(self.at.trim(), "%H:%M").map_err(|e| {
            VaultError::Config(format!("job '{}': bad time '{}': {e}", self.name, self.at))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// A trigger still fires if the scheduler first sees it this many
    /// minutes late (e.g. after a restart).
    #[serde(default = "default_catch_up")]
    pub catch_up_minutes: u32,
    #[serde(default = "default_jobs")]
    pub jobs: Vec<JobConfig>,
}

fn default_catch_up() -> u32 {
    60
}

fn default_jobs() -> Vec<JobConfig> {
    vec![
        JobConfig {
            name: "daily_summary".into(),
            action: JobAction::DailySummary,
            at: "20:00".into(),
            weekday: None,
        },
        JobConfig {
            name: "weekly_briefing".into(),
            action: JobAction::WeeklyBriefing,
            at: "20:00".into(),
            weekday: Some(Weekday::Sun),
        },
        JobConfig {
            name: "weekly_reflection".into(),
            action: JobAction::Reflection,
            at: "21:00".into(),
            weekday: Some(Weekday::Sun),
        },
    ]
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            catch_up_minutes: default_catch_up(),
            jobs: default_jobs(),
        }
    }
}

// ---------------------------------------------------------------------------
// Filter / Reflection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// `kind` parameter of `item_filtered` / `action_file_created`
    /// entries that filter effectiveness is measured over.
    #[serde(default = "default_filter_kind")]
    pub kind: String,
}

fn default_filter_kind() -> String {
    "email".into()
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            kind: default_filter_kind(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectionConfig {
    #[serde(default = "default_window_days")]
    pub window_days: u32,
}

fn default_window_days() -> u32 {
    7
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            window_days: default_window_days(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub reflection: ReflectionConfig,
}

impl Config {
    /// Load `<root>/.vault/config.yaml`. A missing or empty file yields
    /// the defaults.
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        let data = match std::fs::read_to_string(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        // 1. Thresholds
        let t = &self.thresholds;
        if !(t.error_rate > 0.0 && t.error_rate <= 1.0) {
            warnings.push(ConfigWarning::error(format!(
                "thresholds.error_rate={} must be in (0, 1]",
                t.error_rate
            )));
        } else if t.error_rate > 0.5 {
            warnings.push(ConfigWarning::warning(format!(
                "thresholds.error_rate={} leaves no room for RED (twice the rate exceeds 100%)",
                t.error_rate
            )));
        }
        if !(t.throughput_drop_ratio > 0.0 && t.throughput_drop_ratio < 1.0) {
            warnings.push(ConfigWarning::error(format!(
                "thresholds.throughput_drop_ratio={} must be in (0, 1)",
                t.throughput_drop_ratio
            )));
        }
        if t.approval_lag_hours == 0 {
            warnings.push(ConfigWarning::error(
                "thresholds.approval_lag_hours must be > 0; every pending item would expire at once",
            ));
        }

        // 2. Retry policies
        for (name, policy) in [("watcher", &self.retry.watcher), ("router", &self.retry.router)] {
            if policy.max_attempts == 0 {
                warnings.push(ConfigWarning::error(format!(
                    "retry.{name}.max_attempts must be at least 1"
                )));
            }
            if policy.base_delay > policy.max_delay {
                warnings.push(ConfigWarning::warning(format!(
                    "retry.{name}: base_delay_ms exceeds max_delay_ms; every wait is the cap"
                )));
            }
        }
        if self.retry.router.max_attempts > 2 {
            warnings.push(ConfigWarning::warning(format!(
                "retry.router.max_attempts={} retries side effects more than once",
                self.retry.router.max_attempts
            )));
        }

        let sup = &self.supervisor;
        if sup.shutdown_grace_secs <= sup.external_timeout_secs {
            warnings.push(ConfigWarning::warning(format!(
                "supervisor.shutdown_grace_secs={} is not above external_timeout_secs={}; \
                 a call still running at shutdown may be aborted mid-tick",
                sup.shutdown_grace_secs, sup.external_timeout_secs
            )));
        }

        // 3. Approval rules: duplicates, shadowing, commands
        let mut seen: Vec<&str> = Vec::new();
        for rule in &self.approval.rules {
            if rule.prefix.is_empty() {
                warnings.push(ConfigWarning::error(format!(
                    "approval rule for handler '{}' has an empty prefix",
                    rule.handler
                )));
            }
            if seen.contains(&rule.prefix.as_str()) {
                warnings.push(ConfigWarning::error(format!(
                    "duplicate approval prefix '{}'",
                    rule.prefix
                )));
            } else if let Some(earlier) = seen.iter().find(|p| rule.prefix.starts_with(**p)) {
                warnings.push(ConfigWarning::warning(format!(
                    "approval prefix '{}' is shadowed by earlier prefix '{}' and never matches",
                    rule.prefix, earlier
                )));
            }
            seen.push(&rule.prefix);

            match rule.command.first() {
                None => warnings.push(ConfigWarning::error(format!(
                    "approval rule '{}' has an empty command",
                    rule.prefix
                ))),
                Some(program) if !program_exists(program) => {
                    warnings.push(ConfigWarning::warning(format!(
                        "approval rule '{}': command '{}' not found on PATH",
                        rule.prefix, program
                    )))
                }
                Some(_) => {}
            }
        }

        // 4. Sources
        let mut names = HashSet::new();
        for folder in &self.sources.drop_folders {
            if !names.insert(folder.name.as_str()) {
                warnings.push(ConfigWarning::error(format!(
                    "duplicate source name '{}'",
                    folder.name
                )));
            }
            if Stage::all().iter().any(|s| s.dir_name() == folder.dir) {
                warnings.push(ConfigWarning::error(format!(
                    "drop folder '{}' points at stage directory '{}'",
                    folder.name, folder.dir
                )));
            }
            if folder.extensions.is_empty() {
                warnings.push(ConfigWarning::warning(format!(
                    "drop folder '{}' lists no extensions and will never ingest",
                    folder.name
                )));
            }
        }
        for poller in &self.sources.pollers {
            if !names.insert(poller.name.as_str()) {
                warnings.push(ConfigWarning::error(format!(
                    "duplicate source name '{}'",
                    poller.name
                )));
            }
            match poller.command.first() {
                None => warnings.push(ConfigWarning::error(format!(
                    "poller '{}' has an empty command",
                    poller.name
                ))),
                Some(program) if !program_exists(program) => {
                    warnings.push(ConfigWarning::warning(format!(
                        "poller '{}': command '{}' not found on PATH",
                        poller.name, program
                    )))
                }
                Some(_) => {}
            }
            for pattern in &poller.sender_blocklist {
                if let Err(e) = Regex::new(pattern) {
                    warnings.push(ConfigWarning::error(format!(
                        "poller '{}': invalid blocklist pattern '{}': {e}",
                        poller.name, pattern
                    )));
                }
            }
            if !poller.sender_blocklist.is_empty() && poller.sender_field.is_none() {
                warnings.push(ConfigWarning::warning(format!(
                    "poller '{}' has a sender_blocklist but no sender_field",
                    poller.name
                )));
            }
        }

        // 5. Schedule
        let mut job_names = HashSet::new();
        for job in &self.schedule.jobs {
            if !job_names.insert(job.name.as_str()) {
                warnings.push(ConfigWarning::error(format!(
                    "duplicate job name '{}'",
                    job.name
                )));
            }
            if let Err(e) = job.trigger_time() {
                warnings.push(ConfigWarning::error(e.to_string()));
            }
        }

        // 6. Reflection
        if self.reflection.window_days == 0 {
            warnings.push(ConfigWarning::error("reflection.window_days must be at least 1"));
        }

        warnings
    }
}

fn program_exists(program: &str) -> bool {
    Path::new(program).is_file() || which::which(program).is_ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
