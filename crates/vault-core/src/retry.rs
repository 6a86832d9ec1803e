//! Exponential backoff policy and per-unit retry bookkeeping.
//!
//! The policy is pure arithmetic; the async executor that sleeps between
//! attempts and writes audit entries lives in `vault-supervisor`.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(
        default = "default_base_delay",
        rename = "base_delay_ms",
        serialize_with = "serialize_millis",
        deserialize_with = "deserialize_millis"
    )]
    pub base_delay: Duration,
    #[serde(
        default = "default_max_delay",
        rename = "max_delay_ms",
        serialize_with = "serialize_millis",
        deserialize_with = "deserialize_millis"
    )]
    pub max_delay: Duration,
    #[serde(default)]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: false,
        }
    }

    /// Policy for operations with external side effects: one automatic
    /// retry, then escalate to a human.
    pub fn side_effecting() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(10),
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Un-jittered wait after the failure of zero-based attempt `attempt`:
    /// `min(base_delay * 2^attempt, max_delay)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Wait actually used, with jitter applied when enabled. Jitter scales
    /// the backoff into `[backoff / 2, backoff]`, never above the cap.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let d = self.backoff(attempt);
        if !self.jitter || d.is_zero() {
            return d;
        }
        let scale: f64 = rand::thread_rng().gen_range(0.5..=1.0);
        d.mul_f64(scale)
    }
}

// ---------------------------------------------------------------------------
// RetryState
// ---------------------------------------------------------------------------

/// What the caller should do after recording a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    Exhausted,
}

/// Mutable retry counters owned by exactly one unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryState {
    pub consecutive_failures: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(serialize_with = "serialize_millis", deserialize_with = "deserialize_millis")]
    pub cumulative_backoff: Duration,
    pub exhausted: bool,
}

impl RetryState {
    pub fn record_failure(&mut self, policy: &RetryPolicy, now: DateTime<Utc>) -> RetryDecision {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures >= policy.max_attempts.max(1) {
            self.exhausted = true;
            self.next_retry_at = None;
            return RetryDecision::Exhausted;
        }
        let delay = policy.delay_for(self.consecutive_failures - 1);
        self.cumulative_backoff += delay;
        self.next_retry_at = chrono::Duration::from_std(delay).ok().map(|d| now + d);
        RetryDecision::RetryAfter(delay)
    }

    /// Any success clears the counters.
    pub fn record_success(&mut self) {
        *self = Self::default();
    }

    /// Explicit acknowledgement of a terminal failure; the only way out of
    /// the exhausted state.
    pub fn acknowledge(&mut self) {
        *self = Self::default();
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

// ---------------------------------------------------------------------------
// Serde helpers for Duration (serialized as milliseconds: u64)
// ---------------------------------------------------------------------------

pub(crate) fn serialize_millis<S>(d: &Duration, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    s.serialize_u64(d.as_millis().min(u128::from(u64::MAX)) as u64)
}

pub(crate) fn deserialize_millis<'de, D>(d: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let ms = u64::deserialize(d)?;
    Ok(Duration::from_millis(ms))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max: u32) -> RetryPolicy {
        RetryPolicy::new(max, Duration::from_secs(5), Duration::from_secs(60))
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy(10);
        assert_eq!(p.backoff(0), Duration::from_secs(5));
        assert_eq!(p.backoff(1), Duration::from_secs(10));
        assert_eq!(p.backoff(3), Duration::from_secs(40));
        assert_eq!(p.backoff(4), Duration::from_secs(60));
        assert_eq!(p.backoff(40), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_half_to_full_backoff() {
        let p = policy(10).with_jitter(true);
        for attempt in 0..6 {
            let d = p.delay_for(attempt);
            assert!(d <= p.backoff(attempt));
            assert!(d + Duration::from_millis(1) >= p.backoff(attempt) / 2);
        }
    }

    #[test]
    fn state_exhausts_after_max_attempts() {
        let p = policy(3);
        let mut s = RetryState::default();
        let now = Utc::now();
        assert_eq!(s.record_failure(&p, now), RetryDecision::RetryAfter(Duration::from_secs(5)));
        assert_eq!(s.record_failure(&p, now), RetryDecision::RetryAfter(Duration::from_secs(10)));
        assert_eq!(s.record_failure(&p, now), RetryDecision::Exhausted);
        assert!(s.is_exhausted());
        assert_eq!(s.cumulative_backoff, Duration::from_secs(15));
    }

    #[test]
    fn success_resets_counters() {
        let p = policy(5);
        let mut s = RetryState::default();
        s.record_failure(&p, Utc::now());
        assert!(s.next_retry_at.is_some());
        s.record_success();
        assert_eq!(s, RetryState::default());
    }

    #[test]
    fn exhausted_state_clears_only_on_acknowledge() {
        let p = policy(1);
        let mut s = RetryState::default();
        assert_eq!(s.record_failure(&p, Utc::now()), RetryDecision::Exhausted);
        assert!(s.is_exhausted());
        s.acknowledge();
        assert!(!s.is_exhausted());
        assert_eq!(s.consecutive_failures, 0);
    }

    #[test]
    fn policy_yaml_uses_millis() {
        let p: RetryPolicy = serde_yaml::from_str("max_attempts: 2\nbase_delay_ms: 250\n").unwrap();
        assert_eq!(p.max_attempts, 2);
        assert_eq!(p.base_delay, Duration::from_millis(250));
        assert_eq!(p.max_delay, Duration::from_secs(60));
    }
}
