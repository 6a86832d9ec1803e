use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use vault_core::audit::{AuditEntry, AuditLog};
use vault_core::retry::{RetryDecision, RetryPolicy, RetryState};

use crate::error::RetryError;
use crate::SupervisorError;

// ─── Retrier ──────────────────────────────────────────────────────────────

/// Runs one fallible operation under a [`RetryPolicy`], auditing every
/// attempt under `action_type`.
pub struct Retrier<'a> {
    pub policy: &'a RetryPolicy,
    pub audit: &'a AuditLog,
    pub actor: &'a str,
    pub action_type: &'a str,
    pub target: &'a str,
    /// Per-attempt bound, independent of the backoff between attempts.
    pub timeout: Duration,
    /// Ends a backoff early. An attempt already running is never cut short.
    pub stop: watch::Receiver<bool>,
}

impl Retrier<'_> {
    /// Call `op` until it succeeds or the policy is exhausted.
    ///
    /// `op` receives the one-based attempt number. A state that is already
    /// exhausted is refused until someone calls [`RetryState::acknowledge`].
    pub async fn run<T, F, Fut>(
        &self,
        state: &mut RetryState,
        mut op: F,
    ) -> Result<T, RetryError<SupervisorError>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, SupervisorError>>,
    {
        if state.is_exhausted() {
            return Err(RetryError::AwaitingAcknowledgement);
        }
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(self.timeout, op(attempt)).await {
                Ok(r) => r,
                Err(_) => Err(SupervisorError::Timeout {
                    what: format!("{} on {}", self.action_type, self.target),
                    after: self.timeout,
                }),
            };

            match outcome {
                Ok(value) => {
                    self.audit.record(
                        AuditEntry::success(self.actor, self.action_type, self.target)
                            .with_param("attempt", attempt),
                    );
                    state.record_success();
                    return Ok(value);
                }
                Err(e) => {
                    self.audit.record(
                        AuditEntry::failure(self.actor, self.action_type, self.target, e.to_string())
                            .with_param("attempt", attempt),
                    );
                    match state.record_failure(self.policy, Utc::now()) {
                        RetryDecision::RetryAfter(delay) => {
                            tracing::warn!(
                                actor = self.actor,
                                action = self.action_type,
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                "attempt failed; retrying"
                            );
                            let mut stop = self.stop.clone();
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = stop_requested(&mut stop) => {
                                    tracing::info!(
                                        actor = self.actor,
                                        action = self.action_type,
                                        attempt,
                                        "stop requested; abandoning retries"
                                    );
                                    return Err(RetryError::Interrupted { attempts: attempt, last: e });
                                }
                            }
                        }
                        RetryDecision::Exhausted => {
                            return Err(RetryError::Exhausted { attempts: attempt, last: e });
                        }
                    }
                }
            }
        }
    }
}

/// Resolve once `stop` turns true. A closed channel never resolves: with
/// the sender gone nobody can ask for a stop any more.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|stopped| *stopped).await.is_err() {
        std::future::pending::<()>().await;
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────
