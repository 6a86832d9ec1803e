use std::time::Duration;

use thiserror::Error;
use vault_core::VaultError;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{what} timed out after {}s", .after.as_secs_f64())]
    Timeout { what: String, after: Duration },

    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' failed: {message}")]
    CommandFailed { program: String, message: String },

    #[error("failed to parse {what}: {source}")]
    Parse {
        what: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

/// Why a unit stopped ticking.
#[derive(Debug, Error)]
pub enum UnitError {
    /// Restartable: the orchestrator rebuilds the unit after a cooldown.
    #[error("unit '{unit}' crashed: {reason}")]
    Crashed { unit: String, reason: String },

    /// Not restartable, e.g. the vault root disappeared.
    #[error("unit '{unit}' failed fatally: {reason}")]
    Fatal { unit: String, reason: String },
}

impl UnitError {
    pub fn crashed(unit: &str, reason: impl std::fmt::Display) -> Self {
        UnitError::Crashed {
            unit: unit.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            UnitError::Crashed { reason, .. } | UnitError::Fatal { reason, .. } => reason,
        }
    }
}

/// Terminal outcome of a retried operation.
#[derive(Debug, Error)]
pub enum RetryError<E: std::error::Error + 'static> {
    #[error("gave up after {attempts} attempt(s): {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: E,
    },

    #[error("retries exhausted earlier; waiting for acknowledgement")]
    AwaitingAcknowledgement,

    /// Shutdown was requested while waiting out a backoff.
    #[error("stopped after {attempts} attempt(s): {last}")]
    Interrupted {
        attempts: u32,
        #[source]
        last: E,
    },
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
