//! `vault-supervisor` keeps a personal-operations vault moving.
//!
//! Every piece of background work is a [`Unit`] ticked on its own task by
//! the [`Orchestrator`], which restarts only the unit that crashed.
//!
//! # Architecture
//!
//! ```text
//! Orchestrator
//!     │  one supervised task per unit, cooldown restarts
//!     ▼
//! Watcher<S: Source>   ← drop folders, command pollers → Needs_Action/
//! NeedsActionMonitor   ← announces new items, quarantines bad headers
//! ExpirySweeper        ← Pending_Approval/ past deadline → Done/ (expired)
//! ApprovalRouter       ← Approved/ → action collaborator → Done/
//! Scheduler            ← daily summary, weekly briefing, reflection
//! ```
//!
//! All units share one [`SupervisorContext`]: the vault handle (which
//! carries the execution mode), the audit log and the loaded config.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use vault_core::{config::Config, types::ExecutionMode, vault::Vault};
//! use vault_supervisor::{Orchestrator, SupervisorContext};
//!
//! let vault = Vault::open(root, ExecutionMode::DryRun)?;
//! let ctx = SupervisorContext::new(vault, Config::load(root)?);
//! let (tx, rx) = tokio::sync::watch::channel(false);
//! let report = Orchestrator::from_config(ctx)?.run(rx).await;
//! ```

pub mod context;
pub mod error;
pub mod jobs;
pub mod lifecycle;
pub mod orchestrator;
pub mod process;
pub mod retry;
pub mod router;
pub mod scheduler;
pub mod sources;
pub mod unit;
pub mod watcher;

pub use context::SupervisorContext;
pub use error::{RetryError, SupervisorError, UnitError};
pub use orchestrator::{Orchestrator, RunReport, UnitReport, UnitSpec};
pub use router::{ActionCollaborator, ApprovalRouter, CommandAction};
pub use unit::{RunningUnit, Unit};
pub use watcher::{Admission, Source, SourceItem, Watcher};

/// Convenience `Result` alias for this crate.
pub type Result<T> = std::result::Result<T, SupervisorError>;
