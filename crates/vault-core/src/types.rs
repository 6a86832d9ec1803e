use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::VaultError;
use crate::paths;

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// Lifecycle stage of a work item. The directory an item lives in is the
/// authoritative stage; the index mirrors it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    NeedsAction,
    PendingApproval,
    Approved,
    Rejected,
    Done,
    /// Items whose header could not be parsed. Not part of the normal
    /// lifecycle; a human repairs and re-files them.
    Quarantine,
}

impl Stage {
    pub fn all() -> &'static [Stage] {
        &[
            Stage::NeedsAction,
            Stage::PendingApproval,
            Stage::Approved,
            Stage::Rejected,
            Stage::Done,
            Stage::Quarantine,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::NeedsAction => "needs_action",
            Stage::PendingApproval => "pending_approval",
            Stage::Approved => "approved",
            Stage::Rejected => "rejected",
            Stage::Done => "done",
            Stage::Quarantine => "quarantine",
        }
    }

    /// Directory name inside the vault. These names are the wire protocol
    /// shared with the reasoning and action collaborators.
    pub fn dir_name(self) -> &'static str {
        match self {
            Stage::NeedsAction => paths::NEEDS_ACTION_DIR,
            Stage::PendingApproval => paths::PENDING_APPROVAL_DIR,
            Stage::Approved => paths::APPROVED_DIR,
            Stage::Rejected => paths::REJECTED_DIR,
            Stage::Done => paths::DONE_DIR,
            Stage::Quarantine => paths::QUARANTINE_DIR,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Rejected | Stage::Done)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::all()
            .iter()
            .copied()
            .find(|st| st.as_str() == s || st.dir_name() == s)
            .ok_or_else(|| VaultError::UnknownStage(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// ItemKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    OrderBatch,
    Email,
    SocialDraft,
    Plan,
    Other,
}

impl ItemKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemKind::OrderBatch => "order_batch",
            ItemKind::Email => "email",
            ItemKind::SocialDraft => "social_draft",
            ItemKind::Plan => "plan",
            ItemKind::Other => "other",
        }
    }

    /// Infer the kind from the `type` header written by watchers and
    /// collaborators (`new_order_file`, `customer_email`, `email_reply`, ...).
    pub fn from_type_header(value: &str) -> Self {
        let v = value.to_ascii_lowercase();
        if v.contains("order") {
            ItemKind::OrderBatch
        } else if v.contains("email") {
            ItemKind::Email
        } else if v.contains("plan") {
            ItemKind::Plan
        } else if ["social", "linkedin", "twitter", "tweet", "facebook", "instagram", "post"]
            .iter()
            .any(|k| v.contains(k))
        {
            ItemKind::SocialDraft
        } else {
            ItemKind::Other
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Score
// ---------------------------------------------------------------------------

/// Health score. Ordered so that `max()` yields the worst score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Score {
    Green,
    Yellow,
    Red,
}

impl Score {
    pub fn as_str(self) -> &'static str {
        match self {
            Score::Green => "GREEN",
            Score::Yellow => "YELLOW",
            Score::Red => "RED",
        }
    }

    pub fn worst<I: IntoIterator<Item = Score>>(scores: I) -> Score {
        scores.into_iter().max().unwrap_or(Score::Green)
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ExecutionMode
// ---------------------------------------------------------------------------

/// The one switch that decides whether effects happen. Carried by the
/// `Vault` handle and the supervisor context; never read from globals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Live,
    DryRun,
}

impl ExecutionMode {
    pub fn from_dry_run(dry_run: bool) -> Self {
        if dry_run {
            ExecutionMode::DryRun
        } else {
            ExecutionMode::Live
        }
    }

    pub fn is_dry_run(self) -> bool {
        self == ExecutionMode::DryRun
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
