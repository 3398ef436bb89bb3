//! Stage lifecycle states and the persisted status record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The lifecycle state of a stage for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    /// The stage has never been started.
    NotStarted,
    /// The stage started and has not committed a terminal state.
    Incomplete,
    /// The stage exited non-zero or did not produce its outputs.
    Failed,
    /// The stage exited zero and every expected output exists.
    Succeeded,
    /// The stage exited zero but declares no outputs to verify.
    Unchecked,
}

impl Default for StageState {
    fn default() -> Self {
        Self::NotStarted
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Incomplete => write!(f, "incomplete"),
            Self::Failed => write!(f, "failed"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Unchecked => write!(f, "unchecked"),
        }
    }
}

impl StageState {
    /// Returns true if the state is one a finished run can end in.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Succeeded | Self::Unchecked)
    }

    /// Returns true if sequencing may continue past a stage in this state.
    ///
    /// `Unchecked` counts as success here but is recorded distinctly.
    #[must_use]
    pub fn allows_continuation(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Unchecked)
    }
}

/// The persisted status document of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StageStatus {
    /// Number of times the stage has been started.
    pub run_count: u32,
    /// Current lifecycle state.
    pub state: StageState,
    /// Failure or audit comment; empty on verified success.
    #[serde(default)]
    pub comment: String,
    /// When the record was last written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}
