//! Serial multi-session runs with per-session fault isolation.

use super::PipelineSequencer;
use crate::config::CommandLine;
use crate::dataset::RawSession;
use crate::errors::HcpflowError;
use crate::execution::ExecutionContext;
use crate::stages::{OutputCheck, StageReport};
use serde::Serialize;
use std::fmt;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

/// What a batch does with each session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Runs the stages.
    #[default]
    Execute,
    /// Reports missing expected outputs and touches nothing.
    CheckOutputsOnly,
    /// Renders the stage commands and runs nothing.
    PrintCommandsOnly,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Execute => write!(f, "execute"),
            Self::CheckOutputsOnly => write!(f, "check_outputs_only"),
            Self::PrintCommandsOnly => write!(f, "print_commands_only"),
        }
    }
}

/// How one session ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SessionOutcome {
    /// Every stage ended succeeded or unchecked.
    Completed {
        /// Per-stage reports in run order.
        stages: Vec<StageReport>,
    },
    /// Outputs were checked.
    Checked {
        /// Per-stage output checks.
        checks: Vec<OutputCheck>,
    },
    /// Commands were rendered.
    Printed {
        /// Stage name and its rendered commands.
        #[serde(skip)]
        commands: Vec<(&'static str, Vec<CommandLine>)>,
    },
    /// The session stopped early.
    Failed {
        /// Failing stage, if a stage had started.
        stage: Option<String>,
        /// Error message.
        message: String,
    },
}

/// The outcome of one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionReport {
    /// Session label, e.g. `sub-01/ses-A`.
    pub session: String,
    /// The outcome.
    #[serde(flatten)]
    pub outcome: SessionOutcome,
}

impl SessionReport {
    /// Returns true if the session did not fail.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        !matches!(self.outcome, SessionOutcome::Failed { .. })
    }
}

/// The outcome of a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    /// Identifier shared by every log line of the batch.
    pub run_id: Uuid,
    /// Per-session reports in run order.
    pub sessions: Vec<SessionReport>,
}

impl BatchReport {
    /// Returns the number of failed sessions.
    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.sessions.iter().filter(|s| !s.succeeded()).count()
    }

    /// Returns true if no session failed.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.failed_count() == 0
    }
}

/// Runs sessions one after another.
///
/// A failing session is recorded and the batch moves on.
#[derive(Debug)]
pub struct BatchRunner {
    sequencer: PipelineSequencer,
    exec: ExecutionContext,
    mode: RunMode,
    run_id: Uuid,
}

impl BatchRunner {
    /// Creates a runner in [`RunMode::Execute`].
    #[must_use]
    pub fn new(sequencer: PipelineSequencer, exec: ExecutionContext) -> Self {
        Self {
            sequencer,
            exec,
            mode: RunMode::Execute,
            run_id: Uuid::new_v4(),
        }
    }

    /// Sets the run mode.
    #[must_use]
    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    /// Returns the batch run id.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Runs every session serially.
    pub async fn run(&self, sessions: &[RawSession]) -> BatchReport {
        info!(run_id = %self.run_id, sessions = sessions.len(), mode = %self.mode, "Starting batch");
        let mut reports = Vec::with_capacity(sessions.len());
        for raw in sessions {
            let span = info_span!("session", run_id = %self.run_id, session = %raw.label());
            let outcome = self.run_session(raw).instrument(span).await;
            reports.push(SessionReport {
                session: raw.label(),
                outcome,
            });
        }
        let report = BatchReport {
            run_id: self.run_id,
            sessions: reports,
        };
        info!(failed = report.failed_count(), "Batch finished");
        report
    }

    async fn run_session(&self, raw: &RawSession) -> SessionOutcome {
        match self.try_session(raw).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(error = %err, "Session failed");
                let stage = match &err {
                    HcpflowError::StageFailure(failure) => Some(failure.stage.clone()),
                    _ => None,
                };
                SessionOutcome::Failed {
                    stage,
                    message: err.to_string(),
                }
            }
        }
    }

    async fn try_session(&self, raw: &RawSession) -> Result<SessionOutcome, HcpflowError> {
        let pipeline = self.sequencer.plan(raw)?;
        match self.mode {
            RunMode::Execute => Ok(SessionOutcome::Completed {
                stages: pipeline.run(&self.exec).await?,
            }),
            RunMode::CheckOutputsOnly => Ok(SessionOutcome::Checked {
                checks: pipeline.check_outputs(&self.exec)?,
            }),
            RunMode::PrintCommandsOnly => Ok(SessionOutcome::Printed {
                commands: pipeline.render_commands(&self.exec)?,
            }),
        }
    }
}
