//! Stage trait and the processing stage catalogue.
//!
//! A stage renders one command (single invocation) or one command per
//! functional run (fan-out), declares the outputs it must produce, and may
//! run hook commands before and after its main invocation. The lifecycle
//! around it (status, output removal and verification, fail-fast) lives in
//! [`StageRunner`].

mod anatomical;
mod functional;
mod lifecycle;
mod outputs;
mod summary;

pub use anatomical::{FreeSurfer, PostFreeSurfer, PreFreeSurfer};
pub use functional::{DcanBoldProcessing, FmriSurface, FmriVolume};
pub use lifecycle::{OutputCheck, StageReport, StageRunner};
pub use outputs::ExpectedOutputCatalog;
pub use summary::{CustomClean, ExecutiveSummary};

use crate::config::{CommandLine, SessionConfiguration, TemplateParams};
use crate::errors::{ExecutionError, HcpflowError, TemplateError};
use crate::execution::{ExecutionContext, Invocation};
use async_trait::async_trait;
use std::fmt::Debug;
use std::path::Path;
use tracing::info;

/// One command of a fan-out stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunCommand {
    /// Run name, e.g. `task-rest01`; also names the run's log files.
    pub run: String,
    /// The rendered command.
    pub command: CommandLine,
}

/// The main invocation(s) of a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageCommands {
    /// One command for the whole session.
    Single(CommandLine),
    /// One command per functional run.
    FanOut(Vec<RunCommand>),
}

impl StageCommands {
    /// Returns every command in order.
    #[must_use]
    pub fn lines(&self) -> Vec<&CommandLine> {
        match self {
            Self::Single(cmd) => vec![cmd],
            Self::FanOut(runs) => runs.iter().map(|r| &r.command).collect(),
        }
    }
}

/// What a stage hook can see and do.
#[derive(Debug)]
pub struct HookContext<'a> {
    /// The session configuration.
    pub config: &'a SessionConfiguration,
    /// The stage's rendered parameters.
    pub params: &'a TemplateParams,
    /// Runtime toggles.
    pub exec: &'a ExecutionContext,
    /// The stage's log directory.
    pub log_dir: &'a Path,
    stage: &'a str,
}

impl<'a> HookContext<'a> {
    pub(crate) fn new(
        stage: &'a str,
        config: &'a SessionConfiguration,
        params: &'a TemplateParams,
        exec: &'a ExecutionContext,
        log_dir: &'a Path,
    ) -> Self {
        Self {
            config,
            params,
            exec,
            log_dir,
            stage,
        }
    }

    /// Runs an auxiliary command logging to `<Stage>_<suffix>.out/.err`.
    ///
    /// Reports success without launching anything when commands are disabled.
    pub async fn call(&self, suffix: &str, command: CommandLine) -> Result<i32, ExecutionError> {
        let log_name = format!("{}_{suffix}", self.stage);
        if !self.exec.execute_commands() {
            info!(stage = self.stage, hook = suffix, command = %command, "Skipping hook command");
            return Ok(0);
        }
        let invocation = Invocation::new(&log_name, command, self.log_dir, &log_name);
        self.exec.executor().run(&invocation).await
    }
}

/// A named pipeline stage.
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// Returns the stage name used in range selectors, logs and the output catalog.
    fn name(&self) -> &'static str;

    /// Returns the parameters the stage renders against.
    fn params(&self, config: &SessionConfiguration) -> Result<TemplateParams, TemplateError> {
        config.params()
    }

    /// Renders the main invocation(s).
    fn commands(
        &self,
        config: &SessionConfiguration,
        params: &TemplateParams,
    ) -> Result<StageCommands, TemplateError>;

    /// Returns output templates that apply only to this session.
    fn conditional_outputs(
        &self,
        _config: &SessionConfiguration,
        _params: &TemplateParams,
    ) -> Vec<String> {
        Vec::new()
    }

    /// Runs before the main invocation; a non-zero code fails the stage.
    async fn before_run(&self, _hooks: &HookContext<'_>) -> Result<i32, HcpflowError> {
        Ok(0)
    }

    /// Runs after the main invocation; a returned code joins the aggregate.
    async fn after_run(&self, _hooks: &HookContext<'_>) -> Result<Option<i32>, HcpflowError> {
        Ok(None)
    }
}
