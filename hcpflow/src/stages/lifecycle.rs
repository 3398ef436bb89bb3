//! Stage lifecycle: setup, invoke, teardown.

use super::{HookContext, Stage, StageCommands};
use crate::config::{SessionConfiguration, TemplateParams};
use crate::errors::{ExecutionError, HcpflowError, StageFailure, TemplateError};
use crate::execution::{ExecutionContext, Invocation, WorkerPool};
use crate::observability::SpanTimer;
use crate::status::{StageState, StatusStore};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};

const FMRINAME: &str = "fmriname";
const MISSING_OUTPUTS: &str = "stage terminated, some required files were not created.";

/// Outcome of one stage run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageReport {
    /// Stage name.
    pub stage: String,
    /// Terminal state recorded.
    pub state: StageState,
    /// Comment recorded with the state.
    pub comment: String,
    /// Run count after this run.
    pub run_count: u32,
    /// Exit codes of the main invocation(s) and teardown hook.
    pub exit_codes: Vec<i32>,
    /// Expected outputs not found on disk.
    pub missing_outputs: Vec<PathBuf>,
    /// Wall time in milliseconds.
    pub duration_ms: f64,
}

/// Expected outputs of a stage and which of them are absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputCheck {
    /// Stage name.
    pub stage: String,
    /// All expected outputs.
    pub expected: Vec<PathBuf>,
    /// Expected outputs not found on disk.
    pub missing: Vec<PathBuf>,
}

impl OutputCheck {
    /// Returns true if every expected output exists.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

enum Verdict {
    Succeeded,
    Unchecked(String),
    Failed(String),
}

/// Drives one stage through its lifecycle for one session.
#[derive(Debug)]
pub struct StageRunner<'a> {
    stage: &'a dyn Stage,
    config: &'a SessionConfiguration,
    exec: &'a ExecutionContext,
}

impl<'a> StageRunner<'a> {
    /// Creates a runner.
    #[must_use]
    pub fn new(stage: &'a dyn Stage, config: &'a SessionConfiguration, exec: &'a ExecutionContext) -> Self {
        Self {
            stage,
            config,
            exec,
        }
    }

    /// Returns the stage's log and status directory.
    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.config.layout().stage_logs(self.stage.name())
    }

    /// Renders the expected outputs.
    ///
    /// Templates mentioning `{fmriname}` expand once per functional run.
    pub fn expected_outputs(&self, params: &TemplateParams) -> Result<Vec<PathBuf>, TemplateError> {
        let name = self.stage.name();
        let mut templates = self.exec.catalog().templates(name).to_vec();
        templates.extend(self.stage.conditional_outputs(self.config, params));

        let mut outputs = Vec::new();
        for template in &templates {
            if template.contains(&format!("{{{FMRINAME}}}")) {
                for run in self.config.functional_runs() {
                    let run_params = params.clone().with(FMRINAME, run.name.clone());
                    outputs.push(PathBuf::from(run_params.render(template)?));
                }
            } else {
                outputs.push(PathBuf::from(params.render(template)?));
            }
        }
        Ok(outputs)
    }

    /// Renders the main invocation(s) without running anything.
    pub fn render(&self) -> Result<StageCommands, HcpflowError> {
        let params = self.stage.params(self.config)?;
        Ok(self.stage.commands(self.config, &params)?)
    }

    /// Renders parameters, commands and expected outputs without running
    /// or touching anything.
    pub fn validate(&self) -> Result<(), HcpflowError> {
        let params = self.stage.params(self.config)?;
        self.stage.commands(self.config, &params)?;
        self.expected_outputs(&params)?;
        Ok(())
    }

    /// Reports which expected outputs exist, touching nothing.
    pub fn check_outputs(&self) -> Result<OutputCheck, HcpflowError> {
        let params = self.stage.params(self.config)?;
        let expected = self.expected_outputs(&params)?;
        let missing: Vec<PathBuf> = expected.iter().filter(|p| !p.exists()).cloned().collect();
        for path in &missing {
            info!(stage = self.stage.name(), path = %path.display(), "File not found");
        }
        Ok(OutputCheck {
            stage: self.stage.name().to_string(),
            expected,
            missing,
        })
    }

    /// Runs the stage.
    ///
    /// Any terminal state other than succeeded or unchecked is returned as
    /// [`HcpflowError::StageFailure`].
    pub async fn run(&self) -> Result<StageReport, HcpflowError> {
        let span = info_span!("stage", stage = self.stage.name(), session = %self.config.label());
        self.run_lifecycle().instrument(span).await
    }

    async fn run_lifecycle(&self) -> Result<StageReport, HcpflowError> {
        let name = self.stage.name();
        let timer = SpanTimer::start(name);

        let params = self.stage.params(self.config)?;
        let commands = self.stage.commands(self.config, &params)?;
        let expected = self.expected_outputs(&params)?;
        let log_dir = self.log_dir();
        let store = StatusStore::open(&log_dir)?;

        // setup
        let status = store.update_start_run()?;
        info!(run_count = status.run_count, "Starting stage");
        if self.exec.remove_outputs() {
            if let Err(e) = remove_existing(name, &expected) {
                return Err(self.abort(&store, e.to_string()));
            }
        }
        let hooks = HookContext::new(name, self.config, &params, self.exec, &log_dir);
        let setup_code = match self.stage.before_run(&hooks).await {
            Ok(code) => code,
            Err(e) => return Err(self.abort(&store, e.to_string())),
        };
        if setup_code != 0 {
            return Err(self.abort(
                &store,
                format!("stage setup terminated with exit code {setup_code}"),
            ));
        }

        // invoke
        for line in commands.lines() {
            info!(command = %line.pretty(), "Stage command");
        }
        let mut codes = match self.invoke(&commands, &log_dir).await {
            Ok(codes) => codes,
            Err(e) => return Err(self.abort(&store, e.to_string())),
        };
        match self.stage.after_run(&hooks).await {
            Ok(Some(code)) => codes.push(code),
            Ok(None) => {}
            Err(e) => return Err(self.abort(&store, e.to_string())),
        }

        // teardown
        let missing: Vec<PathBuf> = if self.exec.execute_commands() && self.exec.verify_outputs() {
            expected.iter().filter(|p| !p.exists()).cloned().collect()
        } else {
            Vec::new()
        };
        for path in &missing {
            warn!(path = %path.display(), "Missing expected output");
        }

        let status = match self.verdict(&codes, &expected, &missing) {
            Verdict::Succeeded => store.update_success()?,
            Verdict::Unchecked(comment) => store.update_unchecked(comment)?,
            Verdict::Failed(comment) => store.update_failure(comment)?,
        };

        let report = StageReport {
            stage: name.to_string(),
            state: status.state,
            comment: status.comment.clone(),
            run_count: status.run_count,
            exit_codes: codes,
            missing_outputs: missing,
            duration_ms: timer.finish(),
        };

        if status.state.allows_continuation() {
            info!(state = %report.state, duration_ms = report.duration_ms, "Stage finished");
            Ok(report)
        } else {
            error!(state = %report.state, comment = %report.comment, "Stage failed");
            Err(StageFailure::new(name, status.state, status.comment).into())
        }
    }

    fn verdict(&self, codes: &[i32], expected: &[PathBuf], missing: &[PathBuf]) -> Verdict {
        if !self.exec.execute_commands() {
            return Verdict::Unchecked("commands were not executed".to_string());
        }
        if codes.iter().any(|c| *c != 0) {
            return Verdict::Failed(exit_comment(codes));
        }
        if expected.is_empty() {
            return Verdict::Unchecked("no expected outputs declared for completed stage".to_string());
        }
        if !self.exec.verify_outputs() {
            return Verdict::Unchecked("expected outputs were not verified".to_string());
        }
        if !missing.is_empty() {
            if self.exec.ignore_missing_outputs() {
                warn!(count = missing.len(), "Ignoring missing expected outputs");
            } else {
                return Verdict::Failed(MISSING_OUTPUTS.to_string());
            }
        }
        Verdict::Succeeded
    }

    async fn invoke(&self, commands: &StageCommands, log_dir: &Path) -> Result<Vec<i32>, ExecutionError> {
        if !self.exec.execute_commands() {
            return Ok(Vec::new());
        }

        match commands {
            StageCommands::Single(command) => {
                let name = self.stage.name();
                let invocation = Invocation::new(name, command.clone(), log_dir, name)
                    .with_threads(self.exec.concurrency());
                Ok(vec![self.exec.executor().run(&invocation).await?])
            }
            StageCommands::FanOut(runs) => {
                let pool = WorkerPool::new(self.exec.concurrency());
                for run in runs {
                    let executor = Arc::clone(self.exec.executor());
                    let invocation = Invocation::new(&run.run, run.command.clone(), log_dir, &run.run);
                    pool.spawn(run.run.clone(), move || async move { executor.run(&invocation).await });
                }
                info!(runs = pool.task_count(), workers = pool.size(), "Waiting for runs");
                pool.wait().await
            }
        }
    }

    /// Records a failure that happened before teardown and returns the
    /// error that stops the session.
    fn abort(&self, store: &StatusStore, comment: String) -> HcpflowError {
        error!(comment = %comment, "Stage aborted");
        match store.update_failure(comment.clone()) {
            Ok(_) => StageFailure::new(self.stage.name(), StageState::Failed, comment).into(),
            Err(e) => e.into(),
        }
    }
}

fn exit_comment(codes: &[i32]) -> String {
    match codes {
        [code] => format!("stage terminated with exit code {code}"),
        codes => format!("stage terminated with exit codes {codes:?}"),
    }
}

fn remove_existing(stage: &str, outputs: &[PathBuf]) -> std::io::Result<()> {
    let existing: Vec<&PathBuf> = outputs.iter().filter(|p| p.is_file()).collect();
    if !existing.is_empty() {
        info!(stage, count = existing.len(), "Found outputs from an earlier run");
    }
    for path in existing {
        info!(path = %path.display(), "Removing");
        fs::remove_file(path).map_err(|e| {
            std::io::Error::new(e.kind(), format!("cannot remove {}: {e}", path.display()))
        })?;
    }
    Ok(())
}
