//! Runtime toggles shared by every stage of a run.

use super::{CommandExecutor, SubprocessExecutor};
use crate::stages::ExpectedOutputCatalog;
use std::fmt;
use std::sync::Arc;

/// How stages behave during one orchestration run.
///
/// Passed explicitly to every stage; there is no process-wide switch.
#[derive(Clone)]
pub struct ExecutionContext {
    executor: Arc<dyn CommandExecutor>,
    catalog: Arc<ExpectedOutputCatalog>,
    concurrency: usize,
    execute_commands: bool,
    remove_outputs: bool,
    verify_outputs: bool,
    ignore_missing_outputs: bool,
}

impl ExecutionContext {
    /// Creates a context that executes through `executor`.
    #[must_use]
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            catalog: Arc::new(ExpectedOutputCatalog::builtin()),
            concurrency: 1,
            execute_commands: true,
            remove_outputs: true,
            verify_outputs: true,
            ignore_missing_outputs: false,
        }
    }

    /// Creates a context that launches real subprocesses.
    #[must_use]
    pub fn subprocess() -> Self {
        Self::new(Arc::new(SubprocessExecutor::new()))
    }

    /// Sets the CPU budget: pool size for per-run commands, thread hint otherwise.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Replaces the expected-output catalog.
    #[must_use]
    pub fn with_catalog(mut self, catalog: ExpectedOutputCatalog) -> Self {
        self.catalog = Arc::new(catalog);
        self
    }

    /// Builds commands without executing them, removing or verifying anything.
    #[must_use]
    pub fn dry_run(mut self) -> Self {
        self.execute_commands = false;
        self.remove_outputs = false;
        self.verify_outputs = false;
        self
    }

    /// Keeps outputs of earlier runs and skips output verification.
    #[must_use]
    pub fn without_output_checks(mut self) -> Self {
        self.remove_outputs = false;
        self.verify_outputs = false;
        self
    }

    /// Logs missing outputs without failing the stage.
    #[must_use]
    pub fn ignoring_missing_outputs(mut self) -> Self {
        self.ignore_missing_outputs = true;
        self
    }

    /// Returns the executor.
    #[must_use]
    pub fn executor(&self) -> &Arc<dyn CommandExecutor> {
        &self.executor
    }

    /// Returns the expected-output catalog.
    #[must_use]
    pub fn catalog(&self) -> &ExpectedOutputCatalog {
        &self.catalog
    }

    /// Returns the CPU budget.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Returns true if commands are launched.
    #[must_use]
    pub fn execute_commands(&self) -> bool {
        self.execute_commands
    }

    /// Returns true if existing outputs are removed before a run.
    #[must_use]
    pub fn remove_outputs(&self) -> bool {
        self.remove_outputs
    }

    /// Returns true if outputs are verified after a run.
    #[must_use]
    pub fn verify_outputs(&self) -> bool {
        self.verify_outputs
    }

    /// Returns true if missing outputs are tolerated.
    #[must_use]
    pub fn ignore_missing_outputs(&self) -> bool {
        self.ignore_missing_outputs
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("concurrency", &self.concurrency)
            .field("execute_commands", &self.execute_commands)
            .field("remove_outputs", &self.remove_outputs)
            .field("verify_outputs", &self.verify_outputs)
            .field("ignore_missing_outputs", &self.ignore_missing_outputs)
            .finish_non_exhaustive()
    }
}
