//! Launching external processing commands.

use crate::config::CommandLine;
use crate::errors::ExecutionError;
use async_trait::async_trait;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// One external command with its log destinations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Short label for logs: the stage or run name.
    pub label: String,
    /// The command.
    pub command: CommandLine,
    /// File receiving stdout.
    pub stdout_log: PathBuf,
    /// File receiving stderr.
    pub stderr_log: PathBuf,
    /// Thread budget hint for the tool.
    pub threads: usize,
}

impl Invocation {
    /// Creates an invocation logging to `<log_dir>/<log_name>.out` and `.err`.
    #[must_use]
    pub fn new(label: impl Into<String>, command: CommandLine, log_dir: &Path, log_name: &str) -> Self {
        Self {
            label: label.into(),
            command,
            stdout_log: log_dir.join(format!("{log_name}.out")),
            stderr_log: log_dir.join(format!("{log_name}.err")),
            threads: 1,
        }
    }

    /// Sets the thread budget.
    #[must_use]
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }
}

/// Runs one external command to completion and reports its exit code.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Runs the command. A non-zero exit is a normal result, not an error.
    async fn run(&self, invocation: &Invocation) -> Result<i32, ExecutionError>;
}

/// Executes commands as child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubprocessExecutor;

impl SubprocessExecutor {
    /// Creates a subprocess executor.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn create_log(path: &Path) -> Result<File, ExecutionError> {
    File::create(path).map_err(|source| ExecutionError::Log {
        path: path.to_path_buf(),
        source,
    })
}

#[async_trait]
impl CommandExecutor for SubprocessExecutor {
    async fn run(&self, invocation: &Invocation) -> Result<i32, ExecutionError> {
        let stdout = create_log(&invocation.stdout_log)?;
        let stderr = create_log(&invocation.stderr_log)?;

        let mut command = Command::new(&invocation.command.program);
        command
            .args(&invocation.command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        if invocation.threads > 1 {
            let threads = invocation.threads.to_string();
            command
                .env("OMP_NUM_THREADS", &threads)
                .env("ITK_GLOBAL_DEFAULT_NUMBER_OF_THREADS", &threads);
        }

        debug!(label = %invocation.label, command = %invocation.command, "Launching command");
        let status = command.status().await.map_err(|source| ExecutionError::Spawn {
            program: invocation.command.program.clone(),
            source,
        })?;

        // Killed by a signal: no exit code.
        Ok(status.code().unwrap_or(-1))
    }
}
