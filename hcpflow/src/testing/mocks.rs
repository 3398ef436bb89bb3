//! Spy executors for testing.

use crate::errors::ExecutionError;
use crate::execution::{CommandExecutor, Invocation};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

/// An executor that records invocations instead of launching them.
///
/// Exit codes are scripted per invocation label and default to 0. When
/// configured, every successful invocation writes the listed artifacts,
/// standing in for the files a real tool would produce.
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    invocations: Mutex<Vec<Invocation>>,
    exit_codes: HashMap<String, i32>,
    outputs: Vec<PathBuf>,
}

impl RecordingExecutor {
    /// Creates an executor where every command exits 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the exit code of the invocation labelled `label`.
    #[must_use]
    pub fn with_exit_code(mut self, label: impl Into<String>, code: i32) -> Self {
        self.exit_codes.insert(label.into(), code);
        self
    }

    /// Writes `paths` on every zero-exit invocation.
    #[must_use]
    pub fn creating_outputs(mut self, paths: Vec<PathBuf>) -> Self {
        self.outputs = paths;
        self
    }

    /// Returns the recorded invocations in call order.
    #[must_use]
    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().clone()
    }

    /// Returns the recorded labels in call order.
    #[must_use]
    pub fn labels(&self) -> Vec<String> {
        self.invocations.lock().iter().map(|i| i.label.clone()).collect()
    }

    /// Forgets recorded invocations.
    pub fn reset(&self) {
        self.invocations.lock().clear();
    }

    fn write_outputs(&self) -> Result<(), ExecutionError> {
        for path in &self.outputs {
            let write = || {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(path, b"")
            };
            write().map_err(|source| ExecutionError::Log {
                path: path.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl CommandExecutor for RecordingExecutor {
    async fn run(&self, invocation: &Invocation) -> Result<i32, ExecutionError> {
        self.invocations.lock().push(invocation.clone());
        let code = self.exit_codes.get(&invocation.label).copied().unwrap_or(0);
        if code == 0 {
            self.write_outputs()?;
        }
        Ok(code)
    }
}
