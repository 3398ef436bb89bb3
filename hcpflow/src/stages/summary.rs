//! Reporting and cleanup stages: ExecutiveSummary, CustomClean.

use super::{Stage, StageCommands};
use crate::config::{CommandTemplate, SessionConfiguration, TemplateParams};
use crate::errors::TemplateError;
use std::path::PathBuf;
use std::sync::LazyLock;

static EXECUTIVE_SUMMARY: LazyLock<CommandTemplate> = LazyLock::new(|| {
    CommandTemplate::new("{EXECSUMDIR}/ExecutiveSummary.py")
        .flag("--bids-input", "{unproc}")
        .flag("--output-dir", "{path}")
        .flag("--participant-label", "{subject}")
        .flag("--session-id", "{session}")
        .flag("--atlas", "{t1templatebrain}")
        .flag("--dcan-summary", "{summary_dir}")
});

static CUSTOM_CLEAN: LazyLock<CommandTemplate> = LazyLock::new(|| {
    CommandTemplate::new("{CUSTOMCLEANDIR}/cleaning_script.py")
        .flag("--dir", "{path}")
        .flag("--json", "{input_json}")
});

/// Builds the per-session quality-control report.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutiveSummary;

impl Stage for ExecutiveSummary {
    fn name(&self) -> &'static str {
        "ExecutiveSummary"
    }

    fn commands(
        &self,
        config: &SessionConfiguration,
        params: &TemplateParams,
    ) -> Result<StageCommands, TemplateError> {
        Ok(StageCommands::Single(
            EXECUTIVE_SUMMARY.render(config.environment(), params)?,
        ))
    }
}

/// Deletes intermediate files listed in a cleaning manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomClean {
    input_json: PathBuf,
}

impl CustomClean {
    /// Creates the stage for a cleaning manifest.
    #[must_use]
    pub fn new(input_json: impl Into<PathBuf>) -> Self {
        Self {
            input_json: input_json.into(),
        }
    }
}

impl Stage for CustomClean {
    fn name(&self) -> &'static str {
        "CustomClean"
    }

    fn params(&self, config: &SessionConfiguration) -> Result<TemplateParams, TemplateError> {
        Ok(config
            .params()?
            .with("input_json", self.input_json.display().to_string()))
    }

    fn commands(
        &self,
        config: &SessionConfiguration,
        params: &TemplateParams,
    ) -> Result<StageCommands, TemplateError> {
        Ok(StageCommands::Single(
            CUSTOM_CLEAN.render(config.environment(), params)?,
        ))
    }
}
