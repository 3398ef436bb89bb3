//! Per-session stage sequencing.

use super::StageRange;
use crate::config::{CommandLine, PipelineConstants, SessionConfiguration, ToolEnvironment};
use crate::dataset::RawSession;
use crate::errors::HcpflowError;
use crate::execution::ExecutionContext;
use crate::resolver::resolve;
use crate::stages::{
    CustomClean, DcanBoldProcessing, ExecutiveSummary, FmriSurface, FmriVolume, FreeSurfer,
    OutputCheck, PostFreeSurfer, PreFreeSurfer, Stage, StageCommands, StageReport, StageRunner,
};
use std::path::{Path, PathBuf};
use tracing::info;

/// Operator choices that shape every session's stage list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SequencerOptions {
    /// Slice of the stage sequence to run.
    pub stage_range: StageRange,
    /// Appends the ExecutiveSummary stage.
    pub executive_summary: bool,
    /// Appends the CustomClean stage with this manifest.
    pub custom_clean: Option<PathBuf>,
    /// Skips functional processing even when runs exist.
    pub ignore_functional: bool,
    /// Intermediate registration template (head, brain).
    pub study_template: Option<(String, String)>,
    /// Motion regressor band-stop bounds (lower, upper).
    pub bandstop: Option<(f64, f64)>,
}

impl SequencerOptions {
    /// Creates default options: every inferred stage, no extras.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the stage range.
    #[must_use]
    pub fn with_stage_range(mut self, range: StageRange) -> Self {
        self.stage_range = range;
        self
    }

    /// Appends the ExecutiveSummary stage.
    #[must_use]
    pub fn with_executive_summary(mut self) -> Self {
        self.executive_summary = true;
        self
    }

    /// Appends the CustomClean stage.
    #[must_use]
    pub fn with_custom_clean(mut self, manifest: impl Into<PathBuf>) -> Self {
        self.custom_clean = Some(manifest.into());
        self
    }

    /// Skips functional processing.
    #[must_use]
    pub fn ignoring_functional(mut self) -> Self {
        self.ignore_functional = true;
        self
    }

    /// Uses an intermediate registration template.
    #[must_use]
    pub fn with_study_template(mut self, head: impl Into<String>, brain: impl Into<String>) -> Self {
        self.study_template = Some((head.into(), brain.into()));
        self
    }

    /// Enables the band-stop filter.
    #[must_use]
    pub fn with_bandstop(mut self, lower: f64, upper: f64) -> Self {
        self.bandstop = Some((lower, upper));
        self
    }
}

/// Builds and runs the stage sequence of each session.
#[derive(Debug, Clone)]
pub struct PipelineSequencer {
    constants: PipelineConstants,
    environment: ToolEnvironment,
    output_root: PathBuf,
    options: SequencerOptions,
}

impl PipelineSequencer {
    /// Creates a sequencer writing under `output_root`.
    #[must_use]
    pub fn new(
        constants: PipelineConstants,
        environment: ToolEnvironment,
        output_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            constants,
            environment,
            output_root: output_root.into(),
            options: SequencerOptions::default(),
        }
    }

    /// Sets the operator options.
    #[must_use]
    pub fn with_options(mut self, options: SequencerOptions) -> Self {
        self.options = options;
        self
    }

    /// Returns the operator options.
    #[must_use]
    pub fn options(&self) -> &SequencerOptions {
        &self.options
    }

    /// Returns the output root.
    #[must_use]
    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// Resolves a session and applies the operator's setters.
    pub fn configure(&self, raw: &RawSession) -> Result<SessionConfiguration, HcpflowError> {
        let resolved = resolve(raw)?;
        let has_functional = resolved.has_functional();
        let mut config = SessionConfiguration::new(
            resolved,
            self.constants.clone(),
            self.environment.clone(),
            &self.output_root,
        );

        if !has_functional || self.options.ignore_functional {
            config = config.anatomical_only();
        }
        if let Some((head, brain)) = &self.options.study_template {
            config = config.with_study_template(head.clone(), brain.clone());
        }
        if let Some((lower, upper)) = self.options.bandstop {
            config = config.with_bandstop(lower, upper);
        }
        Ok(config)
    }

    /// Builds the ordered stage list of a session.
    ///
    /// Fails before anything runs if the dataset is inconsistent or the
    /// stage range names an unknown stage.
    pub fn plan(&self, raw: &RawSession) -> Result<SessionPipeline, HcpflowError> {
        let config = self.configure(raw)?;

        let mut stages: Vec<Box<dyn Stage>> = vec![
            Box::new(PreFreeSurfer),
            Box::new(FreeSurfer),
            Box::new(PostFreeSurfer),
        ];
        if config.processes_functional() {
            stages.push(Box::new(FmriVolume));
            stages.push(Box::new(FmriSurface));
            stages.push(Box::new(DcanBoldProcessing));
        }
        if self.options.executive_summary {
            stages.push(Box::new(ExecutiveSummary));
        }
        if let Some(manifest) = &self.options.custom_clean {
            stages.push(Box::new(CustomClean::new(manifest.clone())));
        }

        let names: Vec<&str> = stages.iter().map(|s| s.name()).collect();
        let range = self.options.stage_range.apply(&names)?;
        let stages: Vec<Box<dyn Stage>> = stages.drain(range).collect();

        info!(
            session = %config.label(),
            method = %config.method(),
            stages = ?stages.iter().map(|s| s.name()).collect::<Vec<_>>(),
            "Planned session"
        );
        Ok(SessionPipeline { config, stages })
    }
}

/// The configured stage sequence of one session.
#[derive(Debug)]
pub struct SessionPipeline {
    config: SessionConfiguration,
    stages: Vec<Box<dyn Stage>>,
}

impl SessionPipeline {
    /// Returns the session configuration.
    #[must_use]
    pub fn config(&self) -> &SessionConfiguration {
        &self.config
    }

    /// Returns the stage names in run order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Renders every stage's parameters, commands and expected outputs.
    ///
    /// Missing tool variables and bad catalog templates surface here, before
    /// the first stage starts.
    pub fn validate(&self, exec: &ExecutionContext) -> Result<(), HcpflowError> {
        for stage in &self.stages {
            StageRunner::new(stage.as_ref(), &self.config, exec).validate()?;
        }
        Ok(())
    }

    /// Runs every stage in order, stopping at the first failure.
    ///
    /// Nothing runs unless every stage renders.
    pub async fn run(&self, exec: &ExecutionContext) -> Result<Vec<StageReport>, HcpflowError> {
        self.validate(exec)?;
        let mut reports = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            let report = StageRunner::new(stage.as_ref(), &self.config, exec).run().await?;
            reports.push(report);
        }
        Ok(reports)
    }

    /// Reports the expected outputs of every stage without running anything.
    pub fn check_outputs(&self, exec: &ExecutionContext) -> Result<Vec<OutputCheck>, HcpflowError> {
        self.stages
            .iter()
            .map(|stage| {
                info!(stage = stage.name(), "Checking outputs");
                StageRunner::new(stage.as_ref(), &self.config, exec).check_outputs()
            })
            .collect()
    }

    /// Renders the commands of every stage without running anything.
    pub fn render_commands(
        &self,
        exec: &ExecutionContext,
    ) -> Result<Vec<(&'static str, Vec<CommandLine>)>, HcpflowError> {
        self.stages
            .iter()
            .map(|stage| {
                let commands = StageRunner::new(stage.as_ref(), &self.config, exec).render()?;
                let lines = match commands {
                    StageCommands::Single(cmd) => vec![cmd],
                    StageCommands::FanOut(runs) => runs.into_iter().map(|r| r.command).collect(),
                };
                Ok((stage.name(), lines))
            })
            .collect()
    }
}
