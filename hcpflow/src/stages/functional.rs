//! Per-run functional stages: FMRIVolume, FMRISurface, DCANBOLDProcessing.

use super::{HookContext, RunCommand, Stage, StageCommands};
use crate::config::{CommandLine, CommandTemplate, SessionConfiguration, TemplateParams};
use crate::errors::{HcpflowError, TemplateError};
use crate::resolver::{DistortionCorrectionMethod, FunctionalRun, PairTarget};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::LazyLock;
use tracing::info;

static FMRI_VOLUME: LazyLock<CommandTemplate> = LazyLock::new(|| {
    CommandTemplate::new("{HCPPIPEDIR}/fMRIVolume/GenericfMRIVolumeProcessingPipeline.sh")
        .flag("--path", "{path}")
        .flag("--subject", "{subject}")
        .flag("--fmriname", "{fmriname}")
        .flag("--fmritcs", "{fmritcs}")
        .flag("--fmriscout", "{fmriscout}")
        .flag("--SEPhaseNeg", "{sephaseneg}")
        .flag("--SEPhasePos", "{sephasepos}")
        .flag("--fmapmag", "{fmapmag}")
        .flag("--fmapphase", "{fmapphase}")
        .flag("--fmapgeneralelectric", "{fmapgeneralelectric}")
        .flag("--echospacing", "{echospacing}")
        .flag("--echodiff", "{echodiff}")
        .flag("--unwarpdir", "{seunwarpdir}")
        .flag("--fmrires", "{fmrires}")
        .flag("--dcmethod", "{dcmethod}")
        .flag("--gdcoeffs", "{gdcoeffs}")
        .flag("--topupconfig", "{topupconfig}")
        .flag("--printcom", "{printcom}")
        .flag("--biascorrection", "{fmribfcmethod}")
        .flag("--mctype", "{mctype}")
        .flag("--useT2", "{useT2}")
});

static FMRI_SURFACE: LazyLock<CommandTemplate> = LazyLock::new(|| {
    CommandTemplate::new("{HCPPIPEDIR}/fMRISurface/GenericfMRISurfaceProcessingPipeline.sh")
        .flag("--path", "{path}")
        .flag("--subject", "{subject}")
        .flag("--fmriname", "{fmriname}")
        .flag("--lowresmesh", "{lowresmesh}")
        .flag("--fmrires", "{fmrires}")
        .flag("--smoothingFWHM", "{smoothingFWHM}")
        .flag("--grayordinatesres", "{grayordinatesres}")
        .flag("--regname", "{regname}")
});

static DCAN_BOLD: LazyLock<CommandTemplate> = LazyLock::new(|| {
    CommandTemplate::new("{DCANBOLDPROCDIR}/dcan_bold_proc.py")
        .flag("--subject", "{subject}")
        .flag("--output-folder", "{path}")
        .flag("--task", "{fmriname}")
        .flag("--fd-threshold", "{fd_threshold}")
        .flag("--filter-order", "{filter_order}")
        .flag("--lower-bpf", "{lower_bpf}")
        .flag("--upper-bpf", "{upper_bpf}")
        .flag("--motion-filter-type", "{motion_filter_type}")
        .flag("--physio", "{physio}")
        .flag("--motion-filter-option", "{motion_filter_option}")
        .flag("--motion-filter-order", "{motion_filter_order}")
        .flag("--band-stop-min", "{band_stop_min}")
        .flag("--band-stop-max", "{band_stop_max}")
        .flag("--brain-radius", "{brain_radius}")
        .flag("--skip-seconds", "{skip_seconds}")
        .flag("--contiguous-frames", "{contiguous_frames}")
});

/// Renders one command per functional run.
fn fan_out(
    template: &CommandTemplate,
    config: &SessionConfiguration,
    params: &TemplateParams,
    per_run: impl Fn(&FunctionalRun, TemplateParams) -> TemplateParams,
) -> Result<StageCommands, TemplateError> {
    let runs = config
        .functional_runs()
        .iter()
        .map(|run| {
            let run_params = per_run(run, params.clone().with("fmriname", run.name.clone()));
            Ok(RunCommand {
                run: run.name.clone(),
                command: template.render(config.environment(), &run_params)?,
            })
        })
        .collect::<Result<Vec<_>, TemplateError>>()?;
    Ok(StageCommands::FanOut(runs))
}

/// Volume-space preprocessing of each run.
#[derive(Debug, Clone, Copy, Default)]
pub struct FmriVolume;

impl Stage for FmriVolume {
    fn name(&self) -> &'static str {
        "FMRIVolume"
    }

    fn commands(
        &self,
        config: &SessionConfiguration,
        params: &TemplateParams,
    ) -> Result<StageCommands, TemplateError> {
        let topup = config.method() == DistortionCorrectionMethod::Topup;
        fan_out(&FMRI_VOLUME, config, params, |run, run_params| {
            let run_params = run_params
                .with("fmritcs", run.path.display().to_string())
                .with_opt("fmriscout", None::<String>);
            if !topup {
                return run_params
                    .with_opt("sephasepos", None::<String>)
                    .with_opt("sephaseneg", None::<String>);
            }
            let pair = config
                .resolved()
                .field_maps
                .select_pair(&PairTarget::Run(&run.relpath));
            let run_params = match &run.unwarp_dir {
                Some(dir) => run_params.with("seunwarpdir", dir.clone()),
                None => run_params,
            };
            run_params
                .with_opt("sephasepos", pair.as_ref().map(|p| p.positive.display().to_string()))
                .with_opt("sephaseneg", pair.as_ref().map(|p| p.negative.display().to_string()))
        })
    }
}

/// Surface projection of each run.
#[derive(Debug, Clone, Copy, Default)]
pub struct FmriSurface;

impl Stage for FmriSurface {
    fn name(&self) -> &'static str {
        "FMRISurface"
    }

    fn commands(
        &self,
        config: &SessionConfiguration,
        params: &TemplateParams,
    ) -> Result<StageCommands, TemplateError> {
        fan_out(&FMRI_SURFACE, config, params, |_, run_params| run_params)
    }
}

/// Nuisance regression, filtering and motion censoring.
///
/// A setup call builds the masks shared by every run; a teardown call
/// concatenates each task's runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct DcanBoldProcessing;

impl DcanBoldProcessing {
    /// Renders the base command the hooks extend.
    fn hook_command(hooks: &HookContext<'_>) -> Result<CommandLine, TemplateError> {
        let first = hooks.config.functional_runs().first().map(|r| r.name.clone());
        let params = hooks.params.clone().with_opt("fmriname", first);
        DCAN_BOLD.render(hooks.config.environment(), &params)
    }

    /// Groups run names by task, both sorted.
    fn task_lists(runs: &[FunctionalRun]) -> Vec<String> {
        let mut tasks: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for run in runs {
            tasks.entry(run.task.as_str()).or_default().push(run.name.as_str());
        }
        tasks
            .into_values()
            .map(|mut names| {
                names.sort_unstable();
                names.join(",")
            })
            .collect()
    }
}

#[async_trait]
impl Stage for DcanBoldProcessing {
    fn name(&self) -> &'static str {
        "DCANBOLDProcessing"
    }

    fn commands(
        &self,
        config: &SessionConfiguration,
        params: &TemplateParams,
    ) -> Result<StageCommands, TemplateError> {
        fan_out(&DCAN_BOLD, config, params, |_, run_params| run_params)
    }

    async fn before_run(&self, hooks: &HookContext<'_>) -> Result<i32, HcpflowError> {
        let command = Self::hook_command(hooks)?.arg("--setup");
        info!(command = %command.pretty(), "Stage setup command");
        Ok(hooks.call("setup", command).await?)
    }

    async fn after_run(&self, hooks: &HookContext<'_>) -> Result<Option<i32>, HcpflowError> {
        let mut command = Self::hook_command(hooks)?.arg("--teardown");
        for list in Self::task_lists(hooks.config.functional_runs()) {
            command = command.arg("--tasklist").arg(list);
        }
        info!(command = %command.pretty(), "Stage teardown command");
        Ok(Some(hooks.call("teardown", command).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ExecutionContext;
    use crate::testing::{configuration, configuration_in, RecordingExecutor, SessionFixture};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn runs(commands: StageCommands) -> Vec<RunCommand> {
        match commands {
            StageCommands::FanOut(runs) => runs,
            StageCommands::Single(_) => panic!("expected per-run commands"),
        }
    }

    fn render(stage: &dyn Stage, config: &SessionConfiguration) -> Vec<RunCommand> {
        let params = stage.params(config).unwrap();
        runs(stage.commands(config, &params).unwrap())
    }

    #[test]
    fn test_fmri_volume_one_command_per_run() {
        let config = configuration(
            SessionFixture::new("01")
                .with_bold("rest", 1)
                .with_bold("rest", 2),
        );
        let runs = render(&FmriVolume, &config);

        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run, "task-rest01");
        assert_eq!(runs[1].run, "task-rest02");
        assert!(runs[1].command.args.contains(&"--fmriname=task-rest02".to_string()));
        assert!(runs[0].command.args.contains(&"--fmriscout=NONE".to_string()));
        assert!(runs[0].command.args.contains(&"--SEPhasePos=NONE".to_string()));
        assert!(runs[0].command.args.contains(&"--dcmethod=NONE".to_string()));
    }

    #[test]
    fn test_fmri_volume_topup_uses_run_direction() {
        let config = configuration(
            SessionFixture::new("01")
                .with_bold("rest", 1)
                .with_spin_echo_pair(None),
        );
        let runs = render(&FmriVolume, &config);
        let args = &runs[0].command.args;

        assert!(args.contains(&"--dcmethod=TOPUP".to_string()));
        assert!(args.contains(&"--unwarpdir=y-".to_string()));
        assert!(args.iter().any(|a| a.starts_with("--SEPhaseNeg=") && a.ends_with("dir-AP_epi.nii.gz")));
        assert!(args
            .iter()
            .any(|a| a.starts_with("--fmritcs=") && a.ends_with("sub-01_task-rest_run-01_bold.nii.gz")));
    }

    #[test]
    fn test_fmri_surface_flags() {
        let config = configuration(SessionFixture::new("01").with_bold("rest", 1));
        let runs = render(&FmriSurface, &config);

        assert_eq!(
            runs[0].command.args,
            vec![
                "--path=/out/sub-01/files",
                "--subject=01",
                "--fmriname=task-rest01",
                "--lowresmesh=32",
                "--fmrires=2.0",
                "--smoothingFWHM=2",
                "--grayordinatesres=2",
                "--regname=MSMSulc",
            ]
        );
    }

    #[test]
    fn test_anatomical_only_renders_no_runs() {
        let config = configuration(SessionFixture::new("01").with_bold("rest", 1)).anatomical_only();
        assert!(render(&FmriSurface, &config).is_empty());
    }

    #[test]
    fn test_task_lists_group_and_sort() {
        let config = configuration(
            SessionFixture::new("01")
                .with_bold("rest", 2)
                .with_bold("nback", 1)
                .with_bold("rest", 1),
        );

        assert_eq!(
            DcanBoldProcessing::task_lists(config.functional_runs()),
            vec!["task-nback01".to_string(), "task-rest01,task-rest02".to_string()]
        );
    }

    #[tokio::test]
    async fn test_dcan_bold_hooks_log_separately() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = configuration_in(
            SessionFixture::new("01").with_bold("rest", 1).with_bold("rest", 2),
            dir.path(),
        );
        let executor = Arc::new(RecordingExecutor::new());
        let exec = ExecutionContext::new(executor.clone());
        let params = DcanBoldProcessing.params(&config).unwrap();
        let log_dir = config.layout().stage_logs("DCANBOLDProcessing");
        let hooks = HookContext::new("DCANBOLDProcessing", &config, &params, &exec, &log_dir);

        assert_eq!(DcanBoldProcessing.before_run(&hooks).await.unwrap(), 0);
        assert_eq!(DcanBoldProcessing.after_run(&hooks).await.unwrap(), Some(0));

        let calls = executor.invocations();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].stdout_log.ends_with("DCANBOLDProcessing_setup.out"));
        assert_eq!(calls[0].command.args.last().unwrap(), "--setup");
        assert!(calls[1].stderr_log.ends_with("DCANBOLDProcessing_teardown.err"));
        let tail: Vec<&str> = calls[1].command.args.iter().rev().take(3).map(String::as_str).collect();
        assert_eq!(tail, vec!["task-rest01,task-rest02", "--tasklist", "--teardown"]);
    }

    #[tokio::test]
    async fn test_dcan_bold_setup_failure_surfaces_code() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = configuration_in(SessionFixture::new("01").with_bold("rest", 1), dir.path());
        let executor = Arc::new(RecordingExecutor::new().with_exit_code("DCANBOLDProcessing_setup", 3));
        let exec = ExecutionContext::new(executor);

        let err = crate::stages::StageRunner::new(&DcanBoldProcessing, &config, &exec)
            .run()
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "error caught during stage DCANBOLDProcessing: stage setup terminated with exit code 3"
        );
    }
}
