//! End-to-end tests: dataset facts through sequencing, execution and status.

#[cfg(test)]
mod tests {
    use crate::config::{PipelineConstants, ToolEnvironment};
    use crate::errors::{ConfigurationError, HcpflowError};
    use crate::execution::{ExecutionContext, MockCommandExecutor};
    use crate::pipeline::{
        BatchRunner, PipelineSequencer, RunMode, SequencerOptions, SessionOutcome, StageRange,
    };
    use crate::resolver::DistortionCorrectionMethod;
    use crate::stages::{ExpectedOutputCatalog, StageRunner};
    use crate::status::{StageState, StatusStore};
    use crate::testing::{tool_environment, RecordingExecutor, SessionFixture};
    use pretty_assertions::assert_eq;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn sequencer(output_root: &Path, options: SequencerOptions) -> PipelineSequencer {
        PipelineSequencer::new(PipelineConstants::default(), tool_environment(), output_root)
            .with_options(options)
    }

    /// Every expected output of every stage the plan would run.
    fn all_expected_outputs(seq: &PipelineSequencer, fixture: &SessionFixture) -> Vec<PathBuf> {
        let plan = seq.plan(&fixture.build()).unwrap();
        let exec = ExecutionContext::new(Arc::new(RecordingExecutor::new()));
        plan.check_outputs(&exec)
            .unwrap()
            .into_iter()
            .flat_map(|check| check.expected)
            .collect()
    }

    #[tokio::test]
    async fn test_t1_only_session_runs_three_stages() {
        let dir = TempDir::new().unwrap();
        let seq = sequencer(dir.path(), SequencerOptions::new());
        let fixture = SessionFixture::new("01");
        let executor = Arc::new(
            RecordingExecutor::new().creating_outputs(all_expected_outputs(&seq, &fixture)),
        );
        let exec = ExecutionContext::new(executor.clone());

        let plan = seq.plan(&fixture.build()).unwrap();
        assert_eq!(plan.config().method(), DistortionCorrectionMethod::None);
        assert_eq!(
            plan.stage_names(),
            vec!["PreFreeSurfer", "FreeSurfer", "PostFreeSurfer"]
        );

        let reports = plan.run(&exec).await.unwrap();
        assert!(reports.iter().all(|r| r.state == StageState::Succeeded));
        assert_eq!(
            executor.labels(),
            vec!["PreFreeSurfer", "FreeSurfer", "PostFreeSurfer"]
        );

        let pre = executor.invocations().remove(0);
        assert!(pre.command.args.contains(&"--avgrdcmethod=NONE".to_string()));
        assert!(pre.command.args.contains(&"--fmapmag=NONE".to_string()));
    }

    #[tokio::test]
    async fn test_missing_tool_variable_fails_before_any_spawn() {
        let dir = TempDir::new().unwrap();
        let environment = ToolEnvironment::new()
            .with_var("HCPPIPEDIR", "/opt/hcp")
            .with_var("HCPPIPEDIR_Templates", "/opt/hcp/global/templates")
            .with_var("HCPPIPEDIR_Config", "/opt/hcp/global/config");
        let seq = PipelineSequencer::new(PipelineConstants::default(), environment, dir.path());
        let mut mock = MockCommandExecutor::new();
        mock.expect_run().times(0);
        let exec = ExecutionContext::new(Arc::new(mock));

        let plan = seq
            .plan(&SessionFixture::new("01").with_bold("rest", 1).build())
            .unwrap();
        let err = plan.run(&exec).await.unwrap_err();

        assert!(matches!(err, HcpflowError::Template(_)));
        assert!(err.is_configuration());
        assert!(!plan.config().layout().logs().exists());
    }

    #[tokio::test]
    async fn test_bad_catalog_template_fails_before_any_spawn() {
        let dir = TempDir::new().unwrap();
        let seq = sequencer(dir.path(), SequencerOptions::new());
        let mut mock = MockCommandExecutor::new();
        mock.expect_run().times(0);
        let catalog = ExpectedOutputCatalog::builtin()
            .with_stage("FMRISurface", vec!["{path}/{fmri_name}.dtseries.nii".to_string()]);
        let exec = ExecutionContext::new(Arc::new(mock)).with_catalog(catalog);

        let plan = seq
            .plan(&SessionFixture::new("01").with_bold("rest", 1).build())
            .unwrap();
        let err = plan.run(&exec).await.unwrap_err();

        assert!(matches!(err, HcpflowError::Template(_)));
        let store = StatusStore::open(plan.config().layout().stage_logs("PreFreeSurfer")).unwrap();
        assert_eq!(store.run_count().unwrap(), 0);
    }

    #[test]
    fn test_range_starting_at_freesurfer() {
        let seq = sequencer(
            Path::new("/out"),
            SequencerOptions::new().with_stage_range(StageRange::parse("FreeSurfer:")),
        );
        let plan = seq.plan(&SessionFixture::new("01").build()).unwrap();

        assert_eq!(plan.stage_names(), vec!["FreeSurfer", "PostFreeSurfer"]);
    }

    #[tokio::test]
    async fn test_unknown_stage_fails_before_any_spawn() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_run().times(0);
        let exec = ExecutionContext::new(Arc::new(mock));
        let seq = sequencer(
            Path::new("/out"),
            SequencerOptions::new().with_stage_range(StageRange::parse("Freesurfer:")),
        );

        let report = BatchRunner::new(seq, exec)
            .run(&[SessionFixture::new("01").build()])
            .await;

        assert_eq!(report.failed_count(), 1);
        let SessionOutcome::Failed { stage, message } = &report.sessions[0].outcome else {
            panic!("expected a failed session");
        };
        assert_eq!(*stage, None);
        assert!(message.contains("'Freesurfer' is unknown"));
    }

    #[test]
    fn test_unknown_stage_is_a_configuration_error() {
        let seq = sequencer(
            Path::new("/out"),
            SequencerOptions::new().with_stage_range(StageRange::parse(":Nope")),
        );
        let err = seq.plan(&SessionFixture::new("01").build()).unwrap_err();

        assert!(matches!(
            err,
            HcpflowError::Configuration(ConfigurationError::UnknownStage { .. })
        ));
    }

    #[tokio::test]
    async fn test_fan_out_partial_failure_stops_session() {
        let dir = TempDir::new().unwrap();
        let fixture = SessionFixture::new("01")
            .with_bold("rest", 1)
            .with_bold("rest", 2)
            .with_bold("rest", 3)
            .with_bold("rest", 4);
        let seq = sequencer(
            dir.path(),
            SequencerOptions::new().with_stage_range(StageRange::parse("FMRIVolume:")),
        );
        let executor = Arc::new(RecordingExecutor::new().with_exit_code("task-rest02", 1));
        let exec = ExecutionContext::new(executor.clone()).with_concurrency(4);

        let plan = seq.plan(&fixture.build()).unwrap();
        let err = plan.run(&exec).await.unwrap_err();

        let HcpflowError::StageFailure(failure) = err else {
            panic!("expected a stage failure");
        };
        assert_eq!(failure.stage, "FMRIVolume");
        assert_eq!(executor.invocations().len(), 4);

        let logs = plan.config().layout().logs();
        let store = StatusStore::open(logs.join("FMRIVolume")).unwrap();
        assert_eq!(store.state().unwrap(), StageState::Failed);
        assert_eq!(store.run_count().unwrap(), 1);
        assert!(!logs.join("FMRISurface").exists());
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let fixture = SessionFixture::new("01").with_t2();
        let seq = sequencer(dir.path(), SequencerOptions::new());
        let expected = all_expected_outputs(&seq, &fixture);
        let exec = ExecutionContext::new(Arc::new(
            RecordingExecutor::new().creating_outputs(expected.clone()),
        ));
        let plan = seq.plan(&fixture.build()).unwrap();

        for round in 1..=2 {
            let reports = plan.run(&exec).await.unwrap();
            assert!(reports.iter().all(|r| r.state == StageState::Succeeded));
            assert!(reports.iter().all(|r| r.run_count == round));
            assert!(expected.iter().all(|p| p.exists()));
        }
    }

    #[tokio::test]
    async fn test_batch_isolates_session_failures() {
        let dir = TempDir::new().unwrap();
        let good = SessionFixture::new("02");
        let seq = sequencer(dir.path(), SequencerOptions::new());
        let exec = ExecutionContext::new(Arc::new(
            RecordingExecutor::new().creating_outputs(all_expected_outputs(&seq, &good)),
        ));
        let sessions = vec![
            SessionFixture::new("01").without_t1().build(),
            good.build(),
        ];

        let report = BatchRunner::new(seq, exec).run(&sessions).await;

        assert_eq!(report.failed_count(), 1);
        assert!(!report.sessions[0].succeeded());
        assert!(report.sessions[1].succeeded());
        assert_eq!(report.sessions[1].session, "sub-02");
    }

    #[tokio::test]
    async fn test_check_outputs_mode_touches_nothing() {
        let dir = TempDir::new().unwrap();
        let mut mock = MockCommandExecutor::new();
        mock.expect_run().times(0);
        let seq = sequencer(dir.path(), SequencerOptions::new());

        let report = BatchRunner::new(seq, ExecutionContext::new(Arc::new(mock)))
            .with_mode(RunMode::CheckOutputsOnly)
            .run(&[SessionFixture::new("01").build()])
            .await;

        let SessionOutcome::Checked { checks } = &report.sessions[0].outcome else {
            panic!("expected output checks");
        };
        assert_eq!(checks.len(), 3);
        assert!(checks.iter().all(|c| !c.is_complete()));
        assert!(!dir.path().join("sub-01").exists());
    }

    #[tokio::test]
    async fn test_dry_run_marks_every_stage_unchecked() {
        let dir = TempDir::new().unwrap();
        let mut mock = MockCommandExecutor::new();
        mock.expect_run().times(0);
        let exec = ExecutionContext::new(Arc::new(mock)).dry_run();
        let plan = sequencer(dir.path(), SequencerOptions::new())
            .plan(&SessionFixture::new("01").with_bold("rest", 1).build())
            .unwrap();

        let reports = plan.run(&exec).await.unwrap();

        assert_eq!(reports.len(), 6);
        assert!(reports.iter().all(|r| r.state == StageState::Unchecked));
    }

    #[tokio::test]
    async fn test_stage_runner_reports_missing_outputs_per_run() {
        let dir = TempDir::new().unwrap();
        let fixture = SessionFixture::new("01").with_bold("rest", 1).with_bold("rest", 2);
        let plan = sequencer(dir.path(), SequencerOptions::new())
            .plan(&fixture.build())
            .unwrap();
        let exec = ExecutionContext::new(Arc::new(RecordingExecutor::new()));

        let check = StageRunner::new(&crate::stages::FmriSurface, plan.config(), &exec)
            .check_outputs()
            .unwrap();

        assert_eq!(check.missing.len(), 2);
        assert!(check.missing[1].ends_with("task-rest02/task-rest02_Atlas.dtseries.nii"));
    }
}
