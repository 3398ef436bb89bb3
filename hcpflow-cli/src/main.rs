use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use hcpflow::prelude::*;
use hcpflow::pipeline::SessionReport;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Modality {
    Func,
    Dwi,
}

#[derive(Parser, Debug)]
#[command(name = "hcpflow", about = "HCP-style neuroimaging pipeline over a BIDS dataset")]
#[command(version)]
struct Cli {
    /// BIDS dataset root
    bids_dir: PathBuf,

    /// Output root; sessions write to <output_dir>/sub-<id>[/ses-<id>]
    output_dir: PathBuf,

    /// Subject labels to process, without the "sub-" prefix
    #[arg(long = "participant-label", num_args = 1..)]
    participant_label: Vec<String>,

    /// Session labels to process, without the "ses-" prefix
    #[arg(long = "session-id", num_args = 1..)]
    session_id: Vec<String>,

    /// Collapse every session of a subject into one unit
    #[arg(long)]
    all_sessions: bool,

    /// CPU budget: worker pool size for per-run stages, thread hint otherwise
    #[arg(long, default_value_t = 1)]
    ncpus: usize,

    /// Stage range "start:stop" by stage name, both ends inclusive
    #[arg(long = "stage", alias = "stages")]
    stage: Option<StageRange>,

    /// Motion regressor band-stop bounds in breaths per minute
    #[arg(long, num_args = 2, value_names = ["LOWER", "UPPER"])]
    bandstop: Option<Vec<f64>>,

    /// Intermediate registration template
    #[arg(long, num_args = 2, value_names = ["HEAD", "BRAIN"])]
    study_template: Option<Vec<String>>,

    /// Cleaning manifest; appends the CustomClean stage
    #[arg(long, value_name = "JSON")]
    custom_clean: Option<PathBuf>,

    /// Append the ExecutiveSummary stage
    #[arg(long)]
    executive_summary: bool,

    /// Skip a modality
    #[arg(long, value_enum)]
    ignore: Vec<Modality>,

    /// Replace the built-in expected-output catalog
    #[arg(long, value_name = "JSON")]
    expected_outputs: Option<PathBuf>,

    /// Override pipeline constants
    #[arg(long, value_name = "JSON")]
    constants: Option<PathBuf>,

    /// Report missing outputs for each stage and exit
    #[arg(long, conflicts_with = "print_commands_only")]
    check_outputs_only: bool,

    /// Print the commands of each stage and exit
    #[arg(long)]
    print_commands_only: bool,

    /// Keep going when expected outputs are missing
    #[arg(long)]
    ignore_expected_outputs: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Log JSON lines instead of text
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    fn options(&self) -> SequencerOptions {
        let mut options = SequencerOptions::new();
        if let Some(range) = &self.stage {
            options = options.with_stage_range(range.clone());
        }
        if self.executive_summary {
            options = options.with_executive_summary();
        }
        if let Some(manifest) = &self.custom_clean {
            options = options.with_custom_clean(manifest.clone());
        }
        if self.ignore.contains(&Modality::Func) {
            options = options.ignoring_functional();
        }
        if let Some([head, brain]) = self.study_template.as_deref() {
            options = options.with_study_template(head.clone(), brain.clone());
        }
        if let Some(&[lower, upper]) = self.bandstop.as_deref() {
            options = options.with_bandstop(lower, upper);
        }
        options
    }

    fn filter(&self) -> SessionFilter {
        let mut filter = SessionFilter::new();
        if !self.participant_label.is_empty() {
            filter = filter.with_subjects(self.participant_label.clone());
        }
        if !self.session_id.is_empty() {
            filter = filter.with_sessions(self.session_id.clone());
        }
        if self.all_sessions {
            filter = filter.collect_on_subject();
        }
        filter
    }

    fn execution(&self) -> Result<ExecutionContext> {
        let mut exec = ExecutionContext::subprocess().with_concurrency(self.ncpus);
        if let Some(path) = &self.expected_outputs {
            let catalog = ExpectedOutputCatalog::from_json_file(path)
                .with_context(|| format!("reading expected outputs {}", path.display()))?;
            exec = exec.with_catalog(catalog);
        }
        if self.ignore_expected_outputs {
            info!("Ignoring checks for expected outputs");
            exec = exec.ignoring_missing_outputs();
        }
        Ok(exec)
    }

    fn mode(&self) -> RunMode {
        if self.check_outputs_only {
            RunMode::CheckOutputsOnly
        } else if self.print_commands_only {
            RunMode::PrintCommandsOnly
        } else {
            RunMode::Execute
        }
    }
}

fn print_session(report: &SessionReport) {
    match &report.outcome {
        SessionOutcome::Printed { commands } => {
            for (stage, lines) in commands {
                println!("# {} {stage}", report.session);
                for line in lines {
                    println!("{}\n", line.pretty());
                }
            }
        }
        SessionOutcome::Checked { checks } => {
            for check in checks {
                let status = if check.is_complete() { "complete" } else { "incomplete" };
                println!("{} {}: {status}", report.session, check.stage);
                for path in &check.missing {
                    println!("    missing {}", path.display());
                }
            }
        }
        SessionOutcome::Completed { .. } | SessionOutcome::Failed { .. } => {}
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let format = if cli.log_json { LogFormat::Json } else { LogFormat::Pretty };
    init_logging(format, cli.verbose).context("installing log subscriber")?;

    if !cli.bids_dir.is_dir() {
        bail!("{} is not a directory", cli.bids_dir.display());
    }
    if cli.ignore.contains(&Modality::Dwi) {
        info!("Ignoring dwi data");
    }

    let constants = match &cli.constants {
        Some(path) => PipelineConstants::from_json_file(path)
            .with_context(|| format!("reading constants {}", path.display()))?,
        None => PipelineConstants::default(),
    };

    let dataset = BidsDirectory::open(&cli.bids_dir)
        .with_context(|| format!("indexing {}", cli.bids_dir.display()))?;
    let sessions = dataset.sessions(&cli.filter())?;

    let sequencer = PipelineSequencer::new(constants, ToolEnvironment::from_process(), &cli.output_dir)
        .with_options(cli.options());
    let runner = BatchRunner::new(sequencer, cli.execution()?).with_mode(cli.mode());
    let report = runner.run(&sessions).await;

    for session in &report.sessions {
        print_session(session);
        if let SessionOutcome::Failed { message, .. } = &session.outcome {
            warn!(session = %session.session, "{message}");
        }
    }

    if report.succeeded() {
        Ok(ExitCode::SUCCESS)
    } else {
        warn!(failed = report.failed_count(), run_id = %report.run_id, "Some sessions failed");
        Ok(ExitCode::FAILURE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_flags_map_to_options() {
        let cli = Cli::parse_from([
            "hcpflow",
            "/data",
            "/out",
            "--stage",
            "FreeSurfer:",
            "--bandstop",
            "18.582",
            "25.726",
            "--ignore",
            "func",
            "--executive-summary",
        ]);
        let options = cli.options();

        assert_eq!(options.stage_range, StageRange::parse("FreeSurfer:"));
        assert_eq!(options.bandstop, Some((18.582, 25.726)));
        assert!(options.ignore_functional);
        assert!(options.executive_summary);
        assert_eq!(cli.mode(), RunMode::Execute);
    }

    #[test]
    fn test_check_and_print_conflict() {
        let parsed = Cli::try_parse_from([
            "hcpflow",
            "/data",
            "/out",
            "--check-outputs-only",
            "--print-commands-only",
        ]);
        assert!(parsed.is_err());
    }
}
