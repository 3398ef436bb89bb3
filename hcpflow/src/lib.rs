//! # hcpflow
//!
//! Session dataset resolution and stage orchestration for HCP-style
//! neuroimaging pipelines.
//!
//! hcpflow drives opaque external processing tools over a BIDS-style
//! dataset, one subject/session at a time:
//!
//! - **Dataset resolution**: infer the distortion-correction method and pair
//!   calibration files with the scans they correct
//! - **Stage lifecycle**: setup, invoke, teardown with persisted run status
//!   and verified expected outputs
//! - **Fan-out**: one command per functional run on a bounded worker pool
//! - **Sequencing**: stage ranges, fail-fast sessions, isolated batches
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use hcpflow::prelude::*;
//!
//! let dataset = BidsDirectory::open("/data/bids")?;
//! let sessions = dataset.sessions(&SessionFilter::new())?;
//!
//! let sequencer = PipelineSequencer::new(
//!     PipelineConstants::default(),
//!     ToolEnvironment::from_process(),
//!     "/data/derivatives",
//! )
//! .with_options(SequencerOptions::new().with_stage_range(StageRange::parse("FreeSurfer:")));
//!
//! let exec = ExecutionContext::subprocess().with_concurrency(4);
//! let report = BatchRunner::new(sequencer, exec).run(&sessions).await;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod dataset;
pub mod errors;
pub mod execution;
pub mod observability;
pub mod pipeline;
pub mod resolver;
pub mod stages;
pub mod status;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{
        CommandLine, PipelineConstants, SessionConfiguration, TemplateParams, ToolEnvironment,
    };
    pub use crate::dataset::{BidsDirectory, FileEntry, RawSession, ScanType, SessionFilter};
    pub use crate::errors::{
        ConfigurationError, DatasetError, ExecutionError, HcpflowError, StageFailure,
        StatusError, TemplateError,
    };
    pub use crate::execution::{CommandExecutor, ExecutionContext, Invocation, SubprocessExecutor};
    pub use crate::observability::{init_logging, LogFormat};
    pub use crate::pipeline::{
        BatchReport, BatchRunner, PipelineSequencer, RunMode, SequencerOptions, SessionOutcome,
        StageRange,
    };
    pub use crate::resolver::{resolve, DistortionCorrectionMethod, FieldMapSet, ResolvedSession};
    pub use crate::stages::{ExpectedOutputCatalog, Stage, StageReport, StageRunner};
    pub use crate::status::{StageState, StageStatus, StatusStore};
}
