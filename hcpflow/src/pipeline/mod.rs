//! Session sequencing and batch execution.
//!
//! This module provides:
//! - Stage range selectors
//! - The per-session stage sequencer
//! - The serial multi-session batch runner

mod batch;
mod range;
mod sequencer;

#[cfg(test)]
mod integration_tests;

pub use batch::{BatchReport, BatchRunner, RunMode, SessionOutcome, SessionReport};
pub use range::StageRange;
pub use sequencer::{PipelineSequencer, SequencerOptions, SessionPipeline};
