//! Error types for the hcpflow orchestrator.
//!
//! Each layer owns a small error type; [`HcpflowError`] folds them together
//! for callers that drive a whole session.

use crate::status::StageState;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for hcpflow operations.
#[derive(Debug, Error)]
pub enum HcpflowError {
    /// The session's data cannot be turned into a consistent configuration.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    /// The dataset could not be read.
    #[error("{0}")]
    Dataset(#[from] DatasetError),

    /// A command or output template could not be rendered.
    #[error("{0}")]
    Template(#[from] TemplateError),

    /// The status record of a stage could not be read or written.
    #[error("{0}")]
    Status(#[from] StatusError),

    /// A stage ended in a non-succeeded terminal state.
    #[error("{0}")]
    StageFailure(#[from] StageFailure),

    /// An external command could not be launched.
    #[error("{0}")]
    Execution(#[from] ExecutionError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl HcpflowError {
    /// Returns true if this error was raised before any stage executed.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::Template(_))
    }
}

impl From<serde_json::Error> for HcpflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Fatal, per-session configuration problems.
///
/// These are raised by the resolver and by the sequencer before any stage
/// is constructed or executed, and are never retried.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    /// A modality the pipeline cannot run without is absent.
    #[error("required modality '{modality}' not found for subject '{subject}'")]
    MissingRequiredModality {
        /// The missing modality (e.g. `T1w`).
        modality: String,
        /// Subject the session belongs to.
        subject: String,
    },

    /// Spin-echo and phase/magnitude field maps are both linked to scans.
    #[error(
        "too many field map types linked with IntendedFor: {}; keep either spin echo (epi) or \
         phase/magnitude field maps",
        types.join(", ")
    )]
    AmbiguousFieldMapTypes {
        /// The offending set of field-map suffixes.
        types: Vec<String>,
    },

    /// A phase/magnitude set does not carry exactly two distinct echo times.
    #[error("field maps must carry exactly two distinct echo times, found {echo_times:?}")]
    IrregularEchoTimes {
        /// Distinct echo times found, in seconds.
        echo_times: Vec<f64>,
    },

    /// The first-echo field maps do not carry the shorter echo time.
    #[error("field map '{file}' has echo time {found}s but {expected}s was expected for its echo")]
    EchoTimeOrderingError {
        /// File whose echo time is out of order.
        file: String,
        /// Echo time expected for its position.
        expected: f64,
        /// Echo time actually recorded.
        found: f64,
    },

    /// Spin-echo field maps exist for only one phase-encoding polarity.
    #[error("spin echo field maps need both polarities (positive: {positive}, negative: {negative})")]
    IncompleteSpinEchoPair {
        /// Number of positive-polarity files.
        positive: usize,
        /// Number of negative-polarity files.
        negative: usize,
    },

    /// A metadata key the resolver depends on is absent or malformed.
    #[error("metadata key '{key}' missing or invalid for '{}'", file.display())]
    MissingMetadata {
        /// The file whose sidecar is incomplete.
        file: PathBuf,
        /// The metadata key.
        key: String,
    },

    /// The in-plane phase-encoding axis is not ROW or COL.
    #[error("phase encoding direction not recognized: {value}")]
    UnrecognizedPhaseEncoding {
        /// The value found in the metadata.
        value: String,
    },

    /// A stage range selector names a stage that is not in the session's sequence.
    #[error("'{name}' is unknown, check stage name and case (available: {})", available.join(", "))]
    UnknownStage {
        /// The stage name requested.
        name: String,
        /// The stages that were available.
        available: Vec<String>,
    },

    /// A stage range selector resolves to an empty or inverted slice.
    #[error("stage range '{selector}' selects no stages")]
    EmptyStageRange {
        /// The selector as written.
        selector: String,
    },
}

impl ConfigurationError {
    /// Returns a stable code for the violated constraint.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingRequiredModality { .. } => "CONFIG-MISSING_MODALITY",
            Self::AmbiguousFieldMapTypes { .. } => "CONFIG-AMBIGUOUS_FMAP_TYPES",
            Self::IrregularEchoTimes { .. } => "CONFIG-IRREGULAR_ECHO_TIMES",
            Self::EchoTimeOrderingError { .. } => "CONFIG-ECHO_TIME_ORDER",
            Self::IncompleteSpinEchoPair { .. } => "CONFIG-INCOMPLETE_SE_PAIR",
            Self::MissingMetadata { .. } => "CONFIG-MISSING_METADATA",
            Self::UnrecognizedPhaseEncoding { .. } => "CONFIG-PHASE_ENCODING",
            Self::UnknownStage { .. } => "CONFIG-UNKNOWN_STAGE",
            Self::EmptyStageRange { .. } => "CONFIG-EMPTY_STAGE_RANGE",
        }
    }
}

/// Raised when a stage finishes in a state other than succeeded or unchecked.
///
/// Aborts the remaining stages of the session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("error caught during stage {stage}: {comment}")]
pub struct StageFailure {
    /// The stage name.
    pub stage: String,
    /// The terminal state recorded in the status store.
    pub state: StageState,
    /// The comment recorded with the state.
    pub comment: String,
}

impl StageFailure {
    /// Creates a new stage failure.
    #[must_use]
    pub fn new(stage: impl Into<String>, state: StageState, comment: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            state,
            comment: comment.into(),
        }
    }
}

/// Errors reading the input dataset.
#[derive(Debug, Error)]
pub enum DatasetError {
    /// The dataset root is not a directory.
    #[error("{} is not a directory", .0.display())]
    NotADirectory(PathBuf),

    /// No (subject, session) unit matched the filters.
    #[error(
        "bids data not found for participants; if labels were provided check them for errors, \
         otherwise check that the bids folder is correct"
    )]
    NoSessions,

    /// A sidecar could not be parsed.
    #[error("invalid sidecar {}: {message}", path.display())]
    InvalidSidecar {
        /// The sidecar path.
        path: PathBuf,
        /// Parser message.
        message: String,
    },

    /// Traversal failed.
    #[error("dataset traversal failed: {0}")]
    Walk(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors rendering named-placeholder templates.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    /// A placeholder has no value in the parameter set or environment.
    #[error("no value for placeholder '{{{name}}}' in template '{template}'")]
    UnknownPlaceholder {
        /// The placeholder name.
        name: String,
        /// The template being rendered.
        template: String,
    },

    /// A brace was opened and never closed.
    #[error("unterminated placeholder in template '{template}'")]
    Unterminated {
        /// The template being rendered.
        template: String,
    },
}

/// Errors reading or writing a stage status record.
#[derive(Debug, Error)]
pub enum StatusError {
    /// IO error on the status file.
    #[error("status file {}: {source}", path.display())]
    Io {
        /// The status file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The status file contents are not a valid status record.
    #[error("status file {} is corrupt: {message}", path.display())]
    Corrupt {
        /// The status file path.
        path: PathBuf,
        /// Parser message.
        message: String,
    },
}

/// Errors launching external commands.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The process could not be started.
    #[error("failed to launch '{program}': {source}")]
    Spawn {
        /// The program path.
        program: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A log file could not be created.
    #[error("failed to open log {}: {source}", path.display())]
    Log {
        /// The log path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A worker task panicked or was aborted.
    #[error("worker for '{label}' did not complete: {message}")]
    Worker {
        /// The invocation label.
        label: String,
        /// Join error message.
        message: String,
    },
}
