//! Session dataset resolver.
//!
//! Turns the files and sidecars of one [`RawSession`] into the dataset facts
//! every stage relies on: anatomical inputs and their sample spacing, the
//! functional runs, and the distortion-correction method together with the
//! calibration files that drive it. Resolution is a pure function of the
//! session; every inconsistency is a [`ConfigurationError`] raised before
//! any stage exists.

mod fieldmap;
pub mod orientation;

pub use fieldmap::{
    classify, DistortionCorrectionMethod, FieldMapSet, PairTarget, SpinEchoFile, SpinEchoPair,
};

use crate::dataset::naming::{fmri_name, relative_to_subject, task_name};
use crate::dataset::{FileEntry, RawSession, ScanType};
use crate::errors::ConfigurationError;
use orientation::{format_general, format_trimmed, ijk_to_xyz, readout_dir, sample_spacing};
use std::path::PathBuf;
use tracing::{debug, warn};

const PED_KEY: &str = "PhaseEncodingDirection";

/// One functional run of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionalRun {
    /// Image path.
    pub path: PathBuf,
    /// Path relative to the subject directory, as used by `IntendedFor`.
    pub relpath: PathBuf,
    /// Run name, e.g. `task-rest01`.
    pub name: String,
    /// Task name, e.g. `task-rest`.
    pub task: String,
    /// World-axis phase-encoding direction, if recorded.
    pub unwarp_dir: Option<String>,
}

impl FunctionalRun {
    fn from_entry(entry: &FileEntry) -> Result<Self, ConfigurationError> {
        let name = fmri_name(&entry.path).ok_or_else(|| entry.missing("task"))?;
        let task = task_name(&entry.path).ok_or_else(|| entry.missing("task"))?;
        let unwarp_dir = entry.text(PED_KEY).map(ijk_to_xyz).transpose()?;
        Ok(Self {
            relpath: relative_to_subject(&entry.path).unwrap_or_else(|| entry.path.clone()),
            path: entry.path.clone(),
            name,
            task,
            unwarp_dir,
        })
    }
}

/// Dataset facts resolved for one session.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSession {
    /// Subject label.
    pub subject: String,
    /// Session label, if any.
    pub session: Option<String>,
    /// T1-weighted images.
    pub t1w: Vec<PathBuf>,
    /// T2-weighted images.
    pub t2w: Vec<PathBuf>,
    /// T1w sample spacing in seconds.
    pub t1_sample_spacing: String,
    /// T2w sample spacing in seconds.
    pub t2_sample_spacing: Option<String>,
    /// Readout direction of the anatomical images.
    pub unwarp_dir: String,
    /// Calibration files.
    pub field_maps: FieldMapSet,
    /// Spin-echo echo spacing (TOPUP only).
    pub echo_spacing: Option<String>,
    /// Spin-echo unwarp direction (TOPUP only).
    pub se_unwarp_dir: Option<String>,
    /// Echo-time difference in milliseconds (FIELDMAP only).
    pub echo_diff: Option<String>,
    /// Magnitude input (FIELDMAP only).
    pub fmap_mag: Option<String>,
    /// Phase input (FIELDMAP only).
    pub fmap_phase: Option<String>,
    /// Functional runs in dataset order.
    pub functional: Vec<FunctionalRun>,
    /// Directory holding the session's raw data.
    pub session_root: Option<PathBuf>,
    /// True if diffusion data was found.
    pub has_dwi: bool,
}

impl ResolvedSession {
    /// Returns the distortion-correction method.
    #[must_use]
    pub fn method(&self) -> DistortionCorrectionMethod {
        self.field_maps.method()
    }

    /// Returns true if T2w images are processed.
    #[must_use]
    pub fn use_t2(&self) -> bool {
        !self.t2w.is_empty()
    }

    /// Returns true if the session has functional runs.
    #[must_use]
    pub fn has_functional(&self) -> bool {
        !self.functional.is_empty()
    }
}

/// Resolves one session.
pub fn resolve(raw: &RawSession) -> Result<ResolvedSession, ConfigurationError> {
    let t1w = raw.files(&ScanType::T1w);
    let Some(first_t1) = t1w.first() else {
        return Err(ConfigurationError::MissingRequiredModality {
            modality: ScanType::T1w.suffix().to_string(),
            subject: raw.subject.clone(),
        });
    };
    let t2w = raw.files(&ScanType::T2w);

    let functional = raw
        .files(&ScanType::Bold)
        .iter()
        .map(FunctionalRun::from_entry)
        .collect::<Result<Vec<_>, _>>()?;

    let field_maps = classify(raw)?;
    let mut resolved = ResolvedSession {
        subject: raw.subject.clone(),
        session: raw.session.clone(),
        t1w: t1w.iter().map(|e| e.path.clone()).collect(),
        t2w: t2w.iter().map(|e| e.path.clone()).collect(),
        t1_sample_spacing: sample_spacing(first_t1)?,
        t2_sample_spacing: t2w.first().map(sample_spacing).transpose()?,
        unwarp_dir: readout_dir(first_t1)?,
        field_maps,
        echo_spacing: None,
        se_unwarp_dir: None,
        echo_diff: None,
        fmap_mag: None,
        fmap_phase: None,
        functional,
        session_root: raw.session_root().map(std::path::Path::to_path_buf),
        has_dwi: raw.has(&ScanType::Dwi),
    };

    match &resolved.field_maps {
        FieldMapSet::SpinEcho { positive, .. } => {
            let first = &positive[0];
            let spacing = first
                .effective_echo_spacing
                .ok_or_else(|| ConfigurationError::MissingMetadata {
                    file: first.path.clone(),
                    key: "EffectiveEchoSpacing".to_string(),
                })?;
            resolved.echo_spacing = Some(format_trimmed(spacing, 12));

            resolved.se_unwarp_dir = Some(match resolved.functional.first() {
                Some(run) => run.unwarp_dir.clone().ok_or_else(|| {
                    ConfigurationError::MissingMetadata {
                        file: run.path.clone(),
                        key: PED_KEY.to_string(),
                    }
                })?,
                None => ijk_to_xyz(&first.phase_encoding_direction)?,
            });

            if let Some(run) = resolved.functional.iter().find(|r| r.unwarp_dir.is_none()) {
                return Err(ConfigurationError::MissingMetadata {
                    file: run.path.clone(),
                    key: PED_KEY.to_string(),
                });
            }
        }
        FieldMapSet::Quartet {
            phase1,
            phase2,
            magnitude1,
            ..
        } => {
            resolved.fmap_mag = Some(magnitude1.display().to_string());
            resolved.fmap_phase = Some(format!("{}@{}", phase1.display(), phase2.display()));
        }
        FieldMapSet::PhaseDiff {
            magnitude1,
            phasediff,
            ..
        } => {
            resolved.fmap_mag = Some(magnitude1.display().to_string());
            resolved.fmap_phase = Some(phasediff.display().to_string());
        }
        FieldMapSet::Empty => {}
    }
    resolved.echo_diff = resolved
        .field_maps
        .echo_difference()
        .map(|seconds| format_general(seconds * 1000.0));

    if resolved.has_dwi {
        warn!(session = %raw.label(), "Diffusion processing is not implemented, skipping dwi data");
    }

    debug!(
        session = %raw.label(),
        method = %resolved.method(),
        runs = resolved.functional.len(),
        use_t2 = resolved.use_t2(),
        "Resolved session"
    );
    Ok(resolved)
}
