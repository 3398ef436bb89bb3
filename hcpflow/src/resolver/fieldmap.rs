//! Field-map classification and spin-echo pairing.

use crate::dataset::{FileEntry, RawSession, ScanType};
use crate::errors::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::warn;

const ECHO_TIME_KEY: &str = "EchoTime";
const PED_KEY: &str = "PhaseEncodingDirection";
const ECHO_TIME_TOLERANCE: f64 = 1e-9;

/// Distortion-correction strategy of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum DistortionCorrectionMethod {
    /// Spin-echo pair correction.
    Topup,
    /// Phase/magnitude correction.
    Fieldmap,
    /// No correction.
    #[default]
    None,
}

impl DistortionCorrectionMethod {
    /// Returns the token passed to the processing scripts.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Topup => "TOPUP",
            Self::Fieldmap => "FIELDMAP",
            Self::None => "NONE",
        }
    }
}

impl fmt::Display for DistortionCorrectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One spin-echo field map.
#[derive(Debug, Clone, PartialEq)]
pub struct SpinEchoFile {
    /// Image path.
    pub path: PathBuf,
    /// Scans this field map is linked to.
    pub intended_for: Vec<String>,
    /// Recorded phase-encoding direction (`j`, `j-`, ...).
    pub phase_encoding_direction: String,
    /// Effective echo spacing in seconds, if recorded.
    pub effective_echo_spacing: Option<f64>,
}

impl SpinEchoFile {
    fn from_entry(entry: &FileEntry) -> Result<Self, ConfigurationError> {
        Ok(Self {
            path: entry.path.clone(),
            intended_for: entry.intended_for(),
            phase_encoding_direction: entry.require_text(PED_KEY)?.to_string(),
            effective_echo_spacing: entry.number("EffectiveEchoSpacing"),
        })
    }

    /// Returns true if the direction carries no sign.
    #[must_use]
    pub fn is_positive(&self) -> bool {
        !self.phase_encoding_direction.contains('-')
    }

    fn targets(&self, target: &PairTarget<'_>) -> bool {
        match target {
            PairTarget::Anatomical => self.intended_for.iter().any(|t| t.contains("T1w")),
            PairTarget::Run(relpath) => {
                let relpath = relpath.to_string_lossy();
                !relpath.is_empty() && self.intended_for.iter().any(|t| t.contains(relpath.as_ref()))
            }
        }
    }
}

/// What a spin-echo pair is being chosen for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairTarget<'a> {
    /// Anatomical distortion correction.
    Anatomical,
    /// A functional run, by path relative to the subject directory.
    Run(&'a Path),
}

/// A positive/negative spin-echo pair chosen for one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpinEchoPair {
    /// Positive-polarity image.
    pub positive: PathBuf,
    /// Negative-polarity image.
    pub negative: PathBuf,
}

/// Resolved calibration data of a session.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum FieldMapSet {
    /// No usable calibration.
    #[default]
    Empty,
    /// Spin-echo files split by phase-encoding polarity.
    SpinEcho {
        /// Files whose direction has no sign.
        positive: Vec<SpinEchoFile>,
        /// Files whose direction ends or starts with `-`.
        negative: Vec<SpinEchoFile>,
    },
    /// Two phase and two magnitude images at two echo times.
    Quartet {
        /// Phase at the shorter echo.
        phase1: PathBuf,
        /// Phase at the longer echo.
        phase2: PathBuf,
        /// Magnitude at the shorter echo.
        magnitude1: PathBuf,
        /// Magnitude at the longer echo.
        magnitude2: PathBuf,
        /// Shorter and longer echo time, in seconds.
        echo_times: (f64, f64),
    },
    /// Two magnitude images and a phase difference image.
    PhaseDiff {
        /// Magnitude at the shorter echo.
        magnitude1: PathBuf,
        /// Magnitude at the longer echo.
        magnitude2: PathBuf,
        /// Phase difference image.
        phasediff: PathBuf,
        /// Shorter and longer echo time, in seconds.
        echo_times: (f64, f64),
    },
}

impl FieldMapSet {
    /// Returns the correction method this shape implies.
    #[must_use]
    pub fn method(&self) -> DistortionCorrectionMethod {
        match self {
            Self::SpinEcho { .. } => DistortionCorrectionMethod::Topup,
            Self::Quartet { .. } | Self::PhaseDiff { .. } => DistortionCorrectionMethod::Fieldmap,
            Self::Empty => DistortionCorrectionMethod::None,
        }
    }

    /// Returns the echo-time difference in seconds for phase/magnitude sets.
    #[must_use]
    pub fn echo_difference(&self) -> Option<f64> {
        match self {
            Self::Quartet { echo_times, .. } | Self::PhaseDiff { echo_times, .. } => {
                Some(echo_times.1 - echo_times.0)
            }
            _ => None,
        }
    }

    /// Chooses the spin-echo pair linked to `target`.
    ///
    /// Each polarity is matched on its own; a polarity with no explicit
    /// link falls back to its first file with a warning. Returns `None`
    /// for non spin-echo sets.
    #[must_use]
    pub fn select_pair(&self, target: &PairTarget<'_>) -> Option<SpinEchoPair> {
        let Self::SpinEcho { positive, negative } = self else {
            return None;
        };
        Some(SpinEchoPair {
            positive: pick(positive, target, "positive")?,
            negative: pick(negative, target, "negative")?,
        })
    }
}

fn pick(files: &[SpinEchoFile], target: &PairTarget<'_>, polarity: &str) -> Option<PathBuf> {
    if let Some(file) = files.iter().find(|f| f.targets(target)) {
        return Some(file.path.clone());
    }
    let first = files.first()?;
    let target = match target {
        PairTarget::Anatomical => "anatomical".to_string(),
        PairTarget::Run(relpath) => relpath.display().to_string(),
    };
    warn!(
        polarity,
        target = %target,
        fallback = %first.path.display(),
        "Intended spin echo not linked in sidecar, using first available"
    );
    Some(first.path.clone())
}

/// Classifies the linked field maps of a session into one [`FieldMapSet`].
pub fn classify(raw: &RawSession) -> Result<FieldMapSet, ConfigurationError> {
    let mut eligible: Vec<&FileEntry> = Vec::new();
    for entry in raw.field_maps() {
        if entry.intended_for().is_empty() {
            warn!(
                file = %entry.path.display(),
                "Field map has no IntendedFor link and will not be used"
            );
        } else {
            eligible.push(entry);
        }
    }

    let types: BTreeSet<ScanType> = eligible.iter().map(|e| e.scan_type.clone()).collect();
    if types.is_empty() {
        return Ok(FieldMapSet::Empty);
    }

    if types.contains(&ScanType::Epi) {
        if types.len() > 1 {
            return Err(ConfigurationError::AmbiguousFieldMapTypes {
                types: types.iter().map(|t| t.suffix().to_string()).collect(),
            });
        }
        return spin_echo(&eligible);
    }

    let single = |scan_type: ScanType| -> Option<&FileEntry> {
        let mut matching = eligible.iter().filter(|e| e.scan_type == scan_type);
        match (matching.next(), matching.next()) {
            (Some(entry), None) => Some(*entry),
            _ => None,
        }
    };

    let quartet: BTreeSet<ScanType> = [
        ScanType::Phase1,
        ScanType::Phase2,
        ScanType::Magnitude1,
        ScanType::Magnitude2,
    ]
    .into_iter()
    .collect();
    let triple: BTreeSet<ScanType> = [ScanType::Magnitude1, ScanType::Magnitude2, ScanType::Phasediff]
        .into_iter()
        .collect();

    if types == quartet && eligible.len() == 4 {
        if let (Some(p1), Some(p2), Some(m1), Some(m2)) = (
            single(ScanType::Phase1),
            single(ScanType::Phase2),
            single(ScanType::Magnitude1),
            single(ScanType::Magnitude2),
        ) {
            let echo_times = ordered_echo_times(&[p1, m1], &[p2, m2])?;
            return Ok(FieldMapSet::Quartet {
                phase1: p1.path.clone(),
                phase2: p2.path.clone(),
                magnitude1: m1.path.clone(),
                magnitude2: m2.path.clone(),
                echo_times,
            });
        }
    }

    if types == triple && eligible.len() == 3 {
        if let (Some(m1), Some(m2), Some(pd)) = (
            single(ScanType::Magnitude1),
            single(ScanType::Magnitude2),
            single(ScanType::Phasediff),
        ) {
            let echo_times = ordered_echo_times(&[m1], &[m2])?;
            return Ok(FieldMapSet::PhaseDiff {
                magnitude1: m1.path.clone(),
                magnitude2: m2.path.clone(),
                phasediff: pd.path.clone(),
                echo_times,
            });
        }
    }

    warn!(
        types = %types.iter().map(ScanType::suffix).collect::<Vec<_>>().join(", "),
        files = eligible.len(),
        "Unsupported field map set, distortion correction disabled"
    );
    Ok(FieldMapSet::Empty)
}

fn spin_echo(eligible: &[&FileEntry]) -> Result<FieldMapSet, ConfigurationError> {
    let files = eligible
        .iter()
        .map(|e| SpinEchoFile::from_entry(e))
        .collect::<Result<Vec<_>, _>>()?;
    let (positive, negative): (Vec<_>, Vec<_>) = files.into_iter().partition(SpinEchoFile::is_positive);

    if positive.is_empty() || negative.is_empty() {
        return Err(ConfigurationError::IncompleteSpinEchoPair {
            positive: positive.len(),
            negative: negative.len(),
        });
    }
    Ok(FieldMapSet::SpinEcho { positive, negative })
}

fn same_echo(a: f64, b: f64) -> bool {
    (a - b).abs() < ECHO_TIME_TOLERANCE
}

/// Checks that the first-echo files share the shorter of exactly two
/// distinct echo times and returns `(short, long)`.
fn ordered_echo_times(
    first: &[&FileEntry],
    second: &[&FileEntry],
) -> Result<(f64, f64), ConfigurationError> {
    let mut recorded = Vec::with_capacity(first.len() + second.len());
    for entry in first.iter().chain(second) {
        recorded.push((*entry, entry.require_number(ECHO_TIME_KEY)?));
    }

    let mut distinct: Vec<f64> = Vec::new();
    for (_, te) in &recorded {
        if !distinct.iter().any(|d| same_echo(*d, *te)) {
            distinct.push(*te);
        }
    }
    distinct.sort_by(f64::total_cmp);
    if distinct.len() != 2 {
        return Err(ConfigurationError::IrregularEchoTimes { echo_times: distinct });
    }
    let (short, long) = (distinct[0], distinct[1]);

    for (i, (entry, te)) in recorded.iter().enumerate() {
        let expected = if i < first.len() { short } else { long };
        if !same_echo(*te, expected) {
            return Err(ConfigurationError::EchoTimeOrderingError {
                file: entry.file_name().to_string(),
                expected,
                found: *te,
            });
        }
    }
    Ok((short, long))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::INTENDED_FOR;
    use serde_json::json;

    const RUN: &str = "func/sub-01_task-rest_bold.nii.gz";

    fn fmap(name: &str, scan_type: ScanType) -> FileEntry {
        FileEntry::new(format!("/d/sub-01/fmap/{name}"), scan_type)
            .with_field(INTENDED_FOR, json!([RUN]))
    }

    fn epi(name: &str, ped: &str) -> FileEntry {
        fmap(name, ScanType::Epi)
            .with_field("PhaseEncodingDirection", json!(ped))
            .with_field("EffectiveEchoSpacing", json!(0.00058))
    }

    fn echo(name: &str, scan_type: ScanType, te: f64) -> FileEntry {
        fmap(name, scan_type).with_field("EchoTime", json!(te))
    }

    fn session(files: Vec<FileEntry>) -> RawSession {
        files
            .into_iter()
            .fold(RawSession::new("01", None), RawSession::with_file)
    }

    #[test]
    fn test_no_field_maps_is_empty() {
        let set = classify(&RawSession::new("01", None)).unwrap();
        assert_eq!(set, FieldMapSet::Empty);
        assert_eq!(set.method(), DistortionCorrectionMethod::None);
    }

    #[test]
    fn test_unlinked_field_maps_are_ignored() {
        let orphan = FileEntry::new("/d/sub-01/fmap/sub-01_dir-AP_epi.nii.gz", ScanType::Epi)
            .with_field("PhaseEncodingDirection", json!("j"));
        let set = classify(&session(vec![orphan])).unwrap();
        assert_eq!(set.method(), DistortionCorrectionMethod::None);
    }

    #[test]
    fn test_spin_echo_partition() {
        let raw = session(vec![
            epi("sub-01_dir-PA_run-1_epi.nii.gz", "j"),
            epi("sub-01_dir-AP_run-1_epi.nii.gz", "j-"),
            epi("sub-01_dir-PA_run-2_epi.nii.gz", "j"),
        ]);
        let set = classify(&raw).unwrap();

        assert_eq!(set.method(), DistortionCorrectionMethod::Topup);
        let FieldMapSet::SpinEcho { positive, negative } = set else {
            panic!("expected spin echo set");
        };
        assert_eq!(positive.len(), 2);
        assert_eq!(negative.len(), 1);
        assert!(negative[0].path.ends_with("sub-01_dir-AP_run-1_epi.nii.gz"));
    }

    #[test]
    fn test_spin_echo_needs_both_polarities() {
        let raw = session(vec![epi("sub-01_dir-PA_epi.nii.gz", "j")]);
        assert!(matches!(
            classify(&raw),
            Err(ConfigurationError::IncompleteSpinEchoPair { positive: 1, negative: 0 })
        ));
    }

    #[test]
    fn test_mixed_types_are_ambiguous() {
        let raw = session(vec![
            epi("sub-01_dir-PA_epi.nii.gz", "j"),
            echo("sub-01_magnitude1.nii.gz", ScanType::Magnitude1, 0.00492),
        ]);
        let err = classify(&raw).unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::AmbiguousFieldMapTypes {
                types: vec!["epi".into(), "magnitude1".into()]
            }
        );
    }

    #[test]
    fn test_quartet() {
        let raw = session(vec![
            echo("sub-01_phase1.nii.gz", ScanType::Phase1, 0.00492),
            echo("sub-01_phase2.nii.gz", ScanType::Phase2, 0.00738),
            echo("sub-01_magnitude1.nii.gz", ScanType::Magnitude1, 0.00492),
            echo("sub-01_magnitude2.nii.gz", ScanType::Magnitude2, 0.00738),
        ]);
        let set = classify(&raw).unwrap();

        assert_eq!(set.method(), DistortionCorrectionMethod::Fieldmap);
        let diff = set.echo_difference().unwrap();
        assert!((diff - 0.00246).abs() < 1e-12);
    }

    #[test]
    fn test_quartet_with_single_echo_time() {
        let raw = session(vec![
            echo("sub-01_phase1.nii.gz", ScanType::Phase1, 0.005),
            echo("sub-01_phase2.nii.gz", ScanType::Phase2, 0.005),
            echo("sub-01_magnitude1.nii.gz", ScanType::Magnitude1, 0.005),
            echo("sub-01_magnitude2.nii.gz", ScanType::Magnitude2, 0.005),
        ]);
        assert!(matches!(
            classify(&raw),
            Err(ConfigurationError::IrregularEchoTimes { .. })
        ));
    }

    #[test]
    fn test_quartet_out_of_order() {
        let raw = session(vec![
            echo("sub-01_phase1.nii.gz", ScanType::Phase1, 0.00738),
            echo("sub-01_phase2.nii.gz", ScanType::Phase2, 0.00492),
            echo("sub-01_magnitude1.nii.gz", ScanType::Magnitude1, 0.00492),
            echo("sub-01_magnitude2.nii.gz", ScanType::Magnitude2, 0.00738),
        ]);
        let err = classify(&raw).unwrap_err();
        assert_eq!(err.code(), "CONFIG-ECHO_TIME_ORDER");
    }

    #[test]
    fn test_phasediff_triple() {
        let raw = session(vec![
            echo("sub-01_magnitude1.nii.gz", ScanType::Magnitude1, 0.00492),
            echo("sub-01_magnitude2.nii.gz", ScanType::Magnitude2, 0.00738),
            fmap("sub-01_phasediff.nii.gz", ScanType::Phasediff),
        ]);
        let set = classify(&raw).unwrap();
        assert!(matches!(set, FieldMapSet::PhaseDiff { .. }));
        assert_eq!(set.method(), DistortionCorrectionMethod::Fieldmap);
    }

    #[test]
    fn test_partial_set_degrades_to_none() {
        let raw = session(vec![
            echo("sub-01_phase1.nii.gz", ScanType::Phase1, 0.00492),
            echo("sub-01_magnitude1.nii.gz", ScanType::Magnitude1, 0.00492),
        ]);
        assert_eq!(classify(&raw).unwrap(), FieldMapSet::Empty);
    }

    #[test]
    fn test_select_pair_by_link() {
        let other = "func/sub-01_task-nback_bold.nii.gz";
        let raw = session(vec![
            epi("sub-01_dir-PA_run-1_epi.nii.gz", "j"),
            epi("sub-01_dir-AP_run-1_epi.nii.gz", "j-"),
            epi("sub-01_dir-PA_run-2_epi.nii.gz", "j").with_field(INTENDED_FOR, json!([other])),
            epi("sub-01_dir-AP_run-2_epi.nii.gz", "j-").with_field(INTENDED_FOR, json!(other)),
        ]);
        let set = classify(&raw).unwrap();

        let pair = set.select_pair(&PairTarget::Run(Path::new(other))).unwrap();
        assert!(pair.positive.ends_with("sub-01_dir-PA_run-2_epi.nii.gz"));
        assert!(pair.negative.ends_with("sub-01_dir-AP_run-2_epi.nii.gz"));

        let pair = set.select_pair(&PairTarget::Run(Path::new(RUN))).unwrap();
        assert!(pair.positive.ends_with("sub-01_dir-PA_run-1_epi.nii.gz"));
    }

    #[test]
    fn test_select_pair_falls_back_to_first() {
        let raw = session(vec![
            epi("sub-01_dir-PA_epi.nii.gz", "j"),
            epi("sub-01_dir-AP_epi.nii.gz", "j-"),
        ]);
        let set = classify(&raw).unwrap();

        let pair = set.select_pair(&PairTarget::Anatomical).unwrap();
        assert!(pair.positive.ends_with("sub-01_dir-PA_epi.nii.gz"));
        assert!(pair.negative.ends_with("sub-01_dir-AP_epi.nii.gz"));
        assert!(FieldMapSet::Empty.select_pair(&PairTarget::Anatomical).is_none());
    }

    #[test]
    fn test_method_display() {
        assert_eq!(DistortionCorrectionMethod::Topup.to_string(), "TOPUP");
        assert_eq!(DistortionCorrectionMethod::default().to_string(), "NONE");
    }
}
