//! Read-only access to a hierarchical per-subject, per-session dataset.
//!
//! The resolver never touches the filesystem itself: it consumes a
//! [`RawSession`] produced here, holding the files found for one session and
//! the sidecar metadata attached to each of them.

mod layout;
pub mod naming;

pub use layout::{BidsDirectory, SessionFilter};

use crate::errors::ConfigurationError;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Key/value metadata attached to one file.
pub type Metadata = serde_json::Map<String, Value>;

/// Metadata key linking a calibration file to the scans it corrects.
pub const INTENDED_FOR: &str = "IntendedFor";

/// The kind of acquisition a file holds, taken from its file-name suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScanType {
    /// T1-weighted anatomical.
    T1w,
    /// T2-weighted anatomical.
    T2w,
    /// Functional BOLD run.
    Bold,
    /// Spin-echo field map.
    Epi,
    /// Single magnitude field map.
    Magnitude,
    /// Magnitude image at the first echo.
    Magnitude1,
    /// Magnitude image at the second echo.
    Magnitude2,
    /// Phase difference field map.
    Phasediff,
    /// Phase image at the first echo.
    Phase1,
    /// Phase image at the second echo.
    Phase2,
    /// Pre-computed field map.
    Fieldmap,
    /// Diffusion-weighted run.
    Dwi,
    /// Any other suffix.
    Other(String),
}

impl ScanType {
    /// Returns the file-name suffix of this type.
    #[must_use]
    pub fn suffix(&self) -> &str {
        match self {
            Self::T1w => "T1w",
            Self::T2w => "T2w",
            Self::Bold => "bold",
            Self::Epi => "epi",
            Self::Magnitude => "magnitude",
            Self::Magnitude1 => "magnitude1",
            Self::Magnitude2 => "magnitude2",
            Self::Phasediff => "phasediff",
            Self::Phase1 => "phase1",
            Self::Phase2 => "phase2",
            Self::Fieldmap => "fieldmap",
            Self::Dwi => "dwi",
            Self::Other(s) => s,
        }
    }

    /// Returns true for calibration (field map) types.
    #[must_use]
    pub fn is_field_map(&self) -> bool {
        matches!(
            self,
            Self::Epi
                | Self::Magnitude
                | Self::Magnitude1
                | Self::Magnitude2
                | Self::Phasediff
                | Self::Phase1
                | Self::Phase2
                | Self::Fieldmap
        )
    }
}

impl FromStr for ScanType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "T1w" => Self::T1w,
            "T2w" => Self::T2w,
            "bold" => Self::Bold,
            "epi" => Self::Epi,
            "magnitude" => Self::Magnitude,
            "magnitude1" => Self::Magnitude1,
            "magnitude2" => Self::Magnitude2,
            "phasediff" => Self::Phasediff,
            "phase1" => Self::Phase1,
            "phase2" => Self::Phase2,
            "fieldmap" => Self::Fieldmap,
            "dwi" => Self::Dwi,
            other => Self::Other(other.to_string()),
        })
    }
}

impl fmt::Display for ScanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// One file found in the dataset, with its merged sidecar metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    /// Absolute path of the image.
    pub path: PathBuf,
    /// Acquisition type from the file-name suffix.
    pub scan_type: ScanType,
    /// File-name entities (`task`, `run`, `dir`, ...).
    pub entities: BTreeMap<String, String>,
    /// Sidecar metadata.
    pub metadata: Metadata,
}

impl FileEntry {
    /// Creates an entry with entities parsed from the file name and no metadata.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, scan_type: ScanType) -> Self {
        let path = path.into();
        let entities = naming::parse_file_name(&path)
            .map(|parsed| parsed.entities)
            .unwrap_or_default();
        Self {
            path,
            scan_type,
            entities,
            metadata: Metadata::new(),
        }
    }

    /// Replaces the metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Sets a single metadata value.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Returns a string metadata value.
    #[must_use]
    pub fn text(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// Returns a numeric metadata value.
    #[must_use]
    pub fn number(&self, key: &str) -> Option<f64> {
        self.metadata.get(key).and_then(Value::as_f64)
    }

    /// Returns a numeric metadata value or a `MissingMetadata` error.
    pub fn require_number(&self, key: &str) -> Result<f64, ConfigurationError> {
        self.number(key).ok_or_else(|| self.missing(key))
    }

    /// Returns a string metadata value or a `MissingMetadata` error.
    pub fn require_text(&self, key: &str) -> Result<&str, ConfigurationError> {
        self.text(key).ok_or_else(|| self.missing(key))
    }

    /// Returns the scans this file is linked to.
    ///
    /// Accepts either a single string or a list of strings.
    #[must_use]
    pub fn intended_for(&self) -> Vec<String> {
        match self.metadata.get(INTENDED_FOR) {
            Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Returns a metadata error naming this file.
    #[must_use]
    pub fn missing(&self, key: &str) -> ConfigurationError {
        ConfigurationError::MissingMetadata {
            file: self.path.clone(),
            key: key.to_string(),
        }
    }

    /// Returns the file name as a string, or an empty string.
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }
}

/// All files and metadata found for one subject/session unit.
///
/// Produced once by the dataset layer and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawSession {
    /// Subject label, without the `sub-` prefix.
    pub subject: String,
    /// Session label, without the `ses-` prefix; absent when sessions are
    /// collapsed or the subject has none.
    pub session: Option<String>,
    files: BTreeMap<ScanType, Vec<FileEntry>>,
}

impl RawSession {
    /// Creates an empty session.
    #[must_use]
    pub fn new(subject: impl Into<String>, session: Option<String>) -> Self {
        Self {
            subject: subject.into(),
            session,
            files: BTreeMap::new(),
        }
    }

    /// Adds a file, keeping insertion order within its type.
    #[must_use]
    pub fn with_file(mut self, entry: FileEntry) -> Self {
        self.push(entry);
        self
    }

    /// Adds a file in place.
    pub fn push(&mut self, entry: FileEntry) {
        self.files
            .entry(entry.scan_type.clone())
            .or_default()
            .push(entry);
    }

    /// Returns the files of one type in dataset order.
    #[must_use]
    pub fn files(&self, scan_type: &ScanType) -> &[FileEntry] {
        self.files.get(scan_type).map_or(&[], Vec::as_slice)
    }

    /// Returns the set of types present.
    #[must_use]
    pub fn types(&self) -> BTreeSet<ScanType> {
        self.files
            .iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(t, _)| t.clone())
            .collect()
    }

    /// Returns true if at least one file of this type exists.
    #[must_use]
    pub fn has(&self, scan_type: &ScanType) -> bool {
        !self.files(scan_type).is_empty()
    }

    /// Returns every field-map file, grouped by type in type order.
    pub fn field_maps(&self) -> impl Iterator<Item = &FileEntry> {
        self.files
            .iter()
            .filter(|(t, _)| t.is_field_map())
            .flat_map(|(_, entries)| entries.iter())
    }

    /// Returns a short label such as `sub-01/ses-baseline`.
    #[must_use]
    pub fn label(&self) -> String {
        match &self.session {
            Some(ses) => format!("sub-{}/ses-{}", self.subject, ses),
            None => format!("sub-{}", self.subject),
        }
    }

    /// Returns the directory holding this session's raw data, derived from the first T1w file.
    #[must_use]
    pub fn session_root(&self) -> Option<&Path> {
        self.files(&ScanType::T1w)
            .first()
            .and_then(|entry| entry.path.parent())
            .and_then(Path::parent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scan_type_round_trips_suffix() {
        for suffix in ["T1w", "bold", "epi", "phase2", "magnitude1", "sbref"] {
            let parsed: ScanType = suffix.parse().unwrap();
            assert_eq!(parsed.suffix(), suffix);
        }
        assert_eq!("sbref".parse::<ScanType>().unwrap(), ScanType::Other("sbref".into()));
    }

    #[test]
    fn test_field_map_classification() {
        assert!(ScanType::Epi.is_field_map());
        assert!(ScanType::Phase1.is_field_map());
        assert!(!ScanType::Bold.is_field_map());
        assert!(!ScanType::T1w.is_field_map());
    }

    #[test]
    fn test_intended_for_accepts_string_or_list() {
        let single = FileEntry::new("/d/sub-01/fmap/sub-01_dir-AP_epi.nii.gz", ScanType::Epi)
            .with_field(INTENDED_FOR, json!("func/sub-01_task-rest_bold.nii.gz"));
        assert_eq!(single.intended_for().len(), 1);

        let list = FileEntry::new("/d/sub-01/fmap/sub-01_dir-AP_epi.nii.gz", ScanType::Epi)
            .with_field(INTENDED_FOR, json!(["a.nii.gz", "", "b.nii.gz"]));
        assert_eq!(list.intended_for(), vec!["a.nii.gz", "b.nii.gz"]);

        let empty = FileEntry::new("/d/sub-01/fmap/sub-01_dir-AP_epi.nii.gz", ScanType::Epi)
            .with_field(INTENDED_FOR, json!([]));
        assert!(empty.intended_for().is_empty());
    }

    #[test]
    fn test_entry_parses_entities() {
        let entry = FileEntry::new(
            "/d/sub-01/ses-A/func/sub-01_ses-A_task-rest_run-02_bold.nii.gz",
            ScanType::Bold,
        );
        assert_eq!(entry.entities.get("task").map(String::as_str), Some("rest"));
        assert_eq!(entry.entities.get("run").map(String::as_str), Some("02"));
    }

    #[test]
    fn test_session_types_and_label() {
        let session = RawSession::new("01", Some("A".into()))
            .with_file(FileEntry::new("/d/sub-01/ses-A/anat/sub-01_ses-A_T1w.nii.gz", ScanType::T1w))
            .with_file(FileEntry::new("/d/sub-01/ses-A/fmap/sub-01_ses-A_dir-PA_epi.nii.gz", ScanType::Epi));

        assert_eq!(session.label(), "sub-01/ses-A");
        assert!(session.has(&ScanType::T1w));
        assert!(!session.has(&ScanType::Bold));
        assert_eq!(session.types().len(), 2);
        assert_eq!(session.field_maps().count(), 1);
        assert_eq!(session.session_root(), Some(Path::new("/d/sub-01/ses-A")));
    }

    #[test]
    fn test_require_number_reports_file() {
        let entry = FileEntry::new("/d/sub-01/anat/sub-01_T1w.nii.gz", ScanType::T1w);
        let err = entry.require_number("DwellTime").unwrap_err();
        assert_eq!(err.code(), "CONFIG-MISSING_METADATA");
    }
}
