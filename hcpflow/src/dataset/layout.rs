//! Filesystem index of a BIDS-style dataset.

use super::naming::{parse_file_name, ParsedName};
use super::{FileEntry, Metadata, RawSession, ScanType};
use crate::errors::DatasetError;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Directories under the dataset root that never hold raw session data.
const SKIPPED_DIRS: &[&str] = &["derivatives", "sourcedata", "code", "stimuli"];

/// Datatype directories the pipeline reads.
const DATATYPES: &[&str] = &["anat", "func", "fmap", "dwi"];

/// Which (subject, session) units to produce.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    /// Subject labels to keep (without `sub-`); all when `None`.
    pub subjects: Option<Vec<String>>,
    /// Session labels to keep (without `ses-`); all when `None`.
    pub sessions: Option<Vec<String>>,
    /// Collapse all sessions of a subject into one unit.
    pub collect_on_subject: bool,
}

impl SessionFilter {
    /// Creates a filter that selects everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts to the given subjects.
    #[must_use]
    pub fn with_subjects(mut self, subjects: Vec<String>) -> Self {
        self.subjects = Some(subjects);
        self
    }

    /// Restricts to the given sessions.
    #[must_use]
    pub fn with_sessions(mut self, sessions: Vec<String>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Collapses sessions per subject.
    #[must_use]
    pub fn collect_on_subject(mut self) -> Self {
        self.collect_on_subject = true;
        self
    }

    fn keeps_subject(&self, subject: &str) -> bool {
        self.subjects
            .as_ref()
            .map_or(true, |s| s.iter().any(|x| x == subject))
    }

    fn keeps_session(&self, session: &str) -> bool {
        self.sessions
            .as_ref()
            .map_or(true, |s| s.iter().any(|x| x == session))
    }
}

#[derive(Debug, Clone)]
struct IndexedImage {
    path: PathBuf,
    subject: String,
    session: Option<String>,
    parsed: ParsedName,
}

#[derive(Debug, Clone)]
struct Sidecar {
    dir: PathBuf,
    depth: usize,
    parsed: ParsedName,
    content: Metadata,
}

impl Sidecar {
    fn applies_to(&self, image: &IndexedImage) -> bool {
        self.parsed.suffix == image.parsed.suffix
            && image.path.parent().is_some_and(|dir| dir.starts_with(&self.dir))
            && self
                .parsed
                .entities
                .iter()
                .all(|(k, v)| image.parsed.entities.get(k) == Some(v))
    }
}

/// An indexed, read-only view of a dataset directory.
#[derive(Debug, Clone)]
pub struct BidsDirectory {
    root: PathBuf,
    images: Vec<IndexedImage>,
    sidecars: Vec<Sidecar>,
}

impl BidsDirectory {
    /// Indexes every image and sidecar under `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, DatasetError> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(DatasetError::NotADirectory(root));
        }

        let mut images = Vec::new();
        let mut sidecars = Vec::new();

        let walker = WalkDir::new(&root)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                let name = e.file_name().to_string_lossy();
                e.depth() == 0 || !(name.starts_with('.') || SKIPPED_DIRS.contains(&name.as_ref()))
            });

        for entry in walker {
            let entry = entry.map_err(|e| DatasetError::Walk(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let Some(parsed) = parse_file_name(path) else {
                continue;
            };
            let Ok(relative) = path.strip_prefix(&root) else {
                continue;
            };

            match parsed.extension.as_str() {
                ".nii.gz" | ".nii" => {
                    if let Some(image) = index_image(path, relative, parsed) {
                        images.push(image);
                    }
                }
                ".json" => sidecars.push(read_sidecar(path, relative, parsed)?),
                _ => {}
            }
        }

        debug!(
            root = %root.display(),
            images = images.len(),
            sidecars = sidecars.len(),
            "Indexed dataset"
        );

        Ok(Self {
            root,
            images,
            sidecars,
        })
    }

    /// Returns the dataset root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns all subject labels, sorted.
    #[must_use]
    pub fn subjects(&self) -> Vec<String> {
        self.images
            .iter()
            .map(|i| i.subject.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Returns the session labels of one subject, sorted.
    #[must_use]
    pub fn sessions_of(&self, subject: &str) -> Vec<String> {
        self.images
            .iter()
            .filter(|i| i.subject == subject)
            .filter_map(|i| i.session.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Returns the merged sidecar metadata for an image.
    ///
    /// Less specific sidecars (closer to the root, fewer entities) are
    /// applied first so more specific ones override them.
    fn metadata_for(&self, image: &IndexedImage) -> Metadata {
        let mut applicable: Vec<&Sidecar> =
            self.sidecars.iter().filter(|s| s.applies_to(image)).collect();
        applicable.sort_by_key(|s| (s.depth, s.parsed.entities.len()));

        let mut merged = Metadata::new();
        for sidecar in applicable {
            for (k, v) in &sidecar.content {
                merged.insert(k.clone(), v.clone());
            }
        }
        merged
    }

    /// Produces one [`RawSession`] per selected (subject, session) unit.
    pub fn sessions(&self, filter: &SessionFilter) -> Result<Vec<RawSession>, DatasetError> {
        let mut units: Vec<(String, Option<String>, Vec<Option<String>>)> = Vec::new();

        for subject in self.subjects().into_iter().filter(|s| filter.keeps_subject(s)) {
            let sessions = self.sessions_of(&subject);
            if sessions.is_empty() {
                units.push((subject, None, vec![None]));
                continue;
            }

            let selected: Vec<Option<String>> = sessions
                .into_iter()
                .filter(|s| filter.keeps_session(s))
                .map(Some)
                .collect();
            if selected.is_empty() {
                continue;
            }

            if filter.collect_on_subject {
                units.push((subject, None, selected));
            } else {
                for ses in selected {
                    units.push((subject.clone(), ses.clone(), vec![ses]));
                }
            }
        }

        if units.is_empty() {
            return Err(DatasetError::NoSessions);
        }

        Ok(units
            .into_iter()
            .map(|(subject, label, members)| self.build_session(subject, label, &members))
            .collect())
    }

    fn build_session(
        &self,
        subject: String,
        label: Option<String>,
        members: &[Option<String>],
    ) -> RawSession {
        let mut session = RawSession::new(subject.clone(), label);
        for image in self
            .images
            .iter()
            .filter(|i| i.subject == subject && members.contains(&i.session))
        {
            let scan_type: ScanType = image
                .parsed
                .suffix
                .parse()
                .unwrap_or_else(|never| match never {});
            session.push(FileEntry {
                path: image.path.clone(),
                scan_type,
                entities: image.parsed.entities.clone(),
                metadata: self.metadata_for(image),
            });
        }
        session
    }
}

fn index_image(path: &Path, relative: &Path, parsed: ParsedName) -> Option<IndexedImage> {
    let parts: Vec<&str> = relative.iter().filter_map(|p| p.to_str()).collect();
    let (subject_dir, session_dir, datatype) = match parts.as_slice() {
        [sub, datatype, _file] => (*sub, None, *datatype),
        [sub, ses, datatype, _file] if ses.starts_with("ses-") => (*sub, Some(*ses), *datatype),
        _ => return None,
    };

    let subject = subject_dir.strip_prefix("sub-")?;
    if !DATATYPES.contains(&datatype) {
        warn!(path = %path.display(), datatype, "Skipping file in unsupported datatype directory");
        return None;
    }

    Some(IndexedImage {
        path: path.to_path_buf(),
        subject: subject.to_string(),
        session: session_dir.and_then(|s| s.strip_prefix("ses-")).map(str::to_string),
        parsed,
    })
}

fn read_sidecar(path: &Path, relative: &Path, parsed: ParsedName) -> Result<Sidecar, DatasetError> {
    let text = fs::read_to_string(path)?;
    let value: serde_json::Value =
        serde_json::from_str(&text).map_err(|e| DatasetError::InvalidSidecar {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
    let serde_json::Value::Object(content) = value else {
        return Err(DatasetError::InvalidSidecar {
            path: path.to_path_buf(),
            message: "expected a JSON object".to_string(),
        });
    };

    Ok(Sidecar {
        dir: path.parent().map(Path::to_path_buf).unwrap_or_default(),
        depth: relative.components().count(),
        parsed,
        content,
    })
}
