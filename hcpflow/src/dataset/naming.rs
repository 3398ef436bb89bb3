//! File-name conventions of the dataset.

use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

#[allow(clippy::expect_used)]
static TASK_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r".*(task-[^_]+).*run-([0-9]+).*").expect("valid task/run pattern"));

#[allow(clippy::expect_used)]
static TASK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r".*(task-[^_]+).*").expect("valid task pattern"));

#[allow(clippy::expect_used)]
static ENTITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<key>[A-Za-z0-9]+)-(?P<value>[A-Za-z0-9+]+)$").expect("valid entity pattern")
});

/// Entities, suffix and extension parsed from a dataset file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    /// `key-value` pairs in file-name order.
    pub entities: BTreeMap<String, String>,
    /// Trailing suffix (`T1w`, `bold`, `epi`, ...).
    pub suffix: String,
    /// Extension including the leading dot (`.nii.gz`, `.json`).
    pub extension: String,
}

/// Splits `sub-01_ses-A_task-rest_bold.nii.gz` into entities, suffix and extension.
///
/// Returns `None` for names without a suffix token.
#[must_use]
pub fn parse_file_name(path: &Path) -> Option<ParsedName> {
    let name = path.file_name()?.to_str()?;
    let (stem, extension) = match name.find('.') {
        Some(idx) => (&name[..idx], name[idx..].to_string()),
        None => (name, String::new()),
    };

    let mut tokens: Vec<&str> = stem.split('_').collect();
    let suffix = tokens.pop()?;
    if suffix.is_empty() || suffix.contains('-') {
        return None;
    }

    let entities = tokens
        .into_iter()
        .filter_map(|token| {
            ENTITY
                .captures(token)
                .map(|caps| (caps["key"].to_string(), caps["value"].to_string()))
        })
        .collect();

    Some(ParsedName {
        entities,
        suffix: suffix.to_string(),
        extension,
    })
}

/// Returns the run name of a functional file, e.g. `task-rest01`.
///
/// Files without a `run` entity are treated as run `01`.
#[must_use]
pub fn fmri_name(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    if let Some(caps) = TASK_RUN.captures(name) {
        return Some(format!("{}{}", &caps[1], &caps[2]));
    }
    task_name(path).map(|task| format!("{task}01"))
}

/// Returns the task of a functional file, e.g. `task-nback`.
#[must_use]
pub fn task_name(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    TASK.captures(name).map(|caps| caps[1].to_string())
}

/// Returns the path relative to the enclosing `sub-*` directory.
///
/// This is the form `IntendedFor` links are written in, e.g.
/// `ses-A/func/sub-01_ses-A_task-rest_bold.nii.gz`.
#[must_use]
pub fn relative_to_subject(path: &Path) -> Option<PathBuf> {
    let subject_dir = path.ancestors().skip(1).find(|dir| {
        dir.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("sub-"))
    })?;
    path.strip_prefix(subject_dir).ok().map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_file_name() {
        let parsed =
            parse_file_name(Path::new("/x/sub-01_ses-A_task-rest_run-2_bold.nii.gz")).unwrap();

        assert_eq!(parsed.suffix, "bold");
        assert_eq!(parsed.extension, ".nii.gz");
        assert_eq!(parsed.entities.len(), 4);
        assert_eq!(parsed.entities["ses"], "A");
    }

    #[test]
    fn test_parse_rejects_suffixless_names() {
        assert!(parse_file_name(Path::new("sub-01.nii.gz")).is_none());
    }

    #[test]
    fn test_fmri_name_with_run() {
        let name = fmri_name(Path::new("/x/sub-01_task-rest_run-02_bold.nii.gz"));
        assert_eq!(name.as_deref(), Some("task-rest02"));
    }

    #[test]
    fn test_fmri_name_defaults_to_run_01() {
        let name = fmri_name(Path::new("/x/sub-01_task-nback_bold.nii.gz"));
        assert_eq!(name.as_deref(), Some("task-nback01"));
    }

    #[test]
    fn test_fmri_name_requires_task() {
        assert!(fmri_name(Path::new("/x/sub-01_bold.nii.gz")).is_none());
    }

    #[test]
    fn test_relative_to_subject() {
        let rel = relative_to_subject(Path::new(
            "/data/sub-01/ses-A/func/sub-01_ses-A_task-rest_bold.nii.gz",
        ));
        assert_eq!(
            rel,
            Some(PathBuf::from("ses-A/func/sub-01_ses-A_task-rest_bold.nii.gz"))
        );
    }

    #[test]
    fn test_relative_to_subject_without_session() {
        let rel = relative_to_subject(Path::new("/data/sub-01/func/sub-01_task-rest_bold.nii.gz"));
        assert_eq!(rel, Some(PathBuf::from("func/sub-01_task-rest_bold.nii.gz")));
    }
}
