//! Expected-output declarations, keyed by stage name.

use crate::errors::HcpflowError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

const BUILTIN_JSON: &str = include_str!("expected_outputs.json");

#[allow(clippy::expect_used)]
static BUILTIN: LazyLock<ExpectedOutputCatalog> = LazyLock::new(|| {
    serde_json::from_str(BUILTIN_JSON).expect("embedded expected_outputs.json is valid")
});

/// Output-path templates each stage must produce.
///
/// A stage absent from the catalog, or listed with no templates, declares
/// no outputs and can only complete unchecked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExpectedOutputCatalog {
    stages: BTreeMap<String, Vec<String>>,
}

impl ExpectedOutputCatalog {
    /// Returns the catalog shipped with the crate.
    #[must_use]
    pub fn builtin() -> Self {
        BUILTIN.clone()
    }

    /// Loads a catalog from a JSON object of `stage -> [template, ...]`.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, HcpflowError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Sets the templates of one stage.
    #[must_use]
    pub fn with_stage(mut self, stage: impl Into<String>, templates: Vec<String>) -> Self {
        self.stages.insert(stage.into(), templates);
        self
    }

    /// Returns the templates of one stage.
    #[must_use]
    pub fn templates(&self, stage: &str) -> &[String] {
        self.stages.get(stage).map_or(&[], Vec::as_slice)
    }

    /// Returns the stage names present.
    pub fn stage_names(&self) -> impl Iterator<Item = &str> {
        self.stages.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_covers_every_stage() {
        let catalog = ExpectedOutputCatalog::builtin();
        for stage in [
            "PreFreeSurfer",
            "FreeSurfer",
            "PostFreeSurfer",
            "FMRIVolume",
            "FMRISurface",
            "DCANBOLDProcessing",
            "ExecutiveSummary",
            "CustomClean",
        ] {
            assert!(catalog.stage_names().any(|s| s == stage), "{stage} missing");
        }
        assert!(catalog.templates("CustomClean").is_empty());
        assert!(catalog.templates("FMRIVolume")[0].contains("{fmriname}"));
    }

    #[test]
    fn test_unknown_stage_has_no_templates() {
        assert!(ExpectedOutputCatalog::default().templates("Nope").is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("outputs.json");
        std::fs::write(&path, r#"{"FreeSurfer": ["{path}/done.txt"]}"#).unwrap();

        let catalog = ExpectedOutputCatalog::from_json_file(&path).unwrap();
        assert_eq!(catalog.templates("FreeSurfer"), ["{path}/done.txt".to_string()]);
        assert!(catalog.templates("PreFreeSurfer").is_empty());
    }
}
