//! Dataset and configuration fixtures.

use crate::config::{PipelineConstants, SessionConfiguration, ToolEnvironment};
use crate::dataset::{FileEntry, RawSession, ScanType, INTENDED_FOR};
use crate::resolver::resolve;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

const DATA_ROOT: &str = "/data";

/// Returns a tool environment rooted under `/opt`.
#[must_use]
pub fn tool_environment() -> ToolEnvironment {
    ToolEnvironment::new()
        .with_var("HCPPIPEDIR", "/opt/hcp")
        .with_var("HCPPIPEDIR_Templates", "/opt/hcp/global/templates")
        .with_var("HCPPIPEDIR_Config", "/opt/hcp/global/config")
        .with_var("DCANBOLDPROCDIR", "/opt/dcan-bold-processing")
        .with_var("DCANBOLDPROCVER", "v4.0.0")
        .with_var("EXECSUMDIR", "/opt/execsum")
        .with_var("CUSTOMCLEANDIR", "/opt/clean")
}

/// Resolves a fixture into a configuration writing under `/out`.
///
/// # Panics
///
/// Panics if the fixture does not resolve.
#[must_use]
pub fn configuration(fixture: SessionFixture) -> SessionConfiguration {
    configuration_in(fixture, "/out")
}

/// Resolves a fixture into a configuration writing under `output_root`.
///
/// # Panics
///
/// Panics if the fixture does not resolve.
#[must_use]
pub fn configuration_in(fixture: SessionFixture, output_root: impl AsRef<Path>) -> SessionConfiguration {
    let raw = fixture.build();
    let resolved = resolve(&raw).unwrap_or_else(|e| panic!("fixture {} does not resolve: {e}", raw.label()));
    SessionConfiguration::new(
        resolved,
        PipelineConstants::default(),
        tool_environment(),
        output_root,
    )
}

/// Builds a [`RawSession`] with realistic sidecar metadata.
///
/// Files live under `/data/sub-<id>/[ses-<id>/]`. Anatomical images read
/// out along `y`, BOLD runs are encoded `j-`, and spin-echo field maps are
/// a `PA` (`j`) / `AP` (`j-`) pair linked to every BOLD run, or to the T1w
/// image when there are none.
#[derive(Debug, Clone)]
pub struct SessionFixture {
    subject: String,
    session: Option<String>,
    t1: bool,
    t2: bool,
    bolds: Vec<(String, u32)>,
    spin_echo: Option<Option<String>>,
    quartet: Option<(f64, f64)>,
    dwi: bool,
}

impl SessionFixture {
    /// Creates a T1-only session.
    #[must_use]
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            session: None,
            t1: true,
            t2: false,
            bolds: Vec::new(),
            spin_echo: None,
            quartet: None,
            dwi: false,
        }
    }

    /// Places the files under a session directory.
    #[must_use]
    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    /// Drops the T1w image.
    #[must_use]
    pub fn without_t1(mut self) -> Self {
        self.t1 = false;
        self
    }

    /// Adds a T2w image.
    #[must_use]
    pub fn with_t2(mut self) -> Self {
        self.t2 = true;
        self
    }

    /// Adds a BOLD run.
    #[must_use]
    pub fn with_bold(mut self, task: impl Into<String>, run: u32) -> Self {
        self.bolds.push((task.into(), run));
        self
    }

    /// Adds a spin-echo pair linked to `target`, or to the default scans when `None`.
    #[must_use]
    pub fn with_spin_echo_pair(mut self, target: Option<&str>) -> Self {
        self.spin_echo = Some(target.map(str::to_string));
        self
    }

    /// Adds a phase/magnitude quartet at two echo times, in seconds.
    #[must_use]
    pub fn with_quartet(mut self, short_echo: f64, long_echo: f64) -> Self {
        self.quartet = Some((short_echo, long_echo));
        self
    }

    /// Adds a diffusion run.
    #[must_use]
    pub fn with_dwi(mut self) -> Self {
        self.dwi = true;
        self
    }

    fn prefix(&self) -> String {
        match &self.session {
            Some(ses) => format!("sub-{}_ses-{ses}", self.subject),
            None => format!("sub-{}", self.subject),
        }
    }

    fn session_dir(&self) -> PathBuf {
        let mut dir = Path::new(DATA_ROOT).join(format!("sub-{}", self.subject));
        if let Some(ses) = &self.session {
            dir.push(format!("ses-{ses}"));
        }
        dir
    }

    /// Path relative to the subject directory, as `IntendedFor` writes it.
    fn relpath(&self, datatype: &str, file: &str) -> String {
        match &self.session {
            Some(ses) => format!("ses-{ses}/{datatype}/{file}"),
            None => format!("{datatype}/{file}"),
        }
    }

    fn file(&self, datatype: &str, suffix: &str, scan_type: ScanType) -> FileEntry {
        let name = format!("{}_{suffix}.nii.gz", self.prefix());
        FileEntry::new(self.session_dir().join(datatype).join(name), scan_type)
    }

    fn bold_name(&self, task: &str, run: u32) -> String {
        format!("{}_task-{task}_run-{run:02}_bold.nii.gz", self.prefix())
    }

    fn default_targets(&self) -> Value {
        if self.bolds.is_empty() {
            json!([self.relpath("anat", &format!("{}_T1w.nii.gz", self.prefix()))])
        } else {
            Value::Array(
                self.bolds
                    .iter()
                    .map(|(task, run)| json!(self.relpath("func", &self.bold_name(task, *run))))
                    .collect(),
            )
        }
    }

    fn anatomical(&self, suffix: &str, scan_type: ScanType) -> FileEntry {
        self.file("anat", suffix, scan_type)
            .with_field("ImageOrientationPatientDICOM", json!([0, 1, 0, 0, 0, -1]))
            .with_field("InPlanePhaseEncodingDirectionDICOM", json!("COL"))
            .with_field("DwellTime", json!(0.0000021))
    }

    /// Builds the session.
    #[must_use]
    pub fn build(&self) -> RawSession {
        let mut raw = RawSession::new(self.subject.clone(), self.session.clone());

        if self.t1 {
            raw.push(self.anatomical("T1w", ScanType::T1w));
        }
        if self.t2 {
            raw.push(self.anatomical("T2w", ScanType::T2w));
        }
        for (task, run) in &self.bolds {
            let path = self.session_dir().join("func").join(self.bold_name(task, *run));
            raw.push(
                FileEntry::new(path, ScanType::Bold)
                    .with_field("PhaseEncodingDirection", json!("j-"))
                    .with_field("RepetitionTime", json!(0.8)),
            );
        }

        if let Some(target) = &self.spin_echo {
            let targets = target.as_ref().map_or_else(|| self.default_targets(), |t| json!([t]));
            for (dir, ped) in [("PA", "j"), ("AP", "j-")] {
                raw.push(
                    self.file("fmap", &format!("dir-{dir}_epi"), ScanType::Epi)
                        .with_field("PhaseEncodingDirection", json!(ped))
                        .with_field("EffectiveEchoSpacing", json!(0.00058))
                        .with_field(INTENDED_FOR, targets.clone()),
                );
            }
        }

        if let Some((short, long)) = self.quartet {
            for (suffix, scan_type, echo) in [
                ("phase1", ScanType::Phase1, short),
                ("phase2", ScanType::Phase2, long),
                ("magnitude1", ScanType::Magnitude1, short),
                ("magnitude2", ScanType::Magnitude2, long),
            ] {
                raw.push(
                    self.file("fmap", suffix, scan_type)
                        .with_field("EchoTime", json!(echo))
                        .with_field(INTENDED_FOR, self.default_targets()),
                );
            }
        }

        if self.dwi {
            raw.push(
                self.file("dwi", "dwi", ScanType::Dwi)
                    .with_field("PhaseEncodingDirection", json!("j")),
            );
        }
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_layout() {
        let raw = SessionFixture::new("01").with_session("A").with_bold("rest", 1).build();

        let bold = &raw.files(&ScanType::Bold)[0];
        assert_eq!(
            bold.path,
            PathBuf::from("/data/sub-01/ses-A/func/sub-01_ses-A_task-rest_run-01_bold.nii.gz")
        );
        assert_eq!(raw.session_root(), Some(Path::new("/data/sub-01/ses-A")));
    }

    #[test]
    fn test_spin_echo_links_bold_runs() {
        let raw = SessionFixture::new("01")
            .with_bold("rest", 1)
            .with_spin_echo_pair(None)
            .build();

        let epi = &raw.files(&ScanType::Epi)[0];
        assert_eq!(epi.intended_for(), vec!["func/sub-01_task-rest_run-01_bold.nii.gz".to_string()]);
    }
}
