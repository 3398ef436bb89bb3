//! Session configuration.
//!
//! A [`SessionConfiguration`] joins the resolved dataset facts of one
//! session with the fixed [`PipelineConstants`], the [`ToolEnvironment`] and
//! the output layout. It is built once per session, adjusted through a few
//! named setters, then shared read-only by every stage.

mod template;

pub use template::{
    render_with, CommandLine, CommandTemplate, TemplateParams, ToolEnvironment, NONE_TOKEN,
};

use crate::errors::{HcpflowError, TemplateError};
use crate::resolver::{DistortionCorrectionMethod, FunctionalRun, ResolvedSession};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Fixed processing parameters: templates, resolutions, filter settings.
///
/// String values may reference [`ToolEnvironment`] variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConstants {
    /// Folder name of the BOLD processing summary.
    pub summary_dir: String,
    /// 1mm T1 template.
    pub t1template: String,
    /// Brain-extracted 1mm T1 template.
    pub t1templatebrain: String,
    /// 2mm T1 template.
    pub t1template2mm: String,
    /// 1mm T2 template.
    pub t2template: String,
    /// Brain-extracted 1mm T2 template.
    pub t2templatebrain: String,
    /// 2mm T2 template.
    pub t2template2mm: String,
    /// 1mm brain mask.
    pub templatemask: String,
    /// Dilated 2mm brain mask.
    pub template2mmmask: String,
    /// Reference myelin maps.
    pub refmyelinmaps: String,
    /// Surface atlas directory.
    pub surfatlasdir: String,
    /// Grayordinate template directory.
    pub grayordinatesdir: String,
    /// Field of view for robust cropping, in mm.
    pub brainsize: u32,
    /// Final time series resolution, in mm.
    pub fmrires: f64,
    /// Grayordinate resolution, in mm.
    pub grayordinatesres: u32,
    /// Greyordinate smoothing, in mm.
    pub smoothing_fwhm: u32,
    /// Surface registration algorithm.
    pub regname: String,
    /// High resolution mesh, in thousands of vertices.
    pub hiresmesh: String,
    /// Low resolution mesh, in thousands of vertices.
    pub lowresmesh: String,
    /// Motion correction method.
    pub mctype: String,
    /// TOPUP configuration file.
    pub topupconfig: String,
    /// FNIRT configuration file.
    pub fnirtconfig: String,
    /// FreeSurfer label table.
    pub freesurferlabels: String,
    /// Subcortical label table.
    pub subcortgraylabels: String,
    /// Brain radius, in mm.
    pub brain_radius: u32,
    /// Framewise displacement threshold.
    pub fd_threshold: f64,
    /// Bandpass filter order.
    pub filter_order: u32,
    /// Bandpass lower bound, in Hz.
    pub lower_bpf: f64,
    /// Bandpass upper bound, in Hz.
    pub upper_bpf: f64,
    /// Motion regressor filter type.
    pub motion_filter_type: String,
    /// Motion regressor filter order.
    pub motion_filter_order: u32,
    /// Band-stop lower bound, in breaths per minute.
    pub band_stop_min: Option<f64>,
    /// Band-stop upper bound, in breaths per minute.
    pub band_stop_max: Option<f64>,
    /// Motion regressor filter option.
    pub motion_filter_option: u32,
    /// Seconds dropped from the start of each run.
    pub skip_seconds: u32,
    /// Minimum contiguous frames.
    pub contiguous_frames: u32,
}

impl Default for PipelineConstants {
    fn default() -> Self {
        Self {
            summary_dir: "summary_{DCANBOLDPROCVER}".to_string(),
            t1template: "{HCPPIPEDIR_Templates}/MNI152_T1_1mm.nii.gz".to_string(),
            t1templatebrain: "{HCPPIPEDIR_Templates}/MNI152_T1_1mm_brain.nii.gz".to_string(),
            t1template2mm: "{HCPPIPEDIR_Templates}/MNI152_T1_2mm.nii.gz".to_string(),
            t2template: "{HCPPIPEDIR_Templates}/MNI152_T2_1mm.nii.gz".to_string(),
            t2templatebrain: "{HCPPIPEDIR_Templates}/MNI152_T2_1mm_brain.nii.gz".to_string(),
            t2template2mm: "{HCPPIPEDIR_Templates}/MNI152_T2_2mm.nii.gz".to_string(),
            templatemask: "{HCPPIPEDIR_Templates}/MNI152_T1_1mm_brain_mask.nii.gz".to_string(),
            template2mmmask: "{HCPPIPEDIR_Templates}/MNI152_T1_2mm_brain_mask_dil.nii.gz"
                .to_string(),
            refmyelinmaps: "{HCPPIPEDIR_Templates}/standard_mesh_atlases/\
                            Conte69.MyelinMap_BC.164k_fs_LR.dscalar.nii"
                .to_string(),
            surfatlasdir: "{HCPPIPEDIR_Templates}/standard_mesh_atlases".to_string(),
            grayordinatesdir: "{HCPPIPEDIR_Templates}/91282_Greyordinates".to_string(),
            brainsize: 150,
            fmrires: 2.0,
            grayordinatesres: 2,
            smoothing_fwhm: 2,
            regname: "MSMSulc".to_string(),
            hiresmesh: "164".to_string(),
            lowresmesh: "32".to_string(),
            mctype: "MCFLIRT".to_string(),
            topupconfig: "{HCPPIPEDIR_Config}/b02b0.cnf".to_string(),
            fnirtconfig: "{HCPPIPEDIR_Config}/T1_2_MNI152_2mm.cnf".to_string(),
            freesurferlabels: "{HCPPIPEDIR_Config}/FreeSurferAllLut.txt".to_string(),
            subcortgraylabels: "{HCPPIPEDIR_Config}/FreeSurferSubcorticalLabelTableLut.txt"
                .to_string(),
            brain_radius: 50,
            fd_threshold: 0.3,
            filter_order: 2,
            lower_bpf: 0.009,
            upper_bpf: 0.080,
            motion_filter_type: "notch".to_string(),
            motion_filter_order: 4,
            band_stop_min: None,
            band_stop_max: None,
            motion_filter_option: 5,
            skip_seconds: 5,
            contiguous_frames: 5,
        }
    }
}

impl PipelineConstants {
    /// Loads constants from a JSON document; absent keys keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, HcpflowError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    fn insert_into(&self, env: &ToolEnvironment, params: &mut TemplateParams) -> Result<(), TemplateError> {
        for (key, value) in [
            ("t1template", &self.t1template),
            ("t1templatebrain", &self.t1templatebrain),
            ("t1template2mm", &self.t1template2mm),
            ("t2template", &self.t2template),
            ("t2templatebrain", &self.t2templatebrain),
            ("t2template2mm", &self.t2template2mm),
            ("templatemask", &self.templatemask),
            ("template2mmmask", &self.template2mmmask),
            ("refmyelinmaps", &self.refmyelinmaps),
            ("surfatlasdir", &self.surfatlasdir),
            ("grayordinatesdir", &self.grayordinatesdir),
            ("regname", &self.regname),
            ("hiresmesh", &self.hiresmesh),
            ("lowresmesh", &self.lowresmesh),
            ("mctype", &self.mctype),
            ("topupconfig", &self.topupconfig),
            ("fnirtconfig", &self.fnirtconfig),
            ("freesurferlabels", &self.freesurferlabels),
            ("subcortgraylabels", &self.subcortgraylabels),
            ("motion_filter_type", &self.motion_filter_type),
        ] {
            params.set(key, env.expand(value)?);
        }

        params.set("brainsize", self.brainsize.to_string());
        params.set("fmrires", number(self.fmrires));
        params.set("grayordinatesres", self.grayordinatesres.to_string());
        params.set("smoothingFWHM", self.smoothing_fwhm.to_string());
        params.set("brain_radius", self.brain_radius.to_string());
        params.set("fd_threshold", number(self.fd_threshold));
        params.set("filter_order", self.filter_order.to_string());
        params.set("lower_bpf", number(self.lower_bpf));
        params.set("upper_bpf", number(self.upper_bpf));
        params.set("motion_filter_order", self.motion_filter_order.to_string());
        params.set_opt("band_stop_min", self.band_stop_min.map(number));
        params.set_opt("band_stop_max", self.band_stop_max.map(number));
        params.set("motion_filter_option", self.motion_filter_option.to_string());
        params.set("skip_seconds", self.skip_seconds.to_string());
        params.set("contiguous_frames", self.contiguous_frames.to_string());
        Ok(())
    }
}

/// Renders a float the way the processing scripts expect (`2.0`, `0.009`).
fn number(value: f64) -> String {
    format!("{value:?}")
}

/// Per-session output directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    /// Returns the layout of `<output_root>/sub-<subject>[/ses-<session>]`.
    #[must_use]
    pub fn for_session(output_root: impl AsRef<Path>, subject: &str, session: Option<&str>) -> Self {
        let mut root = output_root.as_ref().join(format!("sub-{subject}"));
        if let Some(session) = session {
            root.push(format!("ses-{session}"));
        }
        Self { root }
    }

    /// Session output directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Processing outputs.
    #[must_use]
    pub fn files(&self) -> PathBuf {
        self.root.join("files")
    }

    /// Log root.
    #[must_use]
    pub fn logs(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Log and status directory of one stage.
    #[must_use]
    pub fn stage_logs(&self, stage: &str) -> PathBuf {
        self.logs().join(stage)
    }
}

/// Resolved facts, constants and layout for one session.
#[derive(Debug, Clone)]
pub struct SessionConfiguration {
    resolved: ResolvedSession,
    constants: PipelineConstants,
    environment: ToolEnvironment,
    layout: OutputLayout,
    study_template: Option<(String, String)>,
    anatomical_only: bool,
}

impl SessionConfiguration {
    /// Creates the configuration of a resolved session.
    #[must_use]
    pub fn new(
        resolved: ResolvedSession,
        constants: PipelineConstants,
        environment: ToolEnvironment,
        output_root: impl AsRef<Path>,
    ) -> Self {
        let layout =
            OutputLayout::for_session(output_root, &resolved.subject, resolved.session.as_deref());
        Self {
            resolved,
            constants,
            environment,
            layout,
            study_template: None,
            anatomical_only: false,
        }
    }

    /// Uses an intermediate registration template.
    #[must_use]
    pub fn with_study_template(mut self, head: impl Into<String>, brain: impl Into<String>) -> Self {
        self.study_template = Some((head.into(), brain.into()));
        self
    }

    /// Enables the motion regressor band-stop (notch) filter.
    #[must_use]
    pub fn with_bandstop(mut self, lower: f64, upper: f64) -> Self {
        self.constants.motion_filter_type = "notch".to_string();
        self.constants.band_stop_min = Some(lower);
        self.constants.band_stop_max = Some(upper);
        self
    }

    /// Processes anatomical data only.
    #[must_use]
    pub fn anatomical_only(mut self) -> Self {
        self.anatomical_only = true;
        self
    }

    /// Returns the resolved dataset facts.
    #[must_use]
    pub fn resolved(&self) -> &ResolvedSession {
        &self.resolved
    }

    /// Returns the constants.
    #[must_use]
    pub fn constants(&self) -> &PipelineConstants {
        &self.constants
    }

    /// Returns the tool environment.
    #[must_use]
    pub fn environment(&self) -> &ToolEnvironment {
        &self.environment
    }

    /// Returns the output layout.
    #[must_use]
    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    /// Returns the subject label.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.resolved.subject
    }

    /// Returns the session label.
    #[must_use]
    pub fn session(&self) -> Option<&str> {
        self.resolved.session.as_deref()
    }

    /// Returns a display label such as `sub-01/ses-A`.
    #[must_use]
    pub fn label(&self) -> String {
        match self.session() {
            Some(ses) => format!("sub-{}/ses-{ses}", self.subject()),
            None => format!("sub-{}", self.subject()),
        }
    }

    /// Returns the distortion-correction method.
    #[must_use]
    pub fn method(&self) -> DistortionCorrectionMethod {
        self.resolved.method()
    }

    /// Returns true if functional stages apply.
    #[must_use]
    pub fn processes_functional(&self) -> bool {
        !self.anatomical_only && self.resolved.has_functional()
    }

    /// Returns the functional runs to process.
    #[must_use]
    pub fn functional_runs(&self) -> &[FunctionalRun] {
        if self.anatomical_only {
            &[]
        } else {
            &self.resolved.functional
        }
    }

    /// Returns the flat parameter view all templates render against.
    pub fn params(&self) -> Result<TemplateParams, TemplateError> {
        let r = &self.resolved;
        let mut params = TemplateParams::new();

        params.set("path", self.layout.files().display().to_string());
        params.set("logs", self.layout.logs().display().to_string());
        params.set("subject", r.subject.clone());
        params.set_opt("session", r.session.clone());

        params.set("t1", join_paths(&r.t1w));
        params.set_opt("t2", (!r.t2w.is_empty()).then(|| join_paths(&r.t2w)));
        params.set("useT2", r.use_t2().to_string());
        params.set("t1samplespacing", r.t1_sample_spacing.clone());
        params.set_opt("t2samplespacing", r.t2_sample_spacing.clone());
        params.set("unwarpdir", r.unwarp_dir.clone());

        params.set("dcmethod", self.method().as_str());
        params.set_opt("echospacing", r.echo_spacing.clone());
        params.set_opt("seunwarpdir", r.se_unwarp_dir.clone());
        params.set_opt("fmapmag", r.fmap_mag.clone());
        params.set_opt("fmapphase", r.fmap_phase.clone());
        params.set_opt("echodiff", r.echo_diff.clone());
        params.set_opt("fmapgeneralelectric", None::<String>);
        params.set_opt("gdcoeffs", None::<String>);
        params.set_opt("fmribfcmethod", None::<String>);
        params.set_opt("physio", None::<String>);
        params.set("printcom", "");

        match &self.study_template {
            Some((head, brain)) => {
                params.set("usestudytemplate", "true");
                params.set("studytemplate", head.clone());
                params.set("studytemplatebrain", brain.clone());
            }
            None => {
                params.set("usestudytemplate", "false");
                params.set_opt("studytemplate", None::<String>);
                params.set_opt("studytemplatebrain", None::<String>);
            }
        }

        let unproc = r
            .session_root
            .as_ref()
            .filter(|_| !self.anatomical_only)
            .map(|root| root.join("func").display().to_string());
        params.set_opt("unproc", unproc);
        let summary_dir = if self.anatomical_only {
            None
        } else {
            Some(self.environment.expand(&self.constants.summary_dir)?)
        };
        params.set_opt("summary_dir", summary_dir);

        self.constants.insert_into(&self.environment, &mut params)?;
        Ok(params)
    }
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join("@")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::resolve;
    use crate::testing::{tool_environment, SessionFixture};
    use pretty_assertions::assert_eq;

    fn configuration(fixture: SessionFixture) -> SessionConfiguration {
        let resolved = resolve(&fixture.build()).unwrap();
        SessionConfiguration::new(
            resolved,
            PipelineConstants::default(),
            tool_environment(),
            "/out",
        )
    }

    #[test]
    fn test_layout_with_and_without_session() {
        let with = OutputLayout::for_session("/out", "01", Some("A"));
        assert_eq!(with.files(), PathBuf::from("/out/sub-01/ses-A/files"));
        assert_eq!(
            with.stage_logs("FreeSurfer"),
            PathBuf::from("/out/sub-01/ses-A/logs/FreeSurfer")
        );

        let without = OutputLayout::for_session("/out", "01", None);
        assert_eq!(without.logs(), PathBuf::from("/out/sub-01/logs"));
    }

    #[test]
    fn test_params_for_t1_only_session() {
        let params = configuration(SessionFixture::new("01")).params().unwrap();

        assert_eq!(params.get("dcmethod"), Some(Some("NONE")));
        assert_eq!(params.get("useT2"), Some(Some("false")));
        assert_eq!(params.get("path"), Some(Some("/out/sub-01/files")));
        assert_eq!(params.render("{fmapmag}").unwrap(), "NONE");
        assert_eq!(params.render("{fmrires}").unwrap(), "2.0");
        assert_eq!(
            params.render("{t1template}").unwrap(),
            "/opt/hcp/global/templates/MNI152_T1_1mm.nii.gz"
        );
    }

    #[test]
    fn test_study_template_setter() {
        let params = configuration(SessionFixture::new("01"))
            .with_study_template("/t/head.nii.gz", "/t/brain.nii.gz")
            .params()
            .unwrap();

        assert_eq!(params.get("usestudytemplate"), Some(Some("true")));
        assert_eq!(params.get("studytemplatebrain"), Some(Some("/t/brain.nii.gz")));
    }

    #[test]
    fn test_bandstop_setter() {
        let params = configuration(SessionFixture::new("01"))
            .with_bandstop(18.582, 25.726)
            .params()
            .unwrap();

        assert_eq!(params.get("motion_filter_type"), Some(Some("notch")));
        assert_eq!(params.get("band_stop_min"), Some(Some("18.582")));
        assert_eq!(params.get("band_stop_max"), Some(Some("25.726")));
    }

    #[test]
    fn test_anatomical_only_clears_functional_inputs() {
        let config = configuration(SessionFixture::new("01").with_bold("rest", 1));
        assert!(config.processes_functional());
        assert!(config.params().unwrap().get("unproc").unwrap().is_some());

        let config = config.anatomical_only();
        assert!(!config.processes_functional());
        assert!(config.functional_runs().is_empty());
        let params = config.params().unwrap();
        assert_eq!(params.get("unproc"), Some(None));
        assert_eq!(params.get("summary_dir"), Some(None));
    }

    #[test]
    fn test_constants_from_partial_json() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("constants.json");
        std::fs::write(&path, r#"{"fmrires": 2.4, "regname": "FS"}"#).unwrap();

        let constants = PipelineConstants::from_json_file(&path).unwrap();
        assert_eq!(constants.fmrires, 2.4);
        assert_eq!(constants.regname, "FS");
        assert_eq!(constants.hiresmesh, "164");
    }
}
