//! Structural stages: PreFreeSurfer, FreeSurfer, PostFreeSurfer.

use super::{Stage, StageCommands};
use crate::config::{CommandTemplate, SessionConfiguration, TemplateParams};
use crate::errors::TemplateError;
use crate::resolver::PairTarget;
use std::sync::LazyLock;

static PRE_FREESURFER: LazyLock<CommandTemplate> = LazyLock::new(|| {
    CommandTemplate::new("{HCPPIPEDIR}/PreFreeSurfer/PreFreeSurferPipeline.sh")
        .flag("--path", "{path}")
        .flag("--subject", "{subject}")
        .flag("--t1", "{t1}")
        .flag("--t2", "{t2}")
        .flag("--t1template", "{t1template}")
        .flag("--t1templatebrain", "{t1templatebrain}")
        .flag("--t1template2mm", "{t1template2mm}")
        .flag("--t2template", "{t2template}")
        .flag("--t2templatebrain", "{t2templatebrain}")
        .flag("--t2template2mm", "{t2template2mm}")
        .flag("--templatemask", "{templatemask}")
        .flag("--template2mmmask", "{template2mmmask}")
        .flag("--brainsize", "{brainsize}")
        .flag("--fnirtconfig", "{fnirtconfig}")
        .flag("--fmapmag", "{fmapmag}")
        .flag("--fmapphase", "{fmapphase}")
        .flag("--fmapgeneralelectric", "{fmapgeneralelectric}")
        .flag("--echodiff", "{echodiff}")
        .flag("--SEPhaseNeg", "{sephaseneg}")
        .flag("--SEPhasePos", "{sephasepos}")
        .flag("--echospacing", "{echospacing}")
        .flag("--seunwarpdir", "{seunwarpdir}")
        .flag("--t1samplespacing", "{t1samplespacing}")
        .flag("--t2samplespacing", "{t2samplespacing}")
        .flag("--unwarpdir", "{unwarpdir}")
        .flag("--gdcoeffs", "{gdcoeffs}")
        .flag("--avgrdcmethod", "{dcmethod}")
        .flag("--topupconfig", "{topupconfig}")
        .flag("--useT2", "{useT2}")
        .flag("--printcom", "{printcom}")
        .flag("--useStudyTemplate", "{usestudytemplate}")
        .flag("--StudyTemplate", "{studytemplate}")
        .flag("--StudyTemplateBrain", "{studytemplatebrain}")
});

static FREESURFER: LazyLock<CommandTemplate> = LazyLock::new(|| {
    CommandTemplate::new("{HCPPIPEDIR}/FreeSurfer/FreeSurferPipeline.sh")
        .flag("--subject", "{subject}")
        .flag("--subjectDIR", "{freesurferdir}")
        .flag("--t1", "{t1_restore}")
        .flag("--t1brain", "{t1_restore_brain}")
        .flag("--t2", "{t2_restore}")
        .flag("--useT2", "{useT2}")
        .flag("--printcom", "{printcom}")
});

static POST_FREESURFER: LazyLock<CommandTemplate> = LazyLock::new(|| {
    CommandTemplate::new("{HCPPIPEDIR}/PostFreeSurfer/PostFreeSurferPipeline.sh")
        .flag("--path", "{path}")
        .flag("--subject", "{subject}")
        .flag("--surfatlasdir", "{surfatlasdir}")
        .flag("--grayordinatesdir", "{grayordinatesdir}")
        .flag("--grayordinatesres", "{grayordinatesres}")
        .flag("--hiresmesh", "{hiresmesh}")
        .flag("--lowresmesh", "{lowresmesh}")
        .flag("--subcortgraylabels", "{subcortgraylabels}")
        .flag("--freesurferlabels", "{freesurferlabels}")
        .flag("--refmyelinmaps", "{refmyelinmaps}")
        .flag("--regname", "{regname}")
        .flag("--reference2mm", "{t1template2mm}")
        .flag("--reference2mmmask", "{template2mmmask}")
        .flag("--config", "{fnirtconfig}")
        .flag("--useT2", "{useT2}")
        .flag("--t1template", "{t1template}")
        .flag("--t1templatebrain", "{t1templatebrain}")
        .flag("--t1template2mm", "{t1template2mm}")
        .flag("--t2template", "{t2template}")
        .flag("--t2templatebrain", "{t2templatebrain}")
        .flag("--t2template2mm", "{t2template2mm}")
        .flag("--templatemask", "{templatemask}")
        .flag("--template2mmmask", "{template2mmmask}")
        .flag("--useStudyTemplate", "{usestudytemplate}")
        .flag("--StudyTemplate", "{studytemplate}")
        .flag("--StudyTemplateBrain", "{studytemplatebrain}")
        .flag("--printcom", "{printcom}")
});

/// Brain extraction, bias correction and registration to the template.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreFreeSurfer;

impl Stage for PreFreeSurfer {
    fn name(&self) -> &'static str {
        "PreFreeSurfer"
    }

    fn params(&self, config: &SessionConfiguration) -> Result<TemplateParams, TemplateError> {
        let pair = config
            .resolved()
            .field_maps
            .select_pair(&PairTarget::Anatomical);
        let (pos, neg) = match pair {
            Some(pair) => (
                Some(pair.positive.display().to_string()),
                Some(pair.negative.display().to_string()),
            ),
            None => (None, None),
        };
        Ok(config
            .params()?
            .with_opt("sephasepos", pos)
            .with_opt("sephaseneg", neg))
    }

    fn commands(
        &self,
        config: &SessionConfiguration,
        params: &TemplateParams,
    ) -> Result<StageCommands, TemplateError> {
        Ok(StageCommands::Single(
            PRE_FREESURFER.render(config.environment(), params)?,
        ))
    }

    fn conditional_outputs(&self, config: &SessionConfiguration, _params: &TemplateParams) -> Vec<String> {
        if config.resolved().use_t2() {
            vec!["{path}/T1w/T2w_acpc_dc_restore.nii.gz".to_string()]
        } else {
            Vec::new()
        }
    }
}

/// Cortical surface reconstruction.
#[derive(Debug, Clone, Copy, Default)]
pub struct FreeSurfer;

impl Stage for FreeSurfer {
    fn name(&self) -> &'static str {
        "FreeSurfer"
    }

    fn params(&self, config: &SessionConfiguration) -> Result<TemplateParams, TemplateError> {
        let t1w_dir = config.layout().files().join("T1w");
        let in_t1w = |file: &str| t1w_dir.join(file).display().to_string();
        let t2_restore = config
            .resolved()
            .use_t2()
            .then(|| in_t1w("T2w_acpc_dc_restore.nii.gz"));

        Ok(config
            .params()?
            .with("freesurferdir", t1w_dir.display().to_string())
            .with("t1_restore", in_t1w("T1w_acpc_dc_restore.nii.gz"))
            .with("t1_restore_brain", in_t1w("T1w_acpc_dc_restore_brain.nii.gz"))
            .with_opt("t2_restore", t2_restore))
    }

    fn commands(
        &self,
        config: &SessionConfiguration,
        params: &TemplateParams,
    ) -> Result<StageCommands, TemplateError> {
        Ok(StageCommands::Single(
            FREESURFER.render(config.environment(), params)?,
        ))
    }
}

/// Surface registration and CIFTI generation.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostFreeSurfer;

impl Stage for PostFreeSurfer {
    fn name(&self) -> &'static str {
        "PostFreeSurfer"
    }

    fn commands(
        &self,
        config: &SessionConfiguration,
        params: &TemplateParams,
    ) -> Result<StageCommands, TemplateError> {
        Ok(StageCommands::Single(
            POST_FREESURFER.render(config.environment(), params)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{configuration, SessionFixture};
    use pretty_assertions::assert_eq;

    fn single(commands: StageCommands) -> crate::config::CommandLine {
        match commands {
            StageCommands::Single(cmd) => cmd,
            StageCommands::FanOut(_) => panic!("expected a single command"),
        }
    }

    fn render(stage: &dyn Stage, config: &SessionConfiguration) -> crate::config::CommandLine {
        let params = stage.params(config).unwrap();
        single(stage.commands(config, &params).unwrap())
    }

    #[test]
    fn test_pre_freesurfer_t1_only() {
        let config = configuration(SessionFixture::new("01"));
        let cmd = render(&PreFreeSurfer, &config);

        assert_eq!(
            cmd.program,
            "/opt/hcp/PreFreeSurfer/PreFreeSurferPipeline.sh"
        );
        assert!(cmd.args.contains(&"--t2=NONE".to_string()));
        assert!(cmd.args.contains(&"--avgrdcmethod=NONE".to_string()));
        assert!(cmd.args.contains(&"--SEPhasePos=NONE".to_string()));
        assert!(cmd.args.contains(&"--useT2=false".to_string()));
        assert!(cmd.args.contains(&"--unwarpdir=y".to_string()));
        assert!(cmd.args.contains(&"--printcom=".to_string()));
        assert_eq!(cmd.args.len(), 33);
    }

    #[test]
    fn test_pre_freesurfer_topup_pair() {
        let config = configuration(
            SessionFixture::new("01")
                .with_bold("rest", 1)
                .with_spin_echo_pair(None),
        );
        let cmd = render(&PreFreeSurfer, &config);

        assert!(cmd.args.contains(&"--avgrdcmethod=TOPUP".to_string()));
        assert!(cmd.args.iter().any(|a| a.starts_with("--SEPhasePos=") && a.ends_with("dir-PA_epi.nii.gz")));
        assert!(cmd.args.iter().any(|a| a.starts_with("--SEPhaseNeg=") && a.ends_with("dir-AP_epi.nii.gz")));
        assert!(cmd.args.contains(&"--echospacing=0.00058".to_string()));
    }

    #[test]
    fn test_pre_freesurfer_expects_t2_output_with_t2() {
        let config = configuration(SessionFixture::new("01").with_t2());
        let params = PreFreeSurfer.params(&config).unwrap();

        assert_eq!(
            PreFreeSurfer.conditional_outputs(&config, &params),
            vec!["{path}/T1w/T2w_acpc_dc_restore.nii.gz".to_string()]
        );
        let cmd = render(&PreFreeSurfer, &config);
        assert!(cmd.args.contains(&"--useT2=true".to_string()));
    }

    #[test]
    fn test_freesurfer_local_paths() {
        let config = configuration(SessionFixture::new("01"));
        let cmd = render(&FreeSurfer, &config);

        assert_eq!(
            cmd.args,
            vec![
                "--subject=01",
                "--subjectDIR=/out/sub-01/files/T1w",
                "--t1=/out/sub-01/files/T1w/T1w_acpc_dc_restore.nii.gz",
                "--t1brain=/out/sub-01/files/T1w/T1w_acpc_dc_restore_brain.nii.gz",
                "--t2=NONE",
                "--useT2=false",
                "--printcom=",
            ]
        );
    }

    #[test]
    fn test_post_freesurfer_references() {
        let config = configuration(SessionFixture::new("01"));
        let cmd = render(&PostFreeSurfer, &config);

        assert!(cmd
            .args
            .contains(&"--reference2mm=/opt/hcp/global/templates/MNI152_T1_2mm.nii.gz".to_string()));
        assert!(cmd.args.contains(&"--regname=MSMSulc".to_string()));
        assert!(cmd.args.contains(&"--useStudyTemplate=false".to_string()));
        assert!(cmd.args.contains(&"--StudyTemplate=NONE".to_string()));
    }
}
