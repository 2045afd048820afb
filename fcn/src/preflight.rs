//! Checks run before a training run allocates anything.

use crate::{
    config::TrainingConfig,
    error::{FcnError, FcnResult},
};

/// Validate `config` and make sure its input directories exist.
///
/// `accelerated` tells whether the selected backend runs on a GPU; training on
/// the CPU only logs a warning.
///
/// # Errors
///
/// - [`FcnError::InvalidConfiguration`] from [`TrainingConfig::validate`].
/// - [`FcnError::MissingResource`] for a missing training directory, or a
///   missing backbone directory when a pretrained backbone is requested.
pub fn preflight(config: &TrainingConfig, accelerated: bool) -> FcnResult<()> {
    config.validate()?;

    let training_dir = config.training_dir();
    if !training_dir.is_dir() {
        return Err(FcnError::MissingResource {
            what: "training directory",
            path: training_dir,
        });
    }

    if config.pretrained_backbone {
        let backbone_dir = config.backbone_dir();
        if !backbone_dir.is_dir() {
            return Err(FcnError::MissingResource {
                what: "backbone directory",
                path: backbone_dir,
            });
        }
    }

    if !accelerated {
        tracing::warn!("No GPU found. Please use a GPU to train your neural network.");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::tests::scratch_dir;

    fn config_for(name: &str) -> TrainingConfig {
        let data_dir = scratch_dir(name);
        TrainingConfig::new().with_data_dir(data_dir.to_string_lossy().into_owned())
    }

    #[test]
    fn complete_layout_passes() {
        let config = config_for("preflight-ok");
        fs::create_dir_all(config.training_dir()).unwrap();
        fs::create_dir_all(config.backbone_dir()).unwrap();

        assert!(preflight(&config, false).is_ok());
    }

    #[test]
    fn missing_training_dir_is_reported() {
        let config = config_for("preflight-no-training");
        fs::create_dir_all(config.backbone_dir()).unwrap();

        match preflight(&config, true) {
            Err(FcnError::MissingResource { what, path }) => {
                assert_eq!(what, "training directory");
                assert_eq!(path, config.training_dir());
            }
            other => panic!("expected MissingResource, got {other:?}"),
        }
    }

    #[test]
    fn backbone_dir_is_only_required_when_pretrained() {
        let config = config_for("preflight-no-backbone");
        fs::create_dir_all(config.training_dir()).unwrap();

        assert!(matches!(
            preflight(&config, true),
            Err(FcnError::MissingResource { what: "backbone directory", .. })
        ));
        assert!(preflight(&config.with_pretrained_backbone(false), true).is_ok());
    }

    #[test]
    fn invalid_config_fails_before_touching_the_filesystem() {
        let config = TrainingConfig::new()
            .with_batch_size(0)
            .with_data_dir("/nonexistent".to_string());

        assert!(matches!(
            preflight(&config, true),
            Err(FcnError::InvalidConfiguration { .. })
        ));
    }
}
