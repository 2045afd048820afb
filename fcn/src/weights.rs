//! Backbone weight loading and model persistence.
//!
//! Pretrained VGG16 weights are looked up in a directory by file name, in this
//! order:
//!
//! | file                | format                                        |
//! |---------------------|-----------------------------------------------|
//! | `vgg16.mpk`         | Burn named MessagePack record                 |
//! | `vgg16.safetensors` | SafeTensors, torchvision key naming           |
//! | `vgg16.pth`         | PyTorch state dict, torchvision key naming    |
//!
//! The last two need the `pretrained` feature. They must hold a
//! convolutionalized VGG16: `features.N` for the 3x3 convolutions and
//! `classifier.0` / `classifier.3` already reshaped to `fc6` / `fc7` kernels.

use std::path::{Path, PathBuf};

use burn::{
    module::Module,
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::backend::Backend,
};
use vgg::{VggFcn, VggFcnConfig};

use crate::{
    error::{FcnError, FcnResult},
    models::{Fcn, FcnConfig},
};

/// File stem of the pretrained backbone inside its directory.
pub const BACKBONE_FILE_STEM: &str = "vgg16";

/// Backbone weight file formats, in lookup order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightFormat {
    MessagePack,
    SafeTensors,
    PyTorch,
}

impl WeightFormat {
    pub const ALL: [Self; 3] = [Self::MessagePack, Self::SafeTensors, Self::PyTorch];

    pub const fn extension(self) -> &'static str {
        match self {
            Self::MessagePack => "mpk",
            Self::SafeTensors => "safetensors",
            Self::PyTorch => "pth",
        }
    }
}

fn recorder() -> NamedMpkFileRecorder<FullPrecisionSettings> {
    NamedMpkFileRecorder::<FullPrecisionSettings>::new()
}

/// `path` with `.mpk` appended unless it already ends in `.mpk`. The recorder
/// itself replaces the extension, which would map `fcn.v2` onto `fcn.mpk`.
fn record_path(path: &Path) -> PathBuf {
    if path.extension().is_some_and(|ext| ext == "mpk") {
        return path.to_path_buf();
    }
    let mut name = path.as_os_str().to_owned();
    name.push(".mpk");
    PathBuf::from(name)
}

/// Build a backbone from `config` and fill it with the weights found in `dir`.
///
/// # Errors
///
/// - [`FcnError::MissingResource`] if `dir` or a weight file in it is missing.
/// - [`FcnError::WeightLoadingFailed`] if the file does not fit the layout.
/// - [`FcnError::UnsupportedWeightFormat`] if only a format compiled out by
///   the `pretrained` feature is present.
pub fn load_backbone<B: Backend>(
    dir: impl AsRef<Path>,
    config: &VggFcnConfig,
    device: &B::Device,
) -> FcnResult<VggFcn<B>> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Err(FcnError::MissingResource {
            what: "backbone directory",
            path: dir.to_path_buf(),
        });
    }

    let Some((format, path)) = WeightFormat::ALL.into_iter().find_map(|format| {
        let path = dir.join(format!("{BACKBONE_FILE_STEM}.{}", format.extension()));
        path.is_file().then_some((format, path))
    }) else {
        return Err(FcnError::MissingResource {
            what: "backbone weights (vgg16.mpk, vgg16.safetensors or vgg16.pth)",
            path: dir.to_path_buf(),
        });
    };

    tracing::info!(path = %path.display(), ?format, "loading backbone weights");
    let backbone = config.init::<B>(device);

    match format {
        WeightFormat::MessagePack => backbone
            .load_file(path.clone(), &recorder(), device)
            .map_err(|e| FcnError::WeightLoadingFailed {
                path,
                reason: e.to_string(),
            }),
        WeightFormat::SafeTensors | WeightFormat::PyTorch => {
            load_torchvision(backbone, format, path, config, device)
        }
    }
}

#[cfg(feature = "pretrained")]
fn load_torchvision<B: Backend>(
    backbone: VggFcn<B>,
    format: WeightFormat,
    path: PathBuf,
    config: &VggFcnConfig,
    device: &B::Device,
) -> FcnResult<VggFcn<B>> {
    use burn::record::Recorder;
    use burn_import::{
        pytorch::{LoadArgs as PyTorchLoadArgs, PyTorchFileRecorder},
        safetensors::{LoadArgs as SafetensorsLoadArgs, SafetensorsFileRecorder},
    };
    use vgg::VggFcnRecord;

    let remaps = torchvision_key_remaps(config);
    let failed = |e: burn::record::RecorderError| FcnError::WeightLoadingFailed {
        path: path.clone(),
        reason: e.to_string(),
    };

    let record: VggFcnRecord<B> = if format == WeightFormat::PyTorch {
        let args = remaps
            .iter()
            .fold(PyTorchLoadArgs::new(path.clone()), |args, (from, to)| {
                args.with_key_remap(from, to)
            });
        PyTorchFileRecorder::<FullPrecisionSettings>::default()
            .load(args, device)
            .map_err(failed)?
    } else {
        let args = remaps
            .iter()
            .fold(SafetensorsLoadArgs::new(path.clone()), |args, (from, to)| {
                args.with_key_remap(from, to)
            });
        SafetensorsFileRecorder::<FullPrecisionSettings>::default()
            .load(args, device)
            .map_err(failed)?
    };

    Ok(backbone.load_record(record))
}

#[cfg(not(feature = "pretrained"))]
fn load_torchvision<B: Backend>(
    _backbone: VggFcn<B>,
    format: WeightFormat,
    _path: PathBuf,
    _config: &VggFcnConfig,
    _device: &B::Device,
) -> FcnResult<VggFcn<B>> {
    Err(FcnError::UnsupportedWeightFormat {
        format: format.extension().to_string(),
    })
}

/// Regex key remaps from torchvision's flat `features.N` numbering to the
/// stage/conv layout of [`VggFcn`]. Indices count one ReLU after every
/// convolution and one max-pool after every stage.
pub fn torchvision_key_remaps(config: &VggFcnConfig) -> Vec<(String, String)> {
    let mut remaps = Vec::new();
    let mut index = 0;
    for (stage, &convs) in config.convs_per_stage.iter().enumerate() {
        for conv in 0..convs {
            remaps.push((
                format!(r"^features\.{index}\.(weight|bias)$"),
                format!("stages.{stage}.convs.{conv}.$1"),
            ));
            index += 2;
        }
        index += 1;
    }
    remaps.push((r"^classifier\.0\.(weight|bias)$".to_string(), "fc6.$1".to_string()));
    remaps.push((r"^classifier\.3\.(weight|bias)$".to_string(), "fc7.$1".to_string()));
    remaps
}

/// Write `model` as a named MessagePack record. The `.mpk` extension is
/// appended when missing; any other extension is kept.
pub fn save_model<B: Backend>(model: &Fcn<B>, path: impl AsRef<Path>) -> FcnResult<PathBuf> {
    let path = record_path(path.as_ref());
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    model
        .clone()
        .save_file(path.clone(), &recorder())
        .map_err(|e| FcnError::ModelSaveFailed {
            path: path.clone(),
            reason: e.to_string(),
        })?;

    tracing::info!(path = %path.display(), "model saved");
    Ok(path)
}

/// Rebuild a model from `config` and load the record at `path`.
pub fn load_model<B: Backend>(
    config: &FcnConfig,
    path: impl AsRef<Path>,
    device: &B::Device,
) -> FcnResult<Fcn<B>> {
    let path = record_path(path.as_ref());
    if !path.is_file() {
        return Err(FcnError::MissingResource {
            what: "model record",
            path,
        });
    }

    config
        .init::<B>(device)?
        .load_file(path.clone(), &recorder(), device)
        .map_err(|e| FcnError::WeightLoadingFailed {
            path,
            reason: e.to_string(),
        })
}
