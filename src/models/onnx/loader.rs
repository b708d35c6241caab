//! Model loader for exported Stable Diffusion ONNX graphs.
//!
//! Expected directory layout:
//!
//! ```text
//! tokenizer.json            required
//! text_encoder.onnx         required
//! unet.onnx                 required
//! vae_decoder.onnx          required
//! tokenizer_2.json          optional, XL (falls back to tokenizer.json)
//! text_encoder_2.onnx       optional, XL
//! unet_refiner.onnx         optional, XL refiner
//! vae_encoder.onnx          optional, image-to-image
//! safety_checker.onnx       optional
//! controlnet/*.onnx         optional, loaded in file-name order
//! config.json               optional, see [`ModelMetadata`]
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::{DiffusionError, ErrorCode, ModelKind, Result};
use crate::pipeline::StableDiffusionPipeline;

use super::{
    OnnxControlNet, OnnxSafetyChecker, OnnxTextEncoder, OnnxUnet, OnnxVaeDecoder, OnnxVaeEncoder,
};

/// Files that must be present for text-to-image generation.
pub const REQUIRED_FILES: &[&str] = &[
    "tokenizer.json",
    "text_encoder.onnx",
    "unet.onnx",
    "vae_decoder.onnx",
];

/// Model metadata read from `config.json`. Missing keys take defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelMetadata {
    /// UNet `sample` shape, `[batch, channels, height, width]`.
    pub latent_shape: Vec<usize>,
    /// Refiner `sample` shape, when it differs from the base UNet.
    pub refiner_latent_shape: Option<Vec<usize>>,
    /// Text encoder context length.
    pub max_tokens: usize,
    /// VAE scale factor.
    pub scale_factor: f32,
    /// VAE shift factor.
    pub shift_factor: f32,
}

impl Default for ModelMetadata {
    fn default() -> Self {
        Self {
            latent_shape: vec![2, 4, 64, 64],
            refiner_latent_shape: None,
            max_tokens: 77,
            scale_factor: 0.18215,
            shift_factor: 0.0,
        }
    }
}

impl ModelMetadata {
    fn validate(&self) -> Result<()> {
        let shapes = std::iter::once(&self.latent_shape).chain(self.refiner_latent_shape.as_ref());
        for shape in shapes {
            if shape.len() != 4 || shape.contains(&0) {
                return Err(DiffusionError::invalid_configuration(format!(
                    "latent shape must have four non-zero dimensions, got {:?}",
                    shape
                )));
            }
        }
        if self.max_tokens == 0 {
            return Err(DiffusionError::invalid_configuration(
                "max_tokens must be > 0",
            ));
        }
        if !(self.scale_factor.is_finite() && self.scale_factor > 0.0) {
            return Err(DiffusionError::invalid_configuration(format!(
                "scale_factor must be a positive number, got {}",
                self.scale_factor
            )));
        }
        if !self.shift_factor.is_finite() {
            return Err(DiffusionError::invalid_configuration(
                "shift_factor must be finite",
            ));
        }
        Ok(())
    }
}

/// Complete set of loaded ONNX models.
#[derive(Debug)]
pub struct OnnxModels {
    pub metadata: ModelMetadata,
    pub text_encoder: OnnxTextEncoder,
    pub text_encoder_2: Option<OnnxTextEncoder>,
    pub unet: OnnxUnet,
    pub unet_refiner: Option<OnnxUnet>,
    pub vae_decoder: OnnxVaeDecoder,
    pub vae_encoder: Option<OnnxVaeEncoder>,
    pub safety_checker: Option<OnnxSafetyChecker>,
    pub control_nets: Vec<OnnxControlNet>,
}

impl OnnxModels {
    /// Assembles a pipeline owning these models.
    pub fn into_pipeline(self) -> StableDiffusionPipeline {
        let mut pipeline = StableDiffusionPipeline::new(
            Box::new(self.text_encoder),
            Box::new(self.unet),
            Box::new(self.vae_decoder),
        );
        if let Some(encoder) = self.text_encoder_2 {
            pipeline = pipeline.with_text_encoder_2(Box::new(encoder));
        }
        if let Some(refiner) = self.unet_refiner {
            pipeline = pipeline.with_refiner(Box::new(refiner));
        }
        if let Some(encoder) = self.vae_encoder {
            pipeline = pipeline.with_encoder(Box::new(encoder));
        }
        if let Some(checker) = self.safety_checker {
            pipeline = pipeline.with_safety_checker(Box::new(checker));
        }
        for control_net in self.control_nets {
            pipeline = pipeline.with_control_net(Box::new(control_net));
        }
        pipeline
    }
}

/// Checks if all required model files exist in the directory.
///
/// Returns Ok(()) if all files exist, or an error listing missing files.
pub fn check_models(model_dir: &Path) -> Result<()> {
    let missing: Vec<&str> = REQUIRED_FILES
        .iter()
        .copied()
        .filter(|file| !model_dir.join(file).exists())
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(DiffusionError::model_not_found(format!(
            "Missing model files in {}: {}",
            model_dir.display(),
            missing.join(", ")
        )))
    }
}

/// Loads `config.json` from the model directory, or defaults if absent.
pub fn load_metadata(model_dir: &Path) -> Result<ModelMetadata> {
    let config_path = model_dir.join("config.json");
    if !config_path.exists() {
        return Ok(ModelMetadata::default());
    }

    let content = std::fs::read_to_string(&config_path).map_err(|e| {
        DiffusionError::with_source(
            ErrorCode::ModelLoadFailed,
            "Failed to read config.json",
            e,
        )
    })?;
    let metadata: ModelMetadata = serde_json::from_str(&content).map_err(|e| {
        DiffusionError::invalid_configuration(format!("Failed to parse config.json: {}", e))
    })?;
    metadata.validate()?;
    Ok(metadata)
}

/// Lists ControlNet graphs in `controlnet/`, sorted by file name.
fn control_net_paths(model_dir: &Path) -> Result<Vec<PathBuf>> {
    let dir = model_dir.join("controlnet");
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let entries = std::fs::read_dir(&dir).map_err(|e| {
        DiffusionError::model_load_failed(format!("Failed to read {}: {}", dir.display(), e))
    })?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "onnx"))
        .collect();
    paths.sort();
    Ok(paths)
}

/// Loads all model sessions from a directory.
pub fn load_models(model_dir: &Path, engine: &EngineConfig) -> Result<OnnxModels> {
    check_models(model_dir)?;
    let metadata = load_metadata(model_dir)?;
    let optional = |file: &str| {
        let path = model_dir.join(file);
        path.exists().then_some(path)
    };

    tracing::info!(path = %model_dir.display(), "loading text encoder");
    let text_encoder = OnnxTextEncoder::load(
        &model_dir.join("tokenizer.json"),
        &model_dir.join("text_encoder.onnx"),
        metadata.max_tokens,
        ModelKind::TextEncoder,
        engine,
    )?;

    let text_encoder_2 = match optional("text_encoder_2.onnx") {
        Some(path) => {
            tracing::info!("loading second text encoder");
            let tokenizer =
                optional("tokenizer_2.json").unwrap_or_else(|| model_dir.join("tokenizer.json"));
            Some(OnnxTextEncoder::load(
                &tokenizer,
                &path,
                metadata.max_tokens,
                ModelKind::TextEncoder2,
                engine,
            )?)
        }
        None => None,
    };

    tracing::info!("loading unet");
    let unet = OnnxUnet::load(
        &model_dir.join("unet.onnx"),
        metadata.latent_shape.clone(),
        ModelKind::Unet,
        engine,
    )?;

    let unet_refiner = match optional("unet_refiner.onnx") {
        Some(path) => {
            tracing::info!("loading refiner unet");
            let shape = metadata
                .refiner_latent_shape
                .clone()
                .unwrap_or_else(|| metadata.latent_shape.clone());
            let mut refiner = OnnxUnet::load(&path, shape, ModelKind::UnetRefiner, engine)?;
            // Resident only once the base UNet hands over.
            crate::models::NoisePredictor::unload_resources(&mut refiner);
            Some(refiner)
        }
        None => None,
    };

    tracing::info!("loading vae");
    let vae_decoder = OnnxVaeDecoder::load(&model_dir.join("vae_decoder.onnx"), engine)?;
    let vae_encoder = optional("vae_encoder.onnx")
        .map(|path| OnnxVaeEncoder::load(&path, engine))
        .transpose()?;

    let safety_checker = optional("safety_checker.onnx")
        .map(|path| OnnxSafetyChecker::load(&path, engine))
        .transpose()?;

    let control_nets = control_net_paths(model_dir)?
        .iter()
        .map(|path| OnnxControlNet::load(path, engine))
        .collect::<Result<Vec<_>>>()?;

    tracing::info!(
        xl = text_encoder_2.is_some(),
        refiner = unet_refiner.is_some(),
        encoder = vae_encoder.is_some(),
        safety_checker = safety_checker.is_some(),
        control_nets = control_nets.len(),
        "all models loaded"
    );

    Ok(OnnxModels {
        metadata,
        text_encoder,
        text_encoder_2,
        unet,
        unet_refiner,
        vae_decoder,
        vae_encoder,
        safety_checker,
        control_nets,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn check_models_lists_missing_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("tokenizer.json"), "{}").unwrap();
        fs::write(dir.path().join("unet.onnx"), "").unwrap();

        let err = check_models(dir.path()).unwrap_err();
        assert_eq!(err.code, ErrorCode::ModelNotFound);
        assert!(err.message.contains("text_encoder.onnx"));
        assert!(err.message.contains("vae_decoder.onnx"));
        assert!(!err.message.contains("unet.onnx"));
    }

    #[test]
    fn check_models_accepts_complete_directory() {
        let dir = TempDir::new().unwrap();
        for file in REQUIRED_FILES {
            fs::write(dir.path().join(file), "").unwrap();
        }
        assert!(check_models(dir.path()).is_ok());
    }

    #[test]
    fn metadata_defaults_when_absent() {
        let dir = TempDir::new().unwrap();
        let metadata = load_metadata(dir.path()).unwrap();
        assert_eq!(metadata, ModelMetadata::default());
        assert_eq!(metadata.latent_shape, vec![2, 4, 64, 64]);
    }

    #[test]
    fn metadata_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("config.json"),
            r#"{"latent_shape": [2, 4, 128, 128], "scale_factor": 0.13025}"#,
        )
        .unwrap();

        let metadata = load_metadata(dir.path()).unwrap();
        assert_eq!(metadata.latent_shape, vec![2, 4, 128, 128]);
        assert_eq!(metadata.scale_factor, 0.13025);
        assert_eq!(metadata.max_tokens, 77);
        assert_eq!(metadata.shift_factor, 0.0);
    }

    #[test]
    fn metadata_rejects_bad_values() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("config.json"), r#"{"latent_shape": [4, 64, 64]}"#).unwrap();
        let err = load_metadata(dir.path()).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidConfiguration);

        fs::write(dir.path().join("config.json"), "not json").unwrap();
        let err = load_metadata(dir.path()).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidConfiguration);
    }

    #[test]
    fn control_nets_are_sorted_onnx_files() {
        let dir = TempDir::new().unwrap();
        let cn = dir.path().join("controlnet");
        fs::create_dir(&cn).unwrap();
        fs::write(cn.join("canny.onnx"), "").unwrap();
        fs::write(cn.join("depth.onnx"), "").unwrap();
        fs::write(cn.join("README.md"), "").unwrap();

        let paths = control_net_paths(dir.path()).unwrap();
        let names: Vec<_> = paths
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["canny.onnx", "depth.onnx"]);
    }

    #[test]
    fn control_nets_absent_directory() {
        let dir = TempDir::new().unwrap();
        assert!(control_net_paths(dir.path()).unwrap().is_empty());
    }
}
