//! VAE encoder and decoder graphs.

use std::path::Path;

use ort::session::Session;

use crate::config::EngineConfig;
use crate::error::{DiffusionError, ModelKind, Result};
use crate::models::{ImageDecoder, ImageEncoder};
use crate::tensor::Tensor;

use super::{from_output, load_session, to_input};

/// VAE decoder: latents to `[-1, 1]` images.
pub struct OnnxVaeDecoder {
    session: Session,
}

impl std::fmt::Debug for OnnxVaeDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxVaeDecoder").finish_non_exhaustive()
    }
}

impl OnnxVaeDecoder {
    /// Loads `vae_decoder.onnx`.
    pub fn load(path: &Path, engine: &EngineConfig) -> Result<Self> {
        Ok(Self {
            session: load_session(path, engine)?,
        })
    }
}

impl ImageDecoder for OnnxVaeDecoder {
    fn decode(&mut self, latents: &[Tensor]) -> Result<Vec<Tensor>> {
        let kind = ModelKind::VaeDecoder;
        latents
            .iter()
            .map(|latent| {
                let input = to_input(latent, kind)?;
                let mut outputs = self
                    .session
                    .run(ort::inputs!["latent_sample" => input])
                    .map_err(|e| DiffusionError::model_execution_failed(kind, e.to_string()))?;
                let sample = outputs.remove("sample").ok_or_else(|| {
                    DiffusionError::model_execution_failed(kind, "sample not found in output")
                })?;
                from_output(&sample, kind)
            })
            .collect()
    }
}

/// VAE encoder: `[-1, 1]` images to latent distribution parameters.
pub struct OnnxVaeEncoder {
    session: Session,
}

impl std::fmt::Debug for OnnxVaeEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxVaeEncoder").finish_non_exhaustive()
    }
}

impl OnnxVaeEncoder {
    /// Loads `vae_encoder.onnx`.
    pub fn load(path: &Path, engine: &EngineConfig) -> Result<Self> {
        Ok(Self {
            session: load_session(path, engine)?,
        })
    }
}

impl ImageEncoder for OnnxVaeEncoder {
    fn encode_moments(&mut self, image: &Tensor) -> Result<Tensor> {
        let kind = ModelKind::VaeEncoder;
        let input = to_input(image, kind)?;
        let mut outputs = self
            .session
            .run(ort::inputs!["sample" => input])
            .map_err(|e| DiffusionError::model_execution_failed(kind, e.to_string()))?;
        let moments = outputs.remove("latent_parameters").ok_or_else(|| {
            DiffusionError::model_execution_failed(kind, "latent_parameters not found in output")
        })?;
        from_output(&moments, kind)
    }
}
