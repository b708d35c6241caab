//! UNet noise predictor.
//!
//! The session is loaded eagerly and can be released with
//! [`NoisePredictor::unload_resources`]; it is reloaded transparently on the
//! next prediction. The XL pipeline uses this to keep only one of the base
//! and refiner UNets resident.

use std::path::{Path, PathBuf};

use ort::session::Session;

use crate::config::EngineConfig;
use crate::error::{DiffusionError, ModelKind, Result};
use crate::models::{NoiseConditioning, NoisePredictor};
use crate::tensor::Tensor;

use super::{from_output, load_session, timestep_input, to_input, SessionInputList};

/// ONNX UNet.
pub struct OnnxUnet {
    path: PathBuf,
    engine: EngineConfig,
    session: Option<Session>,
    latent_shape: Vec<usize>,
    kind: ModelKind,
}

impl std::fmt::Debug for OnnxUnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxUnet")
            .field("path", &self.path)
            .field("loaded", &self.session.is_some())
            .field("latent_shape", &self.latent_shape)
            .finish_non_exhaustive()
    }
}

impl OnnxUnet {
    /// Loads a UNet graph.
    ///
    /// # Arguments
    ///
    /// * `path` - `unet.onnx` or `unet_refiner.onnx`
    /// * `latent_shape` - Expected `sample` shape, batch first
    /// * `kind` - [`ModelKind::Unet`] or [`ModelKind::UnetRefiner`]
    pub fn load(
        path: &Path,
        latent_shape: Vec<usize>,
        kind: ModelKind,
        engine: &EngineConfig,
    ) -> Result<Self> {
        let session = load_session(path, engine)?;
        Ok(Self {
            path: path.to_path_buf(),
            engine: engine.clone(),
            session: Some(session),
            latent_shape,
            kind,
        })
    }

    /// Returns whether the session is currently resident.
    pub fn is_loaded(&self) -> bool {
        self.session.is_some()
    }

    fn session(&mut self) -> Result<&mut Session> {
        if self.session.is_none() {
            tracing::info!(model = %self.kind, "reloading unloaded model");
            self.session = Some(load_session(&self.path, &self.engine)?);
        }
        self.session
            .as_mut()
            .ok_or_else(|| DiffusionError::model_load_failed(format!("{} is not loaded", self.kind)))
    }

    fn build_inputs(
        &self,
        latent: &Tensor,
        conditioning: &NoiseConditioning<'_>,
        index: usize,
    ) -> Result<SessionInputList> {
        let kind = self.kind;
        let batch = latent.shape().first().copied().unwrap_or(1);

        let mut inputs: SessionInputList = vec![
            ("sample".to_string(), to_input(latent, kind)?),
            (
                "timestep".to_string(),
                timestep_input(conditioning.time_step, batch, kind)?,
            ),
            (
                "encoder_hidden_states".to_string(),
                to_input(conditioning.hidden_states, kind)?,
            ),
        ];

        if let Some(pooled) = conditioning.pooled_states {
            inputs.push(("text_embeds".to_string(), to_input(pooled, kind)?));
        }
        if let Some(geometry) = conditioning.geometry {
            inputs.push(("time_ids".to_string(), to_input(geometry, kind)?));
        }
        if let Some(residuals) = conditioning.residuals {
            let residuals = residuals.get(index).ok_or_else(|| {
                DiffusionError::feature_encoding_failed(kind, "missing residuals for latent")
            })?;
            for (name, tensor) in residuals {
                inputs.push((name.clone(), to_input(tensor, kind)?));
            }
        }

        Ok(inputs)
    }
}

impl NoisePredictor for OnnxUnet {
    fn predict_noise(
        &mut self,
        latents: &[Tensor],
        conditioning: &NoiseConditioning<'_>,
    ) -> Result<Vec<Tensor>> {
        let kind = self.kind;
        let mut noise = Vec::with_capacity(latents.len());

        for (index, latent) in latents.iter().enumerate() {
            let inputs = self.build_inputs(latent, conditioning, index)?;
            let session = self.session()?;
            let mut outputs = session
                .run(inputs)
                .map_err(|e| DiffusionError::model_execution_failed(kind, e.to_string()))?;

            let out = outputs.remove("out_sample").ok_or_else(|| {
                DiffusionError::model_execution_failed(kind, "out_sample not found in output")
            })?;
            noise.push(from_output(&out, kind)?);
        }

        Ok(noise)
    }

    fn latent_sample_shape(&self) -> &[usize] {
        &self.latent_shape
    }

    fn unload_resources(&mut self) {
        if self.session.take().is_some() {
            tracing::debug!(model = %self.kind, "unloaded model");
        }
    }
}
