//! ControlNet graph.
//!
//! Residual outputs are named after the UNet inputs they feed, so the UNet
//! adapter can pass them through by name.

use std::path::Path;

use ort::session::Session;

use crate::config::EngineConfig;
use crate::error::{DiffusionError, ModelKind, Result};
use crate::models::{ControlNet, Residuals};
use crate::tensor::Tensor;

use super::{from_output, load_session, timestep_input, to_input};

/// Number of down-block residuals produced by an SD 1.x ControlNet.
const DOWN_BLOCK_RESIDUALS: usize = 12;

const MID_BLOCK_RESIDUAL: &str = "mid_block_res_sample";

/// Output names of the residual tensors.
pub fn residual_names() -> Vec<String> {
    (0..DOWN_BLOCK_RESIDUALS)
        .map(|i| format!("down_block_res_samples_{:02}", i))
        .chain(std::iter::once(MID_BLOCK_RESIDUAL.to_string()))
        .collect()
}

/// One ControlNet network.
pub struct OnnxControlNet {
    name: String,
    session: Session,
    residual_names: Vec<String>,
}

impl std::fmt::Debug for OnnxControlNet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxControlNet")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl OnnxControlNet {
    /// Loads a ControlNet graph from `controlnet/<name>.onnx`.
    pub fn load(path: &Path, engine: &EngineConfig) -> Result<Self> {
        let name = path
            .file_stem()
            .and_then(|n| n.to_str())
            .unwrap_or("controlnet")
            .to_string();
        Ok(Self {
            name,
            session: load_session(path, engine)?,
            residual_names: residual_names(),
        })
    }

    /// Model name, taken from the file stem.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl ControlNet for OnnxControlNet {
    fn execute(
        &mut self,
        latents: &[Tensor],
        time_step: usize,
        hidden_states: &Tensor,
        condition: &Tensor,
    ) -> Result<Vec<Residuals>> {
        let kind = ModelKind::ControlNet;
        let mut results = Vec::with_capacity(latents.len());

        for latent in latents {
            let batch = latent.shape().first().copied().unwrap_or(1);
            let inputs = vec![
                ("sample".to_string(), to_input(latent, kind)?),
                ("timestep".to_string(), timestep_input(time_step, batch, kind)?),
                ("encoder_hidden_states".to_string(), to_input(hidden_states, kind)?),
                ("controlnet_cond".to_string(), to_input(condition, kind)?),
            ];

            let mut outputs = self
                .session
                .run(inputs)
                .map_err(|e| DiffusionError::model_execution_failed(kind, e.to_string()))?;

            let mut residuals = Residuals::new();
            for name in &self.residual_names {
                if let Some(value) = outputs.remove(name.as_str()) {
                    residuals.insert(name.clone(), from_output(&value, kind)?);
                }
            }
            if residuals.is_empty() {
                return Err(DiffusionError::model_execution_failed(
                    kind,
                    format!("{} produced no residual outputs", self.name),
                ));
            }
            results.push(residuals);
        }

        Ok(results)
    }
}
