//! ONNX Runtime implementations of the model contracts.
//!
//! Models are loaded from a directory of exported graphs (see
//! [`loader`] for the expected layout). fp16 exports are supported: outputs
//! are widened to `f32` on extraction.

pub mod controlnet;
pub mod loader;
pub mod safety_checker;
pub mod text_encoder;
pub mod unet;
pub mod vae;

use std::path::Path;

use half::f16;
use ndarray::IxDyn;
use ort::execution_providers::{CUDAExecutionProvider, ExecutionProviderDispatch};
use ort::session::Session;
use ort::value::DynValue;

use crate::config::{Device, EngineConfig};
use crate::error::{DiffusionError, ModelKind, Result};
use crate::tensor::Tensor;

pub use controlnet::OnnxControlNet;
pub use loader::{check_models, load_metadata, load_models, ModelMetadata, OnnxModels, REQUIRED_FILES};
pub use safety_checker::OnnxSafetyChecker;
pub use text_encoder::OnnxTextEncoder;
pub use unet::OnnxUnet;
pub use vae::{OnnxVaeDecoder, OnnxVaeEncoder};

/// Named session inputs.
pub(crate) type SessionInputList = Vec<(String, DynValue)>;

/// Loads an ONNX session with the configured device and thread count.
pub(crate) fn load_session(path: &Path, engine: &EngineConfig) -> Result<Session> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("model");

    let mut builder = Session::builder().map_err(|e| {
        DiffusionError::model_load_failed(format!("Failed to create session: {}", e))
    })?;

    let providers = execution_providers(engine.device);
    if !providers.is_empty() {
        builder = builder.with_execution_providers(providers).map_err(|e| {
            DiffusionError::model_load_failed(format!("Failed to set execution providers: {}", e))
        })?;
    }

    if let Some(threads) = engine.threads {
        builder = builder.with_intra_threads(threads).map_err(|e| {
            DiffusionError::model_load_failed(format!("Failed to set thread count: {}", e))
        })?;
    }

    let session = builder.commit_from_file(path).map_err(|e| {
        DiffusionError::model_load_failed(format!("Failed to load {}: {}", file_name, e))
    })?;

    tracing::debug!(model = file_name, device = %engine.device, "loaded onnx session");
    Ok(session)
}

fn execution_providers(device: Device) -> Vec<ExecutionProviderDispatch> {
    match device {
        Device::Cpu => Vec::new(),
        Device::Auto => vec![CUDAExecutionProvider::default().build()],
        Device::Cuda => vec![CUDAExecutionProvider::default().build().error_on_failure()],
    }
}

/// Copies a tensor into an ONNX `f32` input value.
pub(crate) fn to_input(tensor: &Tensor, model: ModelKind) -> Result<DynValue> {
    let shape: Vec<usize> = tensor.shape().to_vec();
    let data: Vec<f32> = tensor.iter().copied().collect();
    let value = ort::value::Tensor::from_array((shape, data))
        .map_err(|e| DiffusionError::feature_encoding_failed(model, e.to_string()))?;
    Ok(value.into_dyn())
}

/// Builds the `timestep` input, one entry per batch element.
pub(crate) fn timestep_input(time_step: usize, batch: usize, model: ModelKind) -> Result<DynValue> {
    let value = ort::value::Tensor::from_array(([batch], vec![time_step as i64; batch]))
        .map_err(|e| DiffusionError::feature_encoding_failed(model, e.to_string()))?;
    Ok(value.into_dyn())
}

/// Extracts an `f32` or `f16` output into a tensor.
pub(crate) fn from_output(value: &DynValue, model: ModelKind) -> Result<Tensor> {
    let (dims, data) = if let Ok((shape, data)) = value.try_extract_tensor::<f32>() {
        (to_dims(shape), data.to_vec())
    } else if let Ok((shape, data)) = value.try_extract_tensor::<f16>() {
        (to_dims(shape), data.iter().map(|v| f32::from(*v)).collect())
    } else {
        return Err(DiffusionError::model_execution_failed(
            model,
            "output must be either f16 or f32",
        ));
    };

    Tensor::from_shape_vec(IxDyn(&dims), data).map_err(|e| {
        DiffusionError::invalid_configuration(format!("{} output shape is inconsistent: {}", model, e))
    })
}

fn to_dims(shape: &[i64]) -> Vec<usize> {
    shape.iter().map(|&d| d as usize).collect()
}
