//! Contracts for the neural networks driven by the denoising loop.
//!
//! The pipeline only sees these traits. [`onnx`] provides ONNX Runtime
//! implementations loaded from an exported model directory; tests use small
//! in-memory fakes.
//!
//! - [`TextEncoder`]: prompt to hidden states (plus pooled embedding for XL)
//! - [`NoisePredictor`]: the UNet
//! - [`ControlNet`]: structural conditioning residuals
//! - [`ImageEncoder`] / [`ImageDecoder`]: VAE halves
//! - [`SafetyChecker`]: post-decode content filter

pub mod onnx;

use std::collections::BTreeMap;

use image::RgbImage;

use crate::error::Result;
use crate::tensor::Tensor;

/// Named additive residuals injected into the noise predictor.
pub type Residuals = BTreeMap<String, Tensor>;

/// Output of a text encoder for one prompt.
#[derive(Debug, Clone)]
pub struct TextEmbedding {
    /// Per-token hidden states, shaped `[1, tokens, dim]`.
    pub hidden_states: Tensor,
    /// Pooled prompt embedding, shaped `[1, dim]`, when the encoder has one.
    pub pooled: Option<Tensor>,
}

/// Encodes prompts into conditioning tensors.
pub trait TextEncoder {
    fn encode(&mut self, text: &str) -> Result<TextEmbedding>;
}

/// Conditioning shared by every latent in one noise-predictor call.
#[derive(Debug, Clone, Copy)]
pub struct NoiseConditioning<'a> {
    pub time_step: usize,
    /// Prompt hidden states, batched like the latents.
    pub hidden_states: &'a Tensor,
    /// Pooled text embedding (XL only).
    pub pooled_states: Option<&'a Tensor>,
    /// Size and crop conditioning (XL only).
    pub geometry: Option<&'a Tensor>,
    /// ControlNet residuals, one map per latent.
    pub residuals: Option<&'a [Residuals]>,
}

/// Predicts the noise present in latents (the UNet).
pub trait NoisePredictor {
    /// Returns one noise prediction per latent, shaped like the latent.
    fn predict_noise(
        &mut self,
        latents: &[Tensor],
        conditioning: &NoiseConditioning<'_>,
    ) -> Result<Vec<Tensor>>;

    /// Input shape the model expects, `[batch, channels, height, width]`.
    fn latent_sample_shape(&self) -> &[usize];

    /// Batch size the model accepts in a single call.
    fn batch_size(&self) -> usize {
        self.latent_sample_shape().first().copied().unwrap_or(1)
    }

    /// Releases memory held by the model. It is reloaded on the next call.
    fn unload_resources(&mut self) {}
}

/// A structural-conditioning network producing additive UNet residuals.
pub trait ControlNet {
    /// Runs the network once per latent against its conditioning image.
    fn execute(
        &mut self,
        latents: &[Tensor],
        time_step: usize,
        hidden_states: &Tensor,
        condition: &Tensor,
    ) -> Result<Vec<Residuals>>;
}

/// VAE encoder.
pub trait ImageEncoder {
    /// Returns the latent distribution parameters for an image tensor in
    /// `[-1, 1]`: means stacked over log-variances on the channel axis.
    fn encode_moments(&mut self, image: &Tensor) -> Result<Tensor>;
}

/// VAE decoder.
pub trait ImageDecoder {
    /// Decodes already-unscaled latents into image tensors in `[-1, 1]`,
    /// shaped `[1, 3, height, width]`.
    fn decode(&mut self, latents: &[Tensor]) -> Result<Vec<Tensor>>;
}

/// Content filter run on decoded images.
pub trait SafetyChecker {
    fn is_safe(&mut self, image: &RgbImage) -> Result<bool>;
}
