//! Per-generation parameters.

use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::error::{DiffusionError, Result};
use crate::random::RngAlgorithm;
use crate::schedulers::{SchedulerKind, TimestepSpacing};

/// Default number of denoising steps.
pub const DEFAULT_STEP_COUNT: usize = 50;

/// Upper bound accepted for `step_count`.
pub const MAX_STEP_COUNT: usize = 500;

/// Default classifier-free guidance scale.
pub const DEFAULT_GUIDANCE_SCALE: f32 = 7.5;

/// Latent scale factor of the Stable Diffusion 1.x/2.x VAE.
pub const DEFAULT_SCALE_FACTOR: f32 = 0.18215;

/// Whether generation starts from pure noise or from an encoded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMode {
    TextToImage,
    ImageToImage,
}

/// Size and aesthetic conditioning for XL models.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct XlConditioning {
    /// Original image size as `[height, width]`.
    pub original_size: [f32; 2],
    /// Crop offset as `[top, left]`.
    pub crop_top_left: [f32; 2],
    /// Target image size as `[height, width]`.
    pub target_size: [f32; 2],
    /// Refiner aesthetic score for the conditional pass.
    pub aesthetic_score: f32,
    /// Refiner aesthetic score for the unconditional pass.
    pub negative_aesthetic_score: f32,
    /// Fraction of the schedule run by the base UNet before the refiner.
    pub refiner_start: f32,
}

impl Default for XlConditioning {
    fn default() -> Self {
        Self {
            original_size: [1024.0, 1024.0],
            crop_top_left: [0.0, 0.0],
            target_size: [1024.0, 1024.0],
            aesthetic_score: 6.0,
            negative_aesthetic_score: 2.5,
            refiner_start: 0.8,
        }
    }
}

/// Everything that varies between two `generate_images` calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfiguration {
    pub prompt: String,
    pub negative_prompt: String,
    /// Number of denoising steps.
    pub step_count: usize,
    /// Classifier-free guidance scale; below 1.0 disables guidance.
    pub guidance_scale: f32,
    pub image_count: usize,
    pub seed: u32,
    pub rng: RngAlgorithm,
    /// Image-to-image strength in `(0, 1]`; 1.0 starts from pure noise.
    pub strength: f32,
    pub scheduler: SchedulerKind,
    pub timestep_spacing: TimestepSpacing,
    /// Report denoised estimates instead of raw latents in progress updates.
    pub use_denoised_intermediates: bool,
    /// Skip the safety checker even when one is attached.
    pub disable_safety: bool,
    /// Image to start from; switches to image-to-image.
    #[serde(skip)]
    pub starting_image: Option<DynamicImage>,
    /// One conditioning image per attached ControlNet, in attachment order.
    #[serde(skip)]
    pub control_net_inputs: Vec<DynamicImage>,
    pub encoder_scale_factor: f32,
    pub decoder_scale_factor: f32,
    pub decoder_shift_factor: f32,
    pub xl: XlConditioning,
}

impl Default for PipelineConfiguration {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: String::new(),
            step_count: DEFAULT_STEP_COUNT,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
            image_count: 1,
            seed: 0,
            rng: RngAlgorithm::default(),
            strength: 1.0,
            scheduler: SchedulerKind::default(),
            timestep_spacing: TimestepSpacing::default(),
            use_denoised_intermediates: false,
            disable_safety: false,
            starting_image: None,
            control_net_inputs: Vec::new(),
            encoder_scale_factor: DEFAULT_SCALE_FACTOR,
            decoder_scale_factor: DEFAULT_SCALE_FACTOR,
            decoder_shift_factor: 0.0,
            xl: XlConditioning::default(),
        }
    }
}

impl PipelineConfiguration {
    /// Creates a configuration for `prompt` with default settings.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    /// Image-to-image when a starting image is present.
    pub fn mode(&self) -> PipelineMode {
        if self.starting_image.is_some() {
            PipelineMode::ImageToImage
        } else {
            PipelineMode::TextToImage
        }
    }

    /// Whether both unconditional and conditional passes are run.
    pub fn uses_guidance(&self) -> bool {
        self.guidance_scale >= 1.0
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.step_count == 0 || self.step_count > MAX_STEP_COUNT {
            return Err(DiffusionError::invalid_configuration(format!(
                "step_count must be between 1 and {}, got {}",
                MAX_STEP_COUNT, self.step_count
            )));
        }

        if self.image_count == 0 {
            return Err(DiffusionError::invalid_configuration(
                "image_count must be > 0",
            ));
        }

        if !(self.strength > 0.0 && self.strength <= 1.0) {
            return Err(DiffusionError::invalid_configuration(format!(
                "strength must be in (0, 1], got {}",
                self.strength
            )));
        }

        if !self.guidance_scale.is_finite() || self.guidance_scale < 0.0 {
            return Err(DiffusionError::invalid_configuration(format!(
                "guidance_scale must be a non-negative number, got {}",
                self.guidance_scale
            )));
        }

        for (name, value) in [
            ("encoder_scale_factor", self.encoder_scale_factor),
            ("decoder_scale_factor", self.decoder_scale_factor),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(DiffusionError::invalid_configuration(format!(
                    "{} must be a positive number, got {}",
                    name, value
                )));
            }
        }

        if !self.decoder_shift_factor.is_finite() {
            return Err(DiffusionError::invalid_configuration(
                "decoder_shift_factor must be finite",
            ));
        }

        if !(0.0..=1.0).contains(&self.xl.refiner_start) {
            return Err(DiffusionError::invalid_configuration(format!(
                "refiner_start must be in [0, 1], got {}",
                self.xl.refiner_start
            )));
        }

        Ok(())
    }
}
