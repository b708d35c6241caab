//! Per-step progress snapshots.

use crate::tensor::Tensor;

use super::configuration::PipelineConfiguration;

/// Read-only view of the denoising loop after one step.
///
/// Returning `false` from the progress handler cancels generation.
#[derive(Debug, Clone, Copy)]
pub struct Progress<'a> {
    /// Zero-based index of the step just completed.
    pub step: usize,
    /// Number of steps in this run, after strength truncation.
    pub step_count: usize,
    /// Latents after this step, or the denoised estimates when
    /// `use_denoised_intermediates` is set. One per image.
    pub current_latent_samples: &'a [Tensor],
    pub configuration: &'a PipelineConfiguration,
}

impl Progress<'_> {
    /// Completed fraction in `[0, 1]`.
    pub fn fraction(&self) -> f32 {
        if self.step_count == 0 {
            return 1.0;
        }
        (self.step + 1) as f32 / self.step_count as f32
    }

    /// Whether this is the final step.
    pub fn is_last(&self) -> bool {
        self.step + 1 >= self.step_count
    }
}
