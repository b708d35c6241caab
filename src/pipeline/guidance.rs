//! Classifier-free guidance.
//!
//! Guided batches stack the unconditional input first and the conditional
//! input second along the batch axis.

use ndarray::Zip;

use crate::error::Result;
use crate::tensor::{concat_batch, split_batch, Tensor};

/// Stacks each latent with itself so one call covers both guidance passes.
pub fn duplicate_for_guidance(latents: &[Tensor]) -> Result<Vec<Tensor>> {
    latents
        .iter()
        .map(|latent| concat_batch(&[latent, latent]))
        .collect()
}

/// Combines `[uncond, cond]` noise batches into guided predictions:
/// `uncond + scale * (cond - uncond)`.
///
/// A scale of exactly 1.0 returns the conditional half unchanged.
pub fn perform_guidance(noise: &[Tensor], guidance_scale: f32) -> Result<Vec<Tensor>> {
    noise
        .iter()
        .map(|batch| guide(batch, guidance_scale))
        .collect()
}

fn guide(batch: &Tensor, guidance_scale: f32) -> Result<Tensor> {
    let (uncond, cond) = split_batch(batch)?;
    if guidance_scale == 1.0 {
        return Ok(cond);
    }
    Ok(Zip::from(&uncond)
        .and(&cond)
        .map_collect(|&u, &c| u + guidance_scale * (c - u)))
}
