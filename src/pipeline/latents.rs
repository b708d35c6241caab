//! Moving between pixel space and the latent space the UNet works in.

use ndarray::{Axis, Slice, Zip};

use crate::error::{DiffusionError, Result};
use crate::random::RandomSource;
use crate::tensor::Tensor;

/// Bounds applied to the VAE log-variance before sampling.
const LOGVAR_MIN: f32 = -30.0;
const LOGVAR_MAX: f32 = 20.0;

/// Draws `count` independent Gaussian latents of `shape`, scaled by the
/// scheduler's initial noise sigma.
pub fn initial_noise(
    random: &mut dyn RandomSource,
    shape: &[usize],
    count: usize,
    init_noise_sigma: f32,
) -> Vec<Tensor> {
    (0..count)
        .map(|_| random.normal_tensor(shape, 0.0, init_noise_sigma as f64))
        .collect()
}

/// Samples a latent from VAE encoder moments: `mean + exp(logvar / 2) * z`,
/// scaled by `scale_factor`.
///
/// `moments` stacks the means over the log-variances on axis 1.
pub fn sample_latent(
    moments: &Tensor,
    scale_factor: f32,
    random: &mut dyn RandomSource,
) -> Result<Tensor> {
    let channels = moments.shape().get(1).copied().unwrap_or(0);
    if moments.ndim() != 4 || channels == 0 || channels % 2 != 0 {
        return Err(DiffusionError::invalid_configuration(format!(
            "encoder output must be [batch, 2 * channels, h, w], got {:?}",
            moments.shape()
        )));
    }

    let half = channels / 2;
    let mean = moments.slice_axis(Axis(1), Slice::from(..half));
    let logvar = moments.slice_axis(Axis(1), Slice::from(half..));
    let noise = random.normal_tensor(mean.shape(), 0.0, 1.0);

    Ok(Zip::from(&mean)
        .and(&logvar)
        .and(&noise)
        .map_collect(|&m, &lv, &z| {
            let std = (0.5 * lv.clamp(LOGVAR_MIN, LOGVAR_MAX)).exp();
            (m + std * z) * scale_factor
        }))
}

/// Undoes the VAE latent scaling ahead of decoding: `latent / scale + shift`.
pub fn unscale_latents(latents: &[Tensor], scale_factor: f32, shift_factor: f32) -> Vec<Tensor> {
    latents
        .iter()
        .map(|latent| latent.mapv(|v| v / scale_factor + shift_factor))
        .collect()
}
