//! ControlNet conditioning and residual merging.

use image::DynamicImage;

use crate::error::{DiffusionError, Result};
use crate::models::{ControlNet, Residuals};
use crate::tensor::{concat_batch, Tensor};

use super::image::planar_rgb;

/// Pixel-space size of one latent cell.
pub const LATENT_DOWNSCALE: usize = 8;

/// Converts conditioning images to `[0, 1]` planar tensors at the pixel size
/// of `latent_shape`, duplicated along the batch axis when guidance is on.
pub fn prepare_conditions(
    images: &[DynamicImage],
    latent_shape: &[usize],
    guidance: bool,
) -> Result<Vec<Tensor>> {
    let (height, width) = match *latent_shape {
        [_, _, h, w] => (h * LATENT_DOWNSCALE, w * LATENT_DOWNSCALE),
        _ => {
            return Err(DiffusionError::invalid_configuration(format!(
                "latent shape must be [batch, channels, h, w], got {:?}",
                latent_shape
            )))
        }
    };

    images
        .iter()
        .map(|image| {
            let condition = planar_rgb(image, width as u32, height as u32, 0.0, 1.0);
            if guidance {
                concat_batch(&[&condition, &condition])
            } else {
                Ok(condition)
            }
        })
        .collect()
}

/// Runs every network against its condition and sums the residuals by name.
///
/// Returns one merged map per latent, or `None` when no networks ran.
pub fn run_control_nets(
    control_nets: &mut [Box<dyn ControlNet>],
    conditions: &[Tensor],
    latents: &[Tensor],
    time_step: usize,
    hidden_states: &Tensor,
) -> Result<Option<Vec<Residuals>>> {
    let mut merged: Option<Vec<Residuals>> = None;
    for (net, condition) in control_nets.iter_mut().zip(conditions) {
        let residuals = net.execute(latents, time_step, hidden_states, condition)?;
        merged = Some(match merged {
            None => residuals,
            Some(acc) => merge_residuals(acc, residuals)?,
        });
    }
    Ok(merged)
}

/// Adds `next` into `acc` per latent, summing tensors that share a name.
pub fn merge_residuals(mut acc: Vec<Residuals>, next: Vec<Residuals>) -> Result<Vec<Residuals>> {
    if acc.len() != next.len() {
        return Err(DiffusionError::invalid_configuration(format!(
            "ControlNets returned residuals for {} and {} latents",
            acc.len(),
            next.len()
        )));
    }

    for (merged, residuals) in acc.iter_mut().zip(next) {
        for (name, tensor) in residuals {
            match merged.get_mut(&name) {
                Some(existing) if existing.shape() == tensor.shape() => *existing += &tensor,
                Some(existing) => {
                    return Err(DiffusionError::invalid_configuration(format!(
                        "residual {} has shape {:?}, expected {:?}",
                        name,
                        tensor.shape(),
                        existing.shape()
                    )))
                }
                None => {
                    merged.insert(name, tensor);
                }
            }
        }
    }
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::filled;

    fn residuals(pairs: &[(&str, f32)]) -> Residuals {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), filled(&[2, 4, 2, 2], *value)))
            .collect()
    }

    #[test]
    fn same_named_residuals_are_summed() {
        let merged = merge_residuals(
            vec![residuals(&[("down_0", 1.0)])],
            vec![residuals(&[("down_0", 1.0), ("mid", 0.5)])],
        )
        .unwrap();
        assert_eq!(merged.len(), 1);
        assert!(merged[0]["down_0"].iter().all(|&v| v == 2.0));
        assert!(merged[0]["mid"].iter().all(|&v| v == 0.5));
    }

    #[test]
    fn merge_rejects_mismatches() {
        assert!(merge_residuals(vec![residuals(&[])], vec![]).is_err());

        let mut other = Residuals::new();
        other.insert("down_0".into(), filled(&[1, 4, 2, 2], 1.0));
        assert!(merge_residuals(vec![residuals(&[("down_0", 1.0)])], vec![other]).is_err());
    }

    #[test]
    fn conditions_match_pixel_size() {
        let images = vec![DynamicImage::new_rgb8(16, 16)];
        let conditions = prepare_conditions(&images, &[2, 4, 4, 6], true).unwrap();
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].shape(), &[2, 3, 32, 48]);

        let single = prepare_conditions(&images, &[1, 4, 4, 6], false).unwrap();
        assert_eq!(single[0].shape(), &[1, 3, 32, 48]);

        assert!(prepare_conditions(&images, &[4, 4], false).is_err());
    }
}
