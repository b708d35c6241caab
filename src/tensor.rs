//! Tensor primitive shared by the schedulers and the pipeline.
//!
//! Latents, noise predictions and conditioning inputs are all dynamic-rank
//! `f32` arrays. Only the handful of operations the denoising loop needs are
//! provided here: weighted sums, batch-axis concatenation and batch slicing.

use ndarray::{concatenate, ArrayD, Axis, Slice};

use crate::error::{DiffusionError, Result};

/// Dynamic-rank float tensor, usually shaped `[batch, channels, height, width]`.
pub type Tensor = ArrayD<f32>;

/// Computes `Σ weights[i] * tensors[i]` elementwise.
///
/// The result is accumulated into a single buffer with fused `scaled_add`
/// calls so no intermediate tensors are allocated.
///
/// # Panics
///
/// Panics if `weights` and `tensors` differ in length, if the list is empty,
/// or if the tensors do not share a shape.
pub fn weighted_sum(weights: &[f64], tensors: &[&Tensor]) -> Tensor {
    assert_eq!(
        weights.len(),
        tensors.len(),
        "weighted_sum needs one weight per tensor"
    );
    assert!(!tensors.is_empty(), "weighted_sum needs at least one tensor");

    let shape = tensors[0].shape();
    let mut result = Tensor::zeros(tensors[0].raw_dim());
    for (weight, tensor) in weights.iter().zip(tensors) {
        assert_eq!(tensor.shape(), shape, "weighted_sum shape mismatch");
        result.scaled_add(*weight as f32, *tensor);
    }
    result
}

/// Concatenates tensors along the batch axis (axis 0).
pub fn concat_batch(tensors: &[&Tensor]) -> Result<Tensor> {
    let views: Vec<_> = tensors.iter().map(|t| t.view()).collect();
    concatenate(Axis(0), &views).map_err(|e| {
        DiffusionError::invalid_configuration(format!(
            "Failed to concatenate tensors along batch axis: {}",
            e
        ))
    })
}

/// Returns an owned copy of `tensor[start..end]` along the batch axis.
pub fn batch_slice(tensor: &Tensor, start: usize, end: usize) -> Result<Tensor> {
    let batch = tensor.shape().first().copied().unwrap_or(0);
    if start >= end || end > batch {
        return Err(DiffusionError::invalid_configuration(format!(
            "Batch slice {}..{} out of range for batch size {}",
            start, end, batch
        )));
    }
    Ok(tensor
        .slice_axis(Axis(0), Slice::from(start..end))
        .to_owned())
}

/// Splits a tensor with an even batch size into its two halves.
///
/// For classifier-free guidance batches the first half is the unconditional
/// input and the second half the conditional one.
pub fn split_batch(tensor: &Tensor) -> Result<(Tensor, Tensor)> {
    let batch = tensor.shape().first().copied().unwrap_or(0);
    if batch == 0 || batch % 2 != 0 {
        return Err(DiffusionError::invalid_configuration(format!(
            "Cannot split tensor of shape {:?} into two equal batches",
            tensor.shape()
        )));
    }
    let half = batch / 2;
    Ok((batch_slice(tensor, 0, half)?, batch_slice(tensor, half, batch)?))
}

/// Builds a tensor filled with `value` in the given shape.
pub fn filled(shape: &[usize], value: f32) -> Tensor {
    Tensor::from_elem(shape, value)
}
