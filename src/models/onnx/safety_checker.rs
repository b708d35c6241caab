//! CLIP-based safety checker.

use std::path::Path;

use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;

use crate::config::EngineConfig;
use crate::error::{DiffusionError, ModelKind, Result};
use crate::models::SafetyChecker;
use crate::tensor::Tensor;

use super::{load_session, to_input};

/// Input resolution of the CLIP vision tower.
const CLIP_IMAGE_SIZE: u32 = 224;

const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

/// Flags decoded images containing unsafe content.
pub struct OnnxSafetyChecker {
    session: Session,
}

impl std::fmt::Debug for OnnxSafetyChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxSafetyChecker").finish_non_exhaustive()
    }
}

impl OnnxSafetyChecker {
    /// Loads `safety_checker.onnx`.
    pub fn load(path: &Path, engine: &EngineConfig) -> Result<Self> {
        Ok(Self {
            session: load_session(path, engine)?,
        })
    }
}

/// Resizes to 224×224 and applies CLIP normalization, `[1, 3, 224, 224]`.
pub fn clip_input(image: &RgbImage) -> Tensor {
    let resized = image::imageops::resize(image, CLIP_IMAGE_SIZE, CLIP_IMAGE_SIZE, FilterType::CatmullRom);
    let size = CLIP_IMAGE_SIZE as usize;
    Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
        let value = resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0;
        (value - CLIP_MEAN[c]) / CLIP_STD[c]
    })
    .into_dyn()
}

/// Interleaved `[1, height, width, 3]` pixels in `[0, 1]`.
fn image_input(image: &RgbImage) -> Tensor {
    let (width, height) = image.dimensions();
    Array4::from_shape_fn((1, height as usize, width as usize, 3), |(_, y, x, c)| {
        image.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
    })
    .into_dyn()
}

impl SafetyChecker for OnnxSafetyChecker {
    fn is_safe(&mut self, image: &RgbImage) -> Result<bool> {
        let kind = ModelKind::SafetyChecker;
        let clip = to_input(&clip_input(image), kind)?;
        let images = to_input(&image_input(image), kind)?;

        let mut outputs = self
            .session
            .run(ort::inputs!["clip_input" => clip, "images" => images])
            .map_err(|e| DiffusionError::model_execution_failed(kind, e.to_string()))?;

        let flags = outputs.remove("has_nsfw_concepts").ok_or_else(|| {
            DiffusionError::model_execution_failed(kind, "has_nsfw_concepts not found in output")
        })?;
        let (_shape, data) = flags
            .try_extract_tensor::<bool>()
            .map_err(|e| DiffusionError::model_execution_failed(kind, e.to_string()))?;

        Ok(!data.iter().any(|&unsafe_content| unsafe_content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_input_is_normalized() {
        let image = RgbImage::from_pixel(64, 32, image::Rgb([255, 0, 128]));
        let tensor = clip_input(&image);
        assert_eq!(tensor.shape(), &[1, 3, 224, 224]);

        let red = tensor[[0, 0, 100, 100]];
        let green = tensor[[0, 1, 100, 100]];
        assert!((red - (1.0 - CLIP_MEAN[0]) / CLIP_STD[0]).abs() < 1e-5);
        assert!((green - (0.0 - CLIP_MEAN[1]) / CLIP_STD[1]).abs() < 1e-5);
    }

    #[test]
    fn image_input_keeps_resolution() {
        let image = RgbImage::from_pixel(8, 4, image::Rgb([0, 255, 0]));
        let tensor = image_input(&image);
        assert_eq!(tensor.shape(), &[1, 4, 8, 3]);
        assert_eq!(tensor[[0, 3, 7, 1]], 1.0);
    }
}
