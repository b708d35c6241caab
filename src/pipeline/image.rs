//! Conversions between `image` buffers and planar tensors.

use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use ndarray::Array4;

use crate::error::{DiffusionError, Result};
use crate::tensor::Tensor;

/// Converts an image to a planar `[1, 3, height, width]` tensor with pixel
/// values mapped linearly onto `[min_value, max_value]`.
///
/// The image is resized to `width`×`height` when it does not already match.
pub fn planar_rgb(
    image: &DynamicImage,
    width: u32,
    height: u32,
    min_value: f32,
    max_value: f32,
) -> Tensor {
    let rgb = if image.width() == width && image.height() == height {
        image.to_rgb8()
    } else {
        tracing::debug!(
            from_width = image.width(),
            from_height = image.height(),
            width,
            height,
            "resizing input image"
        );
        image.resize_exact(width, height, FilterType::Lanczos3).to_rgb8()
    };

    let range = max_value - min_value;
    Array4::from_shape_fn(
        (1, 3, height as usize, width as usize),
        |(_, c, y, x)| {
            let value = rgb.get_pixel(x as u32, y as u32)[c] as f32 / 255.0;
            min_value + value * range
        },
    )
    .into_dyn()
}

/// Converts a decoder output in `[-1, 1]`, shaped `[1, 3, h, w]` or
/// `[3, h, w]`, into an 8-bit RGB image.
pub fn to_rgb_image(tensor: &Tensor) -> Result<RgbImage> {
    let shape = tensor.shape();
    let (channels, height, width) = match *shape {
        [1, c, h, w] | [c, h, w] => (c, h, w),
        _ => {
            return Err(DiffusionError::invalid_configuration(format!(
                "decoded image must be [1, 3, h, w], got {:?}",
                shape
            )))
        }
    };
    if channels != 3 {
        return Err(DiffusionError::invalid_configuration(format!(
            "decoded image must have 3 channels, got {}",
            channels
        )));
    }

    let planar = tensor
        .view()
        .into_shape_with_order((3, height, width))
        .map_err(|e| DiffusionError::invalid_configuration(e.to_string()))?;

    Ok(RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let pixel = |c: usize| {
            let value = (planar[[c, y as usize, x as usize]] / 2.0 + 0.5).clamp(0.0, 1.0);
            (value * 255.0).round() as u8
        };
        image::Rgb([pixel(0), pixel(1), pixel(2)])
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    #[test]
    fn planar_rgb_maps_range() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 2, image::Rgb([255, 0, 51])));
        let tensor = planar_rgb(&image, 4, 2, -1.0, 1.0);
        assert_eq!(tensor.shape(), &[1, 3, 2, 4]);
        assert_eq!(tensor[[0, 0, 1, 3]], 1.0);
        assert_eq!(tensor[[0, 1, 0, 0]], -1.0);
        assert!((tensor[[0, 2, 0, 0]] - -0.6).abs() < 1e-6);
    }

    #[test]
    fn planar_rgb_resizes_to_target() {
        let image = DynamicImage::new_rgb8(16, 16);
        let tensor = planar_rgb(&image, 8, 4, 0.0, 1.0);
        assert_eq!(tensor.shape(), &[1, 3, 4, 8]);
    }

    #[test]
    fn decoder_output_is_clipped_and_packed() {
        // Channel planes for a 2x1 image: R, G, B.
        let data = vec![
            -1.0, 1.0, // R
            0.0, 3.0, // G
            -7.0, 0.5, // B
        ];
        let tensor = Tensor::from_shape_vec(IxDyn(&[1, 3, 1, 2]), data).unwrap();
        let image = to_rgb_image(&tensor).unwrap();
        assert_eq!(image.dimensions(), (2, 1));
        assert_eq!(image.get_pixel(0, 0).0, [0, 128, 0]);
        assert_eq!(image.get_pixel(1, 0).0, [255, 255, 191]);
    }

    #[test]
    fn rejects_non_rgb_output() {
        let tensor = Tensor::zeros(IxDyn(&[1, 4, 2, 2]));
        assert!(to_rgb_image(&tensor).is_err());
        let tensor = Tensor::zeros(IxDyn(&[2, 2]));
        assert!(to_rgb_image(&tensor).is_err());
    }
}
