//! Image loading utilities.

use std::path::Path;

use image::{imageops::FilterType, GrayImage, RgbImage};
use ndarray::Array4;

use crate::error::{Error, Result};

use super::{ImageTensor, RGB_CHANNELS};

/// Load an image from disk and resize it to the working resolution.
///
/// The image is resized exactly to `size`x`size` (Lanczos3) and converted to RGB.
///
/// # Errors
///
/// Returns [`Error::PathNotFound`] if the path does not exist, or
/// [`Error::ImageLoad`] if the file cannot be decoded.
pub fn load_image<P: AsRef<Path>>(path: P, size: u32) -> Result<RgbImage> {
    let path = path.as_ref();

    if !path.exists() {
        return Err(Error::PathNotFound {
            path: path.to_path_buf(),
        });
    }

    let img = image::open(path).map_err(|source| Error::ImageLoad {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(img.resize_exact(size, size, FilterType::Lanczos3).to_rgb8())
}

/// Fail with [`Error::DimensionMismatch`] unless `(width, height)` is `size`x`size`.
pub fn check_dimensions(what: &'static str, (width, height): (u32, u32), size: u32) -> Result<()> {
    if width == size && height == size {
        return Ok(());
    }
    Err(Error::DimensionMismatch {
        what,
        expected_width: size,
        expected_height: size,
        width,
        height,
    })
}

/// Convert an RGB image to a normalized NCHW tensor (1, 3, H, W) in [-1, 1].
pub fn image_to_tensor(img: &RgbImage) -> ImageTensor {
    let (width, height) = (img.width() as usize, img.height() as usize);
    let mut tensor = Array4::<f32>::zeros((1, RGB_CHANNELS, height, width));

    for (x, y, pixel) in img.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        // Normalize from [0, 255] to [-1, 1]
        tensor[[0, 0, y, x]] = (f32::from(pixel[0]) / 127.5) - 1.0;
        tensor[[0, 1, y, x]] = (f32::from(pixel[1]) / 127.5) - 1.0;
        tensor[[0, 2, y, x]] = (f32::from(pixel[2]) / 127.5) - 1.0;
    }

    tensor
}

/// Convert a mask to a (1, 1, H, W) tensor with 1.0 on the edit region and 0.0 elsewhere.
pub fn mask_to_tensor(mask: &GrayImage) -> Array4<f32> {
    let (width, height) = (mask.width() as usize, mask.height() as usize);
    let mut tensor = Array4::<f32>::zeros((1, 1, height, width));

    for (x, y, pixel) in mask.enumerate_pixels() {
        if pixel[0] >= 128 {
            tensor[[0, 0, y as usize, x as usize]] = 1.0;
        }
    }

    tensor
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, Luma};

    #[test]
    fn test_tensor_shape() {
        let img = RgbImage::new(64, 48);
        let tensor = image_to_tensor(&img);

        assert_eq!(tensor.shape(), &[1, 3, 48, 64]);
    }

    #[test]
    fn test_normalization_range() {
        let img = RgbImage::new(16, 16);
        let tensor = image_to_tensor(&img);

        let min = tensor.iter().copied().fold(f32::INFINITY, f32::min);
        let max = tensor.iter().copied().fold(f32::NEG_INFINITY, f32::max);

        // Black image should be all -1.0
        assert!((min - (-1.0)).abs() < 0.01);
        assert!((max - (-1.0)).abs() < 0.01);
    }

    #[test]
    fn test_load_missing_path() {
        let err = load_image("does/not/exist.png", 64).unwrap_err();
        assert!(matches!(err, Error::PathNotFound { .. }));
    }

    #[test]
    fn test_load_resizes_to_square() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wide.png");
        DynamicImage::new_rgb8(100, 40).save(&path).unwrap();

        let img = load_image(&path, 64).unwrap();
        assert_eq!(img.dimensions(), (64, 64));
    }

    #[test]
    fn test_check_dimensions() {
        assert!(check_dimensions("image", (64, 64), 64).is_ok());
        let err = check_dimensions("mask", (64, 32), 64).unwrap_err();
        assert!(matches!(
            err,
            Error::DimensionMismatch {
                what: "mask",
                width: 64,
                height: 32,
                ..
            }
        ));
    }

    #[test]
    fn test_mask_to_tensor_binary() {
        let mut mask = GrayImage::new(4, 4);
        mask.put_pixel(1, 2, Luma([255]));
        mask.put_pixel(3, 0, Luma([100]));

        let tensor = mask_to_tensor(&mask);
        assert_eq!(tensor.shape(), &[1, 1, 4, 4]);
        assert!((tensor[[0, 0, 2, 1]] - 1.0).abs() < f32::EPSILON);
        assert!(tensor[[0, 0, 0, 3]].abs() < f32::EPSILON);
        assert!((tensor.sum() - 1.0).abs() < f32::EPSILON);
    }
}
