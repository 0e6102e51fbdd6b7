//! Image saving utilities.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb, RgbImage};
use tempfile::NamedTempFile;

use crate::error::{Error, Result};

use super::{ImageTensor, RGB_CHANNELS};

/// Save an image as a bitmap, atomically.
///
/// The image is written to a temporary file in the destination directory and
/// renamed over `path`, so a crash never leaves a truncated file behind.
///
/// # Errors
///
/// Returns an error if the image cannot be encoded or the file cannot be written.
pub fn save_bmp<P: AsRef<Path>>(img: &DynamicImage, path: P) -> Result<()> {
    let path = path.as_ref();
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let temp = NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(temp.as_file());
        img.write_to(&mut writer, ImageFormat::Bmp)
            .map_err(|source| Error::ImageSave {
                path: path.to_path_buf(),
                source,
            })?;
        writer.flush()?;
    }

    temp.persist(path).map_err(|err| Error::Io(err.error))?;
    Ok(())
}

/// Convert a normalized NCHW tensor to an RGB image.
///
/// # Errors
///
/// Returns [`Error::ShapeMismatch`] if the tensor is not (1, 3, H, W).
#[allow(clippy::cast_possible_truncation)]
pub fn tensor_to_image(tensor: &ImageTensor) -> Result<RgbImage> {
    let (batch, channels, height, width) = tensor.dim();
    if batch != 1 || channels != RGB_CHANNELS {
        return Err(Error::ShapeMismatch {
            expected: format!("(1, {RGB_CHANNELS}, H, W)"),
            actual: format!("{:?}", tensor.shape()),
        });
    }

    // Safe: tensor dimensions come from an image and fit in u32
    let img = ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        Rgb([
            denormalize(tensor[[0, 0, y, x]]),
            denormalize(tensor[[0, 1, y, x]]),
            denormalize(tensor[[0, 2, y, x]]),
        ])
    });

    Ok(img)
}

/// Denormalize a value from [-1, 1] to [0, 255] with clamping.
#[inline]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn denormalize(value: f32) -> u8 {
    // Safe: clamped to [0, 255] range before casting
    let scaled = (value + 1.0) * 127.5;
    scaled.round().clamp(0.0, 255.0) as u8
}
