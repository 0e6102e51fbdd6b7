//! Variational Autoencoder operations for encoding/decoding images.

use ::image::RgbImage;
use ndarray::{Array4, Ix4};
use ort::session::Session;
use ort::value::Tensor;

use crate::error::{Error, Result};
use crate::image::{check_dimensions, image_to_tensor, tensor_to_image, ImageTensor};

use super::onnx::{extract_array, missing_output};

/// Latent tensor type (1, 4, 64, 64) for 512x512 images.
pub type LatentTensor = Array4<f32>;

/// VAE scaling factor (from Stable Diffusion).
pub const VAE_SCALE: f32 = 0.18215;

/// Spatial downsampling between pixel and latent space.
pub const VAE_SCALE_FACTOR: u32 = 8;

/// Number of latent channels.
pub const LATENT_CHANNELS: usize = 4;

/// Maps images to and from the autoencoder's latent space.
pub trait LatentCodec {
    /// Encode an NCHW image tensor in [-1, 1] to scaled latents.
    ///
    /// # Errors
    ///
    /// Returns an error if inference fails.
    fn encode(&mut self, image: &ImageTensor) -> Result<LatentTensor>;

    /// Decode scaled latents to an NCHW image tensor in [-1, 1].
    ///
    /// # Errors
    ///
    /// Returns an error if inference fails.
    fn decode(&mut self, latent: &LatentTensor) -> Result<ImageTensor>;
}

/// VAE backed by ONNX encoder and decoder sessions.
pub struct OnnxVae {
    encoder: Session,
    decoder: Session,
}

impl OnnxVae {
    /// Wrap loaded encoder and decoder sessions.
    #[must_use]
    pub const fn new(encoder: Session, decoder: Session) -> Self {
        Self { encoder, decoder }
    }
}

impl LatentCodec for OnnxVae {
    fn encode(&mut self, image: &ImageTensor) -> Result<LatentTensor> {
        let input_value =
            Tensor::from_array(image.clone()).map_err(|source| Error::Inference { source })?;

        let outputs = self
            .encoder
            .run(ort::inputs![input_value])
            .map_err(|source| Error::Inference { source })?;

        let output = outputs
            .values()
            .next()
            .ok_or_else(|| missing_output("latent_sample"))?;
        let latent = extract_array::<Ix4>(&output)?;

        // Scale latents as per SD convention
        Ok(latent * VAE_SCALE)
    }

    fn decode(&mut self, latent: &LatentTensor) -> Result<ImageTensor> {
        let unscaled = latent / VAE_SCALE;

        let input_value =
            Tensor::from_array(unscaled).map_err(|source| Error::Inference { source })?;

        let outputs = self
            .decoder
            .run(ort::inputs![input_value])
            .map_err(|source| Error::Inference { source })?;

        let output = outputs
            .values()
            .next()
            .ok_or_else(|| missing_output("sample"))?;
        extract_array::<Ix4>(&output)
    }
}

/// Encode an image at the working resolution to latents.
///
/// # Errors
///
/// Returns [`Error::DimensionMismatch`] if the image is not `size`x`size`, or
/// an inference error.
pub fn encode_image(codec: &mut dyn LatentCodec, image: &RgbImage, size: u32) -> Result<LatentTensor> {
    check_dimensions("image", image.dimensions(), size)?;
    codec.encode(&image_to_tensor(image))
}

/// Decode latents to an RGB image.
///
/// # Errors
///
/// Returns an error if inference fails or the decoder output is not an RGB tensor.
pub fn decode_latent(codec: &mut dyn LatentCodec, latent: &LatentTensor) -> Result<RgbImage> {
    tensor_to_image(&codec.decode(latent)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::MockCodec;
    use ::image::Rgb;

    #[test]
    fn test_encode_latent_shape() {
        let image = RgbImage::new(64, 64);
        let latent = encode_image(&mut MockCodec, &image, 64).unwrap();
        assert_eq!(latent.shape(), &[1, LATENT_CHANNELS, 8, 8]);
    }

    #[test]
    fn test_encode_rejects_wrong_size() {
        let image = RgbImage::new(64, 32);
        let err = encode_image(&mut MockCodec, &image, 64).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { .. }));
    }

    #[test]
    fn test_round_trip_within_tolerance() {
        let image = RgbImage::from_fn(64, 64, |x, y| {
            Rgb([(x * 4) as u8, (y * 4) as u8, ((x + y) * 2) as u8])
        });
        let latent = encode_image(&mut MockCodec, &image, 64).unwrap();
        let decoded = decode_latent(&mut MockCodec, &latent).unwrap();

        let total: u64 = image
            .pixels()
            .zip(decoded.pixels())
            .flat_map(|(a, b)| a.0.iter().zip(b.0).map(|(&x, y)| u64::from(x.abs_diff(y))))
            .sum();
        #[allow(clippy::cast_precision_loss)]
        let mean_error = total as f64 / (64.0 * 64.0 * 3.0);
        assert!(mean_error < 16.0, "mean error {mean_error}");
    }
}
