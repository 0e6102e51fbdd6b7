//! Lightweight stand-ins for the neural networks, for tests.

use ndarray::{s, Array3, Array4, Axis};

use crate::error::{Error, Result};
use crate::image::ImageTensor;

use super::text::{Embedding, PromptEncoder, MAX_TOKENS};
use super::unet::NoisePredictor;
use super::vae::{LatentCodec, LatentTensor, LATENT_CHANNELS, VAE_SCALE_FACTOR};

const FACTOR: usize = VAE_SCALE_FACTOR as usize;

/// Block-average encoder / nearest-neighbour decoder.
pub(crate) struct MockCodec;

impl LatentCodec for MockCodec {
    fn encode(&mut self, image: &ImageTensor) -> Result<LatentTensor> {
        let (_, channels, height, width) = image.dim();
        let (h, w) = (height / FACTOR, width / FACTOR);
        let mut latent = Array4::<f32>::zeros((1, LATENT_CHANNELS, h, w));

        for c in 0..channels.min(3) {
            for y in 0..h {
                for x in 0..w {
                    let block = image.slice(s![
                        0,
                        c,
                        y * FACTOR..(y + 1) * FACTOR,
                        x * FACTOR..(x + 1) * FACTOR
                    ]);
                    latent[[0, c, y, x]] = block.mean().unwrap_or(0.0);
                }
            }
        }
        let luma = latent.slice(s![.., 0..3, .., ..]).mean_axis(Axis(1));
        if let Some(luma) = luma {
            latent.slice_mut(s![.., 3, .., ..]).assign(&luma);
        }
        Ok(latent)
    }

    fn decode(&mut self, latent: &LatentTensor) -> Result<ImageTensor> {
        let (_, _, h, w) = latent.dim();
        Ok(Array4::from_shape_fn((1, 3, h * FACTOR, w * FACTOR), |(_, c, y, x)| {
            latent[[0, c, y / FACTOR, x / FACTOR]]
        }))
    }
}

/// Embeds a prompt as a constant derived from its bytes.
pub(crate) struct MockPromptEncoder;

impl MockPromptEncoder {
    pub(crate) fn code(prompt: &str) -> f32 {
        let sum: u32 = prompt.bytes().map(u32::from).sum();
        #[allow(clippy::cast_precision_loss)]
        let code = (sum % 97) as f32 / 97.0;
        code
    }
}

impl PromptEncoder for MockPromptEncoder {
    fn embed(&mut self, prompt: &str) -> Result<Embedding> {
        Ok(Array3::from_elem((1, MAX_TOKENS, 8), Self::code(prompt)))
    }
}

/// Predicts noise that depends on the prompt only in the left half of the latent.
pub(crate) struct MockUnet {
    pub(crate) calls: usize,
}

impl MockUnet {
    pub(crate) const fn new() -> Self {
        Self { calls: 0 }
    }
}

impl NoisePredictor for MockUnet {
    #[allow(clippy::cast_possible_truncation)]
    fn predict_noise(
        &mut self,
        sample: &LatentTensor,
        timestep: f64,
        embedding: &Embedding,
    ) -> Result<LatentTensor> {
        self.calls += 1;
        let (_, channels, h, w) = sample.dim();
        if channels < LATENT_CHANNELS {
            return Err(Error::ShapeMismatch {
                expected: "at least 4 channels".to_string(),
                actual: format!("{channels}"),
            });
        }

        let prompt = embedding[[0, 0, 0]];
        let t = (timestep / 1000.0) as f32;
        Ok(Array4::from_shape_fn((1, LATENT_CHANNELS, h, w), |(_, c, y, x)| {
            let region = if x < w / 2 { 1.0 } else { 0.0 };
            0.1f32.mul_add(sample[[0, c, y, x]], region * prompt * (1.0 + t))
        }))
    }
}
