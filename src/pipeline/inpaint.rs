//! Inpainting with the 9-channel Stable Diffusion inpainting `UNet`.

use ::image::{imageops::FilterType, GrayImage, RgbImage};
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{concatenate, Array4, Axis};

use crate::error::{Error, Result};
use crate::image::{check_dimensions, image_to_tensor, mask_to_tensor};

use super::diffedit::Config;
use super::mask::sample_noise;
use super::scheduler::LmsScheduler;
use super::text::PromptEncoder;
use super::unet::NoisePredictor;
use super::vae::{decode_latent, LatentCodec, LatentTensor, LATENT_CHANNELS, VAE_SCALE_FACTOR};

/// Regenerates the masked region of an image under a prompt.
pub struct Inpainter<'a> {
    codec: &'a mut dyn LatentCodec,
    encoder: &'a mut dyn PromptEncoder,
    unet: &'a mut dyn NoisePredictor,
    config: &'a Config,
}

impl<'a> Inpainter<'a> {
    /// Borrow the collaborators for one or more inpaintings.
    pub fn new(
        codec: &'a mut dyn LatentCodec,
        encoder: &'a mut dyn PromptEncoder,
        unet: &'a mut dyn NoisePredictor,
        config: &'a Config,
    ) -> Self {
        Self {
            codec,
            encoder,
            unet,
            config,
        }
    }

    /// Inpaint the foreground of `mask` in `image`, conditioned on `prompt`.
    ///
    /// Pixels outside the mask are returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DimensionMismatch`] if the image or mask is not at the
    /// working resolution, or any inference error.
    #[allow(clippy::cast_possible_truncation)]
    pub fn inpaint(
        &mut self,
        image: &RgbImage,
        mask: &GrayImage,
        prompt: &str,
        seed: u64,
    ) -> Result<RgbImage> {
        let size = self.config.image_size;
        check_dimensions("image", image.dimensions(), size)?;
        check_dimensions("mask", mask.dimensions(), size)?;

        let text = self.encoder.embed(prompt)?;
        let uncond = self.encoder.embed("")?;

        // Masked-out image: edit region set to 0 in [-1, 1] space
        let image_tensor = image_to_tensor(image);
        let mask_tensor = mask_to_tensor(mask);
        let masked_image = &image_tensor * &mask_tensor.mapv(|m| 1.0 - m);
        let masked_latent = self.codec.encode(&masked_image)?;

        let latent_size = size / VAE_SCALE_FACTOR;
        let latent_mask = mask_to_tensor(&::image::imageops::resize(
            mask,
            latent_size,
            latent_size,
            FilterType::Nearest,
        ));

        let mut scheduler = LmsScheduler::new(self.config.inpaint_steps, &self.config.scheduler)?;
        let timesteps = scheduler.timesteps().to_vec();

        let shape = (1, LATENT_CHANNELS, latent_size as usize, latent_size as usize);
        let mut latents = sample_noise(shape, seed) * scheduler.init_noise_sigma() as f32;

        let pb = self.progress_bar(timesteps.len());
        for (index, &timestep) in timesteps.iter().enumerate() {
            let scaled = scheduler.scale_model_input(&latents, index);
            let model_input = stack_inputs(&scaled, &latent_mask, &masked_latent)?;

            let noise_uncond = self.unet.predict_noise(&model_input, timestep, &uncond)?;
            let noise_text = self.unet.predict_noise(&model_input, timestep, &text)?;
            let noise_pred = guide(&noise_uncond, &noise_text, self.config.guidance_scale);

            latents = scheduler.step(&noise_pred, index, &latents);
            pb.inc(1);
        }
        pb.finish_and_clear();

        let generated = decode_latent(&mut *self.codec, &latents)?;
        compose(image, &generated, mask)
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.config.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} Inpainting [{bar:40.cyan/blue}] {pos}/{len}")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb
    }
}

/// Concatenate latents, mask and masked-image latents along channels (4 + 1 + 4).
fn stack_inputs(
    latents: &LatentTensor,
    mask: &Array4<f32>,
    masked_latent: &LatentTensor,
) -> Result<LatentTensor> {
    concatenate(Axis(1), &[latents.view(), mask.view(), masked_latent.view()]).map_err(|_| {
        Error::ShapeMismatch {
            expected: format!("latent spatial shape {:?}", &latents.shape()[2..]),
            actual: format!(
                "mask {:?}, masked image {:?}",
                &mask.shape()[2..],
                &masked_latent.shape()[2..]
            ),
        }
    })
}

/// Classifier-free guidance.
fn guide(uncond: &LatentTensor, text: &LatentTensor, scale: f32) -> LatentTensor {
    uncond + &((text - uncond) * scale)
}

/// Take `generated` inside the mask and `original` everywhere else.
///
/// # Errors
///
/// Returns [`Error::DimensionMismatch`] if the three images differ in size.
pub fn compose(original: &RgbImage, generated: &RgbImage, mask: &GrayImage) -> Result<RgbImage> {
    let size = original.dimensions();
    for (what, dims) in [("generated image", generated.dimensions()), ("mask", mask.dimensions())] {
        if dims != size {
            return Err(Error::DimensionMismatch {
                what,
                expected_width: size.0,
                expected_height: size.1,
                width: dims.0,
                height: dims.1,
            });
        }
    }

    Ok(RgbImage::from_fn(size.0, size.1, |x, y| {
        if mask.get_pixel(x, y)[0] >= 128 {
            *generated.get_pixel(x, y)
        } else {
            *original.get_pixel(x, y)
        }
    }))
}
