//! The DiffEdit session: mask creation, persistence, and inpainting.

use std::path::{Path, PathBuf};

use ::image::RgbImage;

use crate::error::{Error, Result};
use crate::image::{self, MaskSet, SD_IMAGE_SIZE};
use crate::model::{ModelCache, ModelType};

use super::inpaint::Inpainter;
use super::mask::{combine_divergence, masks_from_divergence, MaskGenerator};
use super::scheduler::SchedulerConfig;
use super::text::{ClipTextEncoder, PromptEncoder};
use super::unet::{NoisePredictor, OnnxUnet};
use super::vae::{encode_image, LatentCodec, OnnxVae, VAE_SCALE_FACTOR};

/// Seed used when the caller does not pick one.
pub const DEFAULT_SEED: u64 = 42;

/// Number of noise draws averaged into a mask by default.
pub const DEFAULT_ITERATIONS: usize = 10;

/// Which part of the workflow a session is built for.
///
/// Only the `UNet`s a stage needs are loaded and required by the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Stage {
    /// Mask creation only.
    Mask,
    /// Inpainting with a previously saved mask.
    Inpaint,
    /// Both, as [`DiffEdit::demo`] needs.
    #[default]
    Full,
}

impl Stage {
    /// Whether this stage computes masks.
    #[must_use]
    pub const fn creates_masks(self) -> bool {
        matches!(self, Self::Mask | Self::Full)
    }

    /// Whether this stage inpaints.
    #[must_use]
    pub const fn inpaints(self) -> bool {
        matches!(self, Self::Inpaint | Self::Full)
    }
}

/// Configuration for the DiffEdit pipeline.
#[derive(Debug, Clone)]
pub struct Config {
    /// Square working resolution every image is resized to.
    pub image_size: u32,

    /// Length of the noise schedule used for mask trajectories.
    pub num_steps: usize,

    /// Fraction of the schedule each mask trajectory runs (0.0-1.0].
    pub strength: f64,

    /// Cutoff on the normalized divergence for the rough mask (0.0-1.0).
    /// Pixels strictly above it are foreground.
    pub mask_threshold: f32,

    /// Radius of the morphological opening/closing that cleans the rough mask.
    pub mask_smoothing: u8,

    /// Opacity of the mask overlay in the blended visualisation (0.0-1.0).
    pub blend_alpha: f32,

    /// Number of inpainting denoising steps.
    pub inpaint_steps: usize,

    /// Classifier-free guidance scale for inpainting.
    pub guidance_scale: f32,

    /// Noise schedule shared by both samplers.
    pub scheduler: SchedulerConfig,

    /// Draw progress bars for long loops.
    pub show_progress: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            image_size: SD_IMAGE_SIZE,
            num_steps: 20,
            strength: 0.5,
            mask_threshold: 0.5,
            mask_smoothing: 4,
            blend_alpha: image::BLEND_ALPHA,
            inpaint_steps: 30,
            guidance_scale: 7.5,
            scheduler: SchedulerConfig::default(),
            show_progress: true,
        }
    }
}

impl Config {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any parameter is out of valid range.
    pub fn validate(&self) -> Result<()> {
        if self.image_size == 0 || self.image_size % VAE_SCALE_FACTOR != 0 {
            return Err(Error::invalid(
                "image_size",
                format!("must be a positive multiple of {VAE_SCALE_FACTOR}"),
            ));
        }

        for (name, steps) in [("num_steps", self.num_steps), ("inpaint_steps", self.inpaint_steps)] {
            if steps == 0 || steps > self.scheduler.num_train_steps {
                return Err(Error::invalid(
                    name,
                    format!("must be between 1 and {}", self.scheduler.num_train_steps),
                ));
            }
        }

        if !(self.strength > 0.0 && self.strength <= 1.0) {
            return Err(Error::invalid("strength", "must be in (0.0, 1.0]"));
        }

        if !(0.0..=1.0).contains(&self.mask_threshold) {
            return Err(Error::invalid("mask_threshold", "must be between 0.0 and 1.0"));
        }

        if !(0.0..=1.0).contains(&self.blend_alpha) {
            return Err(Error::invalid("blend_alpha", "must be between 0.0 and 1.0"));
        }

        if !self.guidance_scale.is_finite() || self.guidance_scale < 0.0 {
            return Err(Error::invalid("guidance_scale", "must be a non-negative number"));
        }

        Ok(())
    }

    /// Index of the first denoising step of a mask trajectory.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn start_step(&self) -> usize {
        let noised = (self.num_steps as f64 * self.strength).round() as usize;
        self.num_steps - noised.clamp(1, self.num_steps)
    }
}

/// Images returned by [`DiffEdit::demo`].
#[derive(Debug, Clone)]
pub struct DemoOutput {
    /// Source image at the working resolution.
    pub original: RgbImage,
    /// Source image with the mask overlaid.
    pub blended: RgbImage,
    /// Final edited image.
    pub inpainted: RgbImage,
}

/// A DiffEdit session over a set of loaded models.
///
/// Built with [`DiffEdit::builder`] or [`DiffEdit::from_pretrained`]. All
/// randomness comes from the seeds passed to each call.
pub struct DiffEdit {
    config: Config,
    codec: Box<dyn LatentCodec>,
    encoder: Box<dyn PromptEncoder>,
    unet: Option<Box<dyn NoisePredictor>>,
    inpaint_unet: Option<Box<dyn NoisePredictor>>,
}

impl DiffEdit {
    /// Start assembling a session.
    #[must_use]
    pub fn builder() -> DiffEditBuilder {
        DiffEditBuilder::default()
    }

    /// Load the models `stage` needs from `cache`, downloading what is missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or any model cannot be loaded.
    pub fn from_pretrained(config: Config, cache: &ModelCache, stage: Stage) -> Result<Self> {
        config.validate()?;

        tracing::info!("Initializing DiffEdit on {} with config: {config:?}", cache.device());

        tracing::info!("Loading VAE...");
        let vae = OnnxVae::new(
            cache.load_session(ModelType::VaeEncoder)?,
            cache.load_session(ModelType::VaeDecoder)?,
        );

        tracing::info!("Loading text encoder...");
        let tokenizer_path = cache.get_model_path(ModelType::Tokenizer)?;
        let encoder =
            ClipTextEncoder::from_file(tokenizer_path, cache.load_session(ModelType::TextEncoder)?)?;

        let mut builder = Self::builder()
            .stage(stage)
            .config(config)
            .codec(vae)
            .prompt_encoder(encoder);

        if stage.creates_masks() {
            tracing::info!("Loading `UNet`...");
            builder = builder.unet(OnnxUnet::new(cache.load_session(ModelType::Unet)?));
        }

        if stage.inpaints() {
            tracing::info!("Loading inpainting `UNet`...");
            builder = builder.inpaint_unet(OnnxUnet::new(cache.load_session(ModelType::InpaintUnet)?));
        }

        let session = builder.build()?;

        tracing::info!("DiffEdit initialized successfully");
        Ok(session)
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Compute the mask for the region of `im_path` described by `prompt_remove`.
    ///
    /// Returns the processed mask, the rough mask and the blended visualisation.
    /// Nothing is written to disk.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingComponent`] if the session has no mask `UNet`,
    /// [`Error::PathNotFound`] if the image does not exist, or any loading or
    /// inference error.
    pub fn create_mask<P: AsRef<Path>>(
        &mut self,
        im_path: P,
        prompt_remove: &str,
        prompt_add: &str,
        iterations: usize,
        seed: u64,
    ) -> Result<MaskSet> {
        let unet = self.unet.as_deref_mut().ok_or(Error::MissingComponent("unet"))?;
        let im = image::load_image(im_path, self.config.image_size)?;

        tracing::info!("Obtaining the mask by running the diffusion process {iterations} times");
        let latent = encode_image(self.codec.as_mut(), &im, self.config.image_size)?;

        let (mask, rough_mask) = MaskGenerator::new(self.encoder.as_mut(), unet, &self.config)
            .generate(&latent, prompt_remove, prompt_add, iterations, seed)?;

        let blended = image::blend(&im, &mask, self.config.blend_alpha)?;
        Ok(MaskSet {
            mask,
            rough_mask,
            blended,
        })
    }

    /// Compute one mask from several prompt pairs sharing `prompt_remove`.
    ///
    /// This is one merging policy among several possible ones (union or
    /// intersection of masks, weighted blends). It sums the divergence maps
    /// of all pairs, each computed with the same seed, and thresholds the sum
    /// once. Other policies can be built from [`MaskGenerator::divergence`],
    /// [`combine_divergence`] and [`masks_from_divergence`] directly.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingComponent`] if the session has no mask `UNet`,
    /// [`Error::InvalidParameter`] if `prompts_add` is empty,
    /// [`Error::PathNotFound`] if the image does not exist, or any inference error.
    pub fn refine_mask<P: AsRef<Path>>(
        &mut self,
        im_path: P,
        prompt_remove: &str,
        prompts_add: &[&str],
        iterations: usize,
        seed: u64,
    ) -> Result<MaskSet> {
        if prompts_add.is_empty() {
            return Err(Error::invalid("prompts_add", "at least one prompt is required"));
        }

        let unet = self.unet.as_deref_mut().ok_or(Error::MissingComponent("unet"))?;
        let im = image::load_image(im_path, self.config.image_size)?;
        let latent = encode_image(self.codec.as_mut(), &im, self.config.image_size)?;

        let mut generator = MaskGenerator::new(self.encoder.as_mut(), unet, &self.config);
        let maps = prompts_add
            .iter()
            .map(|prompt_add| {
                tracing::info!("Divergence for \"{prompt_remove}\" -> \"{prompt_add}\"");
                generator.divergence(&latent, prompt_remove, prompt_add, iterations, seed)
            })
            .collect::<Result<Vec<_>>>()?;

        let (mask, rough_mask) = masks_from_divergence(&combine_divergence(&maps)?, &self.config);
        let blended = image::blend(&im, &mask, self.config.blend_alpha)?;
        Ok(MaskSet {
            mask,
            rough_mask,
            blended,
        })
    }

    /// Persist a mask set and the resized source image into `workdir`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PathNotFound`] if the image does not exist, or a write error.
    pub fn save_mask<P: AsRef<Path>, Q: AsRef<Path>>(
        &self,
        masks: &MaskSet,
        im_path: P,
        workdir: Q,
    ) -> Result<()> {
        let original = image::load_image(im_path, self.config.image_size)?;
        image::save_mask_set(masks, &original, workdir)
    }

    /// Load a mask set written by [`DiffEdit::save_mask`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::ArtifactsNotFound`] if the set is incomplete.
    pub fn load_mask<P: AsRef<Path>>(&self, workdir: P) -> Result<MaskSet> {
        image::load_mask_set(workdir)
    }

    /// Regenerate the masked region of `im_path` under `prompt_add`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingComponent`] if the session has no inpainting
    /// `UNet`, [`Error::PathNotFound`] if the image does not exist,
    /// [`Error::DimensionMismatch`] for a mask of the wrong size, or any
    /// inference error.
    pub fn inpaint_mask_with_prompt<P: AsRef<Path>>(
        &mut self,
        im_path: P,
        mask: &::image::GrayImage,
        prompt_add: &str,
        seed: u64,
    ) -> Result<RgbImage> {
        let unet = self
            .inpaint_unet
            .as_deref_mut()
            .ok_or(Error::MissingComponent("inpainting unet"))?;
        let im = image::load_image(im_path, self.config.image_size)?;

        tracing::info!("Inpainting the image using the mask");
        Inpainter::new(self.codec.as_mut(), self.encoder.as_mut(), unet, &self.config)
        .inpaint(&im, mask, prompt_add, seed)
    }

    /// Write the inpainting result into `workdir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save_inpainted_image<P: AsRef<Path>>(&self, inpainted: &RgbImage, workdir: P) -> Result<PathBuf> {
        image::save_inpainted_image(inpainted, workdir)
    }

    /// Run the full workflow: create, save and reload the mask, then inpaint
    /// with the reloaded mask and save the result.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingComponent`] or [`Error::PathNotFound`] before
    /// touching `workdir` if either `UNet` is absent or the image does not
    /// exist, or the first error of any stage.
    pub fn demo<P: AsRef<Path>, Q: AsRef<Path>>(
        &mut self,
        im_path: P,
        prompt_remove: &str,
        prompt_add: &str,
        iterations: usize,
        seed: u64,
        workdir: Q,
    ) -> Result<DemoOutput> {
        let im_path = im_path.as_ref();
        let workdir = workdir.as_ref();

        if self.unet.is_none() {
            return Err(Error::MissingComponent("unet"));
        }
        if self.inpaint_unet.is_none() {
            return Err(Error::MissingComponent("inpainting unet"));
        }

        let original = image::load_image(im_path, self.config.image_size)?;

        let masks = self.create_mask(im_path, prompt_remove, prompt_add, iterations, seed)?;
        self.save_mask(&masks, im_path, workdir)?;

        let reloaded = self.load_mask(workdir)?;
        let inpainted = self.inpaint_mask_with_prompt(im_path, &reloaded.mask, prompt_add, seed)?;
        let path = self.save_inpainted_image(&inpainted, workdir)?;
        tracing::info!("Saved inpainted image to {}", path.display());

        Ok(DemoOutput {
            original,
            blended: reloaded.blended,
            inpainted,
        })
    }
}

/// Collects the collaborators of a [`DiffEdit`] session.
#[derive(Default)]
pub struct DiffEditBuilder {
    stage: Stage,
    config: Option<Config>,
    codec: Option<Box<dyn LatentCodec>>,
    encoder: Option<Box<dyn PromptEncoder>>,
    unet: Option<Box<dyn NoisePredictor>>,
    inpaint_unet: Option<Box<dyn NoisePredictor>>,
}

impl DiffEditBuilder {
    /// Require only the `UNet`s `stage` needs. Defaults to [`Stage::Full`].
    #[must_use]
    pub const fn stage(mut self, stage: Stage) -> Self {
        self.stage = stage;
        self
    }

    /// Use `config` instead of [`Config::default`].
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Autoencoder mapping images to latents.
    #[must_use]
    pub fn codec(mut self, codec: impl LatentCodec + 'static) -> Self {
        self.codec = Some(Box::new(codec));
        self
    }

    /// Prompt encoder used by both the mask generator and the inpainter.
    #[must_use]
    pub fn prompt_encoder(mut self, encoder: impl PromptEncoder + 'static) -> Self {
        self.encoder = Some(Box::new(encoder));
        self
    }

    /// 4-channel `UNet` for mask generation.
    #[must_use]
    pub fn unet(mut self, unet: impl NoisePredictor + 'static) -> Self {
        self.unet = Some(Box::new(unet));
        self
    }

    /// 9-channel inpainting `UNet`.
    #[must_use]
    pub fn inpaint_unet(mut self, unet: impl NoisePredictor + 'static) -> Self {
        self.inpaint_unet = Some(Box::new(unet));
        self
    }

    /// Validate and assemble the session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingComponent`] if a collaborator the stage needs
    /// was not provided, or [`Error::InvalidParameter`] if the configuration
    /// is invalid.
    pub fn build(self) -> Result<DiffEdit> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let codec = self.codec.ok_or(Error::MissingComponent("codec"))?;
        let encoder = self.encoder.ok_or(Error::MissingComponent("prompt encoder"))?;

        if self.stage.creates_masks() && self.unet.is_none() {
            return Err(Error::MissingComponent("unet"));
        }
        if self.stage.inpaints() && self.inpaint_unet.is_none() {
            return Err(Error::MissingComponent("inpainting unet"));
        }

        Ok(DiffEdit {
            config,
            codec,
            encoder,
            unet: self.unet,
            inpaint_unet: self.inpaint_unet,
        })
    }
}
