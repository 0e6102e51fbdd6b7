//! DiffEdit mask generation.
//!
//! The latent is noised and denoised twice per iteration, once under each
//! prompt, from the same noise and an identically initialised scheduler.
//! Where the prompts disagree the `UNet` predicts different noise; the mean
//! absolute difference of those predictions, summed over iterations, is the
//! divergence map. Normalising and thresholding it gives the rough mask,
//! morphological opening and closing give the processed mask.

use ::image::{imageops::FilterType, GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::morphology::{close, open};
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{Array2, Axis};
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};

use crate::error::{Error, Result};
use crate::image::MASK_FOREGROUND;

use super::diffedit::Config;
use super::scheduler::LmsScheduler;
use super::text::{Embedding, PromptEncoder};
use super::unet::NoisePredictor;
use super::vae::LatentTensor;

/// Per-latent-pixel divergence between two prompt conditionings, (H, W).
pub type DivergenceMap = Array2<f32>;

/// Runs the two conditioned trajectories and turns their divergence into masks.
pub struct MaskGenerator<'a> {
    encoder: &'a mut dyn PromptEncoder,
    unet: &'a mut dyn NoisePredictor,
    config: &'a Config,
}

impl<'a> MaskGenerator<'a> {
    /// Borrow the collaborators for one or more generations.
    pub fn new(
        encoder: &'a mut dyn PromptEncoder,
        unet: &'a mut dyn NoisePredictor,
        config: &'a Config,
    ) -> Self {
        Self {
            encoder,
            unet,
            config,
        }
    }

    /// Compute `(processed_mask, rough_mask)` for the region where `prompt_remove`
    /// and `prompt_add` lead to different denoising.
    ///
    /// Identical inputs and seed always give identical masks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if `iterations` is zero, or any
    /// inference error.
    pub fn generate(
        &mut self,
        latent: &LatentTensor,
        prompt_remove: &str,
        prompt_add: &str,
        iterations: usize,
        seed: u64,
    ) -> Result<(GrayImage, GrayImage)> {
        let divergence = self.divergence(latent, prompt_remove, prompt_add, iterations, seed)?;
        Ok(masks_from_divergence(&divergence, self.config))
    }

    /// Accumulated divergence map over `iterations` noise draws.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if `iterations` is zero, or any
    /// inference error.
    pub fn divergence(
        &mut self,
        latent: &LatentTensor,
        prompt_remove: &str,
        prompt_add: &str,
        iterations: usize,
        seed: u64,
    ) -> Result<DivergenceMap> {
        if iterations == 0 {
            return Err(Error::invalid("iterations", "must be greater than 0"));
        }

        let remove = self.encoder.embed(prompt_remove)?;
        let add = self.encoder.embed(prompt_add)?;

        let pb = self.progress_bar(iterations);
        let mut total: Option<DivergenceMap> = None;

        for iteration in 0..iterations {
            let noise = sample_noise(latent.dim(), derive_seed(seed, iteration));
            let map = self.iteration_divergence(latent, &noise, &remove, &add)?;
            tracing::debug!(
                "Iteration {}/{iterations}: mean divergence {:.5}",
                iteration + 1,
                map.mean().unwrap_or(0.0)
            );

            match total.as_mut() {
                Some(sum) => *sum += &map,
                None => total = Some(map),
            }
            pb.inc(1);
        }

        pb.finish_and_clear();
        total.ok_or_else(|| Error::invalid("iterations", "must be greater than 0"))
    }

    /// Divergence map of a single noise draw.
    ///
    /// # Errors
    ///
    /// Returns an error if inference fails.
    #[allow(clippy::cast_precision_loss)]
    pub fn iteration_divergence(
        &mut self,
        latent: &LatentTensor,
        noise: &LatentTensor,
        remove: &Embedding,
        add: &Embedding,
    ) -> Result<DivergenceMap> {
        let remove_preds = self.trajectory(latent, noise, remove)?;
        let add_preds = self.trajectory(latent, noise, add)?;

        let (_, _, height, width) = latent.dim();
        let mut map = DivergenceMap::zeros((height, width));
        for (a, b) in remove_preds.iter().zip(&add_preds) {
            let diff = (a - b).mapv(f32::abs);
            if let Some(per_pixel) = diff.index_axis(Axis(0), 0).mean_axis(Axis(0)) {
                map += &per_pixel;
            }
        }

        let steps = remove_preds.len().max(1) as f32;
        Ok(map / steps)
    }

    /// Partially noise `latent` and denoise it under `embedding`, returning the
    /// noise prediction of every step.
    fn trajectory(
        &mut self,
        latent: &LatentTensor,
        noise: &LatentTensor,
        embedding: &Embedding,
    ) -> Result<Vec<LatentTensor>> {
        let mut scheduler = LmsScheduler::new(self.config.num_steps, &self.config.scheduler)?;
        let start = self.config.start_step();
        let timesteps = scheduler.timesteps().to_vec();

        let mut sample = scheduler.add_noise(latent, noise, start);
        let mut predictions = Vec::with_capacity(timesteps.len() - start);

        for (index, &timestep) in timesteps.iter().enumerate().skip(start) {
            let model_input = scheduler.scale_model_input(&sample, index);
            let noise_pred = self.unet.predict_noise(&model_input, timestep, embedding)?;
            sample = scheduler.step(&noise_pred, index, &sample);
            predictions.push(noise_pred);
        }

        Ok(predictions)
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.config.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        if let Ok(style) =
            ProgressStyle::default_bar().template("{spinner:.green} Masking [{bar:40.cyan/blue}] {pos}/{len}")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb
    }
}

/// Seed for iteration `iteration` of a run seeded with `seed`.
///
/// Distinct per iteration, deterministic per `(seed, iteration)`.
#[must_use]
pub const fn derive_seed(seed: u64, iteration: usize) -> u64 {
    // splitmix64 finaliser over the pair
    let mut z = seed ^ (iteration as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Standard normal noise of the given shape.
#[must_use]
pub fn sample_noise(shape: (usize, usize, usize, usize), seed: u64) -> LatentTensor {
    let mut rng = StdRng::seed_from_u64(seed);
    LatentTensor::from_shape_simple_fn(shape, || StandardNormal.sample(&mut rng))
}

/// Sum divergence maps from several runs sharing one latent.
///
/// # Errors
///
/// Returns [`Error::InvalidParameter`] for an empty list and
/// [`Error::ShapeMismatch`] if the maps differ in shape.
pub fn combine_divergence(maps: &[DivergenceMap]) -> Result<DivergenceMap> {
    let (first, rest) = maps
        .split_first()
        .ok_or_else(|| Error::invalid("maps", "at least one divergence map is required"))?;

    let mut total = first.clone();
    for map in rest {
        if map.dim() != total.dim() {
            return Err(Error::ShapeMismatch {
                expected: format!("{:?}", total.dim()),
                actual: format!("{:?}", map.dim()),
            });
        }
        total += map;
    }
    Ok(total)
}

/// Min-max normalise to [0, 1]. A flat map normalises to all zeros.
#[must_use]
pub fn normalize(map: &DivergenceMap) -> DivergenceMap {
    let min = map.iter().copied().fold(f32::INFINITY, f32::min);
    let max = map.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let range = max - min;

    if !range.is_finite() || range <= f32::EPSILON {
        return DivergenceMap::zeros(map.dim());
    }
    map.mapv(|v| (v - min) / range)
}

/// Turn a divergence map into `(processed_mask, rough_mask)` at the working resolution.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn masks_from_divergence(divergence: &DivergenceMap, config: &Config) -> (GrayImage, GrayImage) {
    let normalized = normalize(divergence);
    let (height, width) = normalized.dim();

    // Safe: latent dimensions come from a u32-sized image
    let latent_map = GrayImage::from_fn(width as u32, height as u32, |x, y| {
        Luma([(normalized[[y as usize, x as usize]] * 255.0).round().clamp(0.0, 255.0) as u8])
    });
    let upsampled = ::image::imageops::resize(
        &latent_map,
        config.image_size,
        config.image_size,
        FilterType::Triangle,
    );

    // Strictly above, so a flat map stays empty even at threshold 0
    let cutoff = config.mask_threshold * 255.0;
    let rough = GrayImage::from_fn(config.image_size, config.image_size, |x, y| {
        if f32::from(upsampled.get_pixel(x, y)[0]) > cutoff {
            Luma([MASK_FOREGROUND])
        } else {
            Luma([0])
        }
    });

    let processed = smooth_mask(&rough, config.mask_smoothing);
    (processed, rough)
}

/// Remove specks smaller than `radius` (opening), then fill holes of the same
/// size (closing). A radius of zero returns the mask unchanged.
#[must_use]
pub fn smooth_mask(rough: &GrayImage, radius: u8) -> GrayImage {
    if radius == 0 {
        return rough.clone();
    }
    close(&open(rough, Norm::LInf, radius), Norm::LInf, radius)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::{MockPromptEncoder, MockUnet};

    fn test_config() -> Config {
        Config {
            image_size: 64,
            num_steps: 6,
            strength: 0.5,
            mask_smoothing: 1,
            show_progress: false,
            ..Config::default()
        }
    }

    fn test_latent() -> LatentTensor {
        LatentTensor::from_shape_fn((1, 4, 8, 8), |(_, c, y, x)| {
            #[allow(clippy::cast_precision_loss)]
            let v = (c * 64 + y * 8 + x) as f32;
            (v / 256.0) - 0.5
        })
    }

    #[test]
    fn test_generate_is_deterministic() {
        let config = test_config();
        let latent = test_latent();
        let (mut encoder, mut unet) = (MockPromptEncoder, MockUnet::new());
        let mut generator = MaskGenerator::new(&mut encoder, &mut unet, &config);

        let first = generator.generate(&latent, "dog", "cat", 2, 42).unwrap();
        let second = generator.generate(&latent, "dog", "cat", 2, 42).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_mask_covers_diverging_region() {
        let config = test_config();
        let latent = test_latent();
        let (mut encoder, mut unet) = (MockPromptEncoder, MockUnet::new());
        let mut generator = MaskGenerator::new(&mut encoder, &mut unet, &config);

        let (mask, rough) = generator.generate(&latent, "dog", "cat", 2, 42).unwrap();
        assert_eq!(mask.dimensions(), (64, 64));
        assert_eq!(rough.dimensions(), (64, 64));

        // The mock UNet only reacts to the prompt in the left half
        assert_eq!(mask.get_pixel(5, 30)[0], MASK_FOREGROUND);
        assert_eq!(mask.get_pixel(60, 30)[0], 0);
        assert!(mask.pixels().all(|p| p[0] == 0 || p[0] == MASK_FOREGROUND));
    }

    #[test]
    fn test_unet_called_for_both_trajectories() {
        let config = test_config();
        let latent = test_latent();
        let (mut encoder, mut unet) = (MockPromptEncoder, MockUnet::new());
        {
            let mut generator = MaskGenerator::new(&mut encoder, &mut unet, &config);
            generator.divergence(&latent, "dog", "cat", 3, 7).unwrap();
        }
        let steps_per_trajectory = config.num_steps - config.start_step();
        assert_eq!(unet.calls, 3 * 2 * steps_per_trajectory);
    }

    #[test]
    fn test_same_prompt_has_no_divergence() {
        let config = test_config();
        let latent = test_latent();
        let (mut encoder, mut unet) = (MockPromptEncoder, MockUnet::new());
        let mut generator = MaskGenerator::new(&mut encoder, &mut unet, &config);

        let map = generator.divergence(&latent, "dog", "dog", 2, 42).unwrap();
        assert!(map.iter().all(|&v| v == 0.0));

        let (mask, rough) = masks_from_divergence(&map, &config);
        assert!(mask.pixels().chain(rough.pixels()).all(|p| p[0] == 0));
    }

    #[test]
    fn test_flat_map_is_empty_at_zero_threshold() {
        let config = Config {
            mask_threshold: 0.0,
            ..test_config()
        };
        let (mask, rough) = masks_from_divergence(&DivergenceMap::zeros((8, 8)), &config);
        assert!(mask.pixels().chain(rough.pixels()).all(|p| p[0] == 0));
    }

    #[test]
    fn test_zero_threshold_keeps_only_diverging_pixels() {
        let config = Config {
            mask_threshold: 0.0,
            mask_smoothing: 0,
            ..test_config()
        };
        let map = DivergenceMap::from_shape_fn((8, 8), |(_, x)| if x < 2 { 1.0 } else { 0.0 });
        let (_, rough) = masks_from_divergence(&map, &config);
        assert_eq!(rough.get_pixel(0, 10)[0], MASK_FOREGROUND);
        assert_eq!(rough.get_pixel(60, 10)[0], 0);
    }

    #[test]
    fn test_accumulation_is_order_independent() {
        let config = test_config();
        let latent = test_latent();
        let (mut encoder, mut unet) = (MockPromptEncoder, MockUnet::new());
        let remove = encoder.embed("dog").unwrap();
        let add = encoder.embed("cat").unwrap();
        let mut generator = MaskGenerator::new(&mut encoder, &mut unet, &config);

        let maps: Vec<DivergenceMap> = (0..4)
            .map(|i| {
                let noise = sample_noise(latent.dim(), derive_seed(42, i));
                generator.iteration_divergence(&latent, &noise, &remove, &add).unwrap()
            })
            .collect();
        let reversed: Vec<DivergenceMap> = maps.iter().rev().cloned().collect();

        let forward = normalize(&combine_divergence(&maps).unwrap());
        let backward = normalize(&combine_divergence(&reversed).unwrap());
        assert!(forward
            .iter()
            .zip(backward.iter())
            .all(|(a, b)| (a - b).abs() < 1e-5));

        let direct = normalize(&generator.divergence(&latent, "dog", "cat", 4, 42).unwrap());
        assert!(forward.iter().zip(direct.iter()).all(|(a, b)| (a - b).abs() < 1e-5));
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let config = test_config();
        let (mut encoder, mut unet) = (MockPromptEncoder, MockUnet::new());
        let mut generator = MaskGenerator::new(&mut encoder, &mut unet, &config);
        let err = generator.divergence(&test_latent(), "dog", "cat", 0, 42).unwrap_err();
        assert!(matches!(err, Error::InvalidParameter { .. }));
    }

    #[test]
    fn test_derive_seed_distinct_and_stable() {
        let seeds: Vec<u64> = (0..16).map(|i| derive_seed(42, i)).collect();
        let mut unique = seeds.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), seeds.len());
        assert_eq!(derive_seed(42, 3), derive_seed(42, 3));
        assert_ne!(derive_seed(42, 0), derive_seed(43, 0));
    }

    #[test]
    fn test_sample_noise_reproducible() {
        let a = sample_noise((1, 4, 8, 8), 9);
        let b = sample_noise((1, 4, 8, 8), 9);
        assert_eq!(a, b);
        assert_ne!(a, sample_noise((1, 4, 8, 8), 10));
    }

    #[test]
    fn test_normalize_range() {
        let map = DivergenceMap::from_shape_vec((2, 2), vec![1.0, 3.0, 2.0, 5.0]).unwrap();
        let n = normalize(&map);
        assert!((n[[0, 0]]).abs() < f32::EPSILON);
        assert!((n[[1, 1]] - 1.0).abs() < f32::EPSILON);
        assert!((n[[0, 1]] - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_combine_rejects_mismatched_shapes() {
        let maps = [DivergenceMap::zeros((2, 2)), DivergenceMap::zeros((3, 3))];
        assert!(matches!(
            combine_divergence(&maps),
            Err(Error::ShapeMismatch { .. })
        ));
        assert!(combine_divergence(&[]).is_err());
    }

    #[test]
    fn test_smoothing_removes_speck_and_fills_hole() {
        let mut rough = GrayImage::new(32, 32);
        for y in 8..24 {
            for x in 8..24 {
                rough.put_pixel(x, y, Luma([MASK_FOREGROUND]));
            }
        }
        rough.put_pixel(15, 15, Luma([0]));
        rough.put_pixel(28, 4, Luma([MASK_FOREGROUND]));

        let processed = smooth_mask(&rough, 1);
        assert_eq!(processed.get_pixel(28, 4)[0], 0);
        assert_eq!(processed.get_pixel(15, 15)[0], MASK_FOREGROUND);
        assert_eq!(processed.get_pixel(8, 8)[0], MASK_FOREGROUND);
        assert_eq!(processed.get_pixel(5, 5)[0], 0);
    }

    #[test]
    fn test_zero_smoothing_is_identity() {
        let rough = GrayImage::from_fn(16, 16, |x, y| Luma([if (x * y) % 3 == 0 { 255 } else { 0 }]));
        assert_eq!(smooth_mask(&rough, 0), rough);
    }
}
