//! Noise schedule and LMS discrete sampler for Stable Diffusion 1.x.

use std::collections::VecDeque;

use crate::error::{Error, Result};

use super::vae::LatentTensor;

/// Noise schedule configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of training timesteps.
    pub num_train_steps: usize,
    /// First beta of the scaled-linear schedule.
    pub beta_start: f64,
    /// Last beta of the scaled-linear schedule.
    pub beta_end: f64,
    /// Number of past derivatives used by the multistep update.
    pub order: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_train_steps: 1000,
            beta_start: 0.000_85,
            beta_end: 0.012,
            order: 4,
        }
    }
}

impl SchedulerConfig {
    /// Cumulative product of alphas for the scaled-linear beta schedule.
    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn alphas_cumprod(&self) -> Vec<f64> {
        let n = self.num_train_steps;
        let (start, end) = (self.beta_start.sqrt(), self.beta_end.sqrt());

        let mut cumprod = 1.0;
        (0..n)
            .map(|i| {
                let t = if n > 1 { i as f64 / (n - 1) as f64 } else { 0.0 };
                let beta = (start + t * (end - start)).powi(2);
                cumprod *= 1.0 - beta;
                cumprod
            })
            .collect()
    }
}

/// Linear multistep (LMS) discrete scheduler.
///
/// Holds derivative history, so a fresh instance is needed per trajectory.
#[derive(Debug, Clone)]
pub struct LmsScheduler {
    timesteps: Vec<f64>,
    /// One entry per timestep plus a trailing zero.
    sigmas: Vec<f64>,
    order: usize,
    derivatives: VecDeque<LatentTensor>,
}

impl LmsScheduler {
    /// Build a scheduler for `num_inference_steps` denoising steps.
    ///
    /// # Errors
    ///
    /// Returns an error if the step count is zero or exceeds the training steps.
    #[allow(clippy::cast_precision_loss)]
    pub fn new(num_inference_steps: usize, config: &SchedulerConfig) -> Result<Self> {
        if num_inference_steps == 0 || num_inference_steps > config.num_train_steps {
            return Err(Error::invalid(
                "num_inference_steps",
                format!("must be between 1 and {}", config.num_train_steps),
            ));
        }
        if config.order == 0 {
            return Err(Error::invalid("order", "must be greater than 0"));
        }

        let train_sigmas: Vec<f64> = config
            .alphas_cumprod()
            .iter()
            .map(|alpha| ((1.0 - alpha) / alpha).sqrt())
            .collect();

        // Evenly spaced from the last training step down to 0
        let last = (config.num_train_steps - 1) as f64;
        let timesteps: Vec<f64> = (0..num_inference_steps)
            .map(|i| {
                if num_inference_steps == 1 {
                    last
                } else {
                    last - last * i as f64 / (num_inference_steps - 1) as f64
                }
            })
            .collect();

        let mut sigmas: Vec<f64> = timesteps.iter().map(|&t| interp(&train_sigmas, t)).collect();
        sigmas.push(0.0);

        Ok(Self {
            timesteps,
            sigmas,
            order: config.order,
            derivatives: VecDeque::with_capacity(config.order),
        })
    }

    /// Timesteps in denoising order (high noise first).
    #[must_use]
    pub fn timesteps(&self) -> &[f64] {
        &self.timesteps
    }

    /// Noise level at step `index`.
    #[must_use]
    pub fn sigma(&self, index: usize) -> f64 {
        self.sigmas[index]
    }

    /// Standard deviation of the initial noise.
    #[must_use]
    pub fn init_noise_sigma(&self) -> f64 {
        self.sigmas.iter().copied().fold(0.0, f64::max)
    }

    /// Scale the sample so the `UNet` sees unit variance input.
    #[allow(clippy::cast_possible_truncation)]
    #[must_use]
    pub fn scale_model_input(&self, sample: &LatentTensor, index: usize) -> LatentTensor {
        let sigma = self.sigmas[index];
        sample / (sigma.mul_add(sigma, 1.0).sqrt() as f32)
    }

    /// Noise `original` to the level of step `index`.
    #[allow(clippy::cast_possible_truncation)]
    #[must_use]
    pub fn add_noise(&self, original: &LatentTensor, noise: &LatentTensor, index: usize) -> LatentTensor {
        original + &(noise * self.sigmas[index] as f32)
    }

    /// Advance `sample` from step `index` to `index + 1` given the predicted noise.
    #[allow(clippy::cast_possible_truncation)]
    pub fn step(&mut self, noise_pred: &LatentTensor, index: usize, sample: &LatentTensor) -> LatentTensor {
        // For epsilon prediction the ODE derivative (x - x0) / sigma is the noise itself
        self.derivatives.push_front(noise_pred.clone());
        self.derivatives.truncate(self.order);

        let order = self.derivatives.len().min(index + 1);
        let mut prev = sample.clone();
        for (current, derivative) in self.derivatives.iter().take(order).enumerate() {
            let coefficient = self.lms_coefficient(order, index, current) as f32;
            prev.scaled_add(coefficient, derivative);
        }
        prev
    }

    /// Integral over [sigma_t, sigma_{t+1}] of the Lagrange basis polynomial
    /// for the derivative `current` steps back.
    fn lms_coefficient(&self, order: usize, t: usize, current: usize) -> f64 {
        let basis = |tau: f64| {
            (0..order)
                .filter(|&k| k != current)
                .map(|k| {
                    (tau - self.sigmas[t - k]) / (self.sigmas[t - current] - self.sigmas[t - k])
                })
                .product::<f64>()
        };
        simpson(basis, self.sigmas[t], self.sigmas[t + 1])
    }
}

/// Composite Simpson's rule; exact for the cubic basis polynomials used here.
#[allow(clippy::cast_precision_loss)]
fn simpson(f: impl Fn(f64) -> f64, a: f64, b: f64) -> f64 {
    const INTERVALS: usize = 8;
    let h = (b - a) / INTERVALS as f64;
    let mut sum = f(a) + f(b);
    for i in 1..INTERVALS {
        let weight = if i % 2 == 1 { 4.0 } else { 2.0 };
        sum += weight * f((i as f64).mul_add(h, a));
    }
    sum * h / 3.0
}

/// Linear interpolation of `values` at fractional index `x`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn interp(values: &[f64], x: f64) -> f64 {
    let last = values.len() - 1;
    if x <= 0.0 {
        return values[0];
    }
    if x >= last as f64 {
        return values[last];
    }
    let low = x.floor() as usize;
    let frac = x - low as f64;
    values[low].mul_add(1.0 - frac, values[low + 1] * frac)
}
