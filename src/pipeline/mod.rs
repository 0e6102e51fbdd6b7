//! DiffEdit: mask generation from prompt divergence, and mask-guided inpainting.

mod diffedit;
mod inpaint;
mod mask;
mod onnx;
mod scheduler;
mod text;
mod unet;
mod vae;

#[cfg(test)]
pub(crate) mod testing;

pub use diffedit::{
    Config, DemoOutput, DiffEdit, DiffEditBuilder, Stage, DEFAULT_ITERATIONS, DEFAULT_SEED,
};
pub use inpaint::{compose, Inpainter};
pub use mask::{
    combine_divergence, derive_seed, masks_from_divergence, normalize, sample_noise, smooth_mask,
    DivergenceMap, MaskGenerator,
};
pub use scheduler::{LmsScheduler, SchedulerConfig};
pub use text::{pad_tokens, ClipTextEncoder, Embedding, PromptEncoder, MAX_TOKENS};
pub use unet::{NoisePredictor, OnnxUnet};
pub use vae::{
    decode_latent, encode_image, LatentCodec, LatentTensor, OnnxVae, LATENT_CHANNELS, VAE_SCALE,
    VAE_SCALE_FACTOR,
};
