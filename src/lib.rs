//! # `DiffEdit`
//!
//! Semantic image editing with Stable Diffusion 1.x.
//!
//! Given an image and two prompts, the pipeline finds the region where the
//! model's noise predictions under the two prompts disagree, turns that
//! region into a binary mask, and regenerates it with an inpainting `UNet`
//! conditioned on the new prompt. Everything outside the mask is kept
//! pixel-for-pixel.
//!
//! ## Example
//!
//! ```no_run
//! use diffedit::model::{Device, ModelCache};
//! use diffedit::{Config, DiffEdit, Stage};
//!
//! # fn main() -> diffedit::Result<()> {
//! let cache = ModelCache::new(Device::resolve("best")?)?;
//! let mut diffedit = DiffEdit::from_pretrained(Config::default(), &cache, Stage::Full)?;
//!
//! let masks = diffedit.create_mask("dog.jpg", "dog", "cat", 10, 42)?;
//! diffedit.save_mask(&masks, "dog.jpg", "workdir")?;
//!
//! let masks = diffedit.load_mask("workdir")?;
//! let cat = diffedit.inpaint_mask_with_prompt("dog.jpg", &masks.mask, "cat", 42)?;
//! diffedit.save_inpainted_image(&cat, "workdir")?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod image;
pub mod model;
pub mod pipeline;

pub use error::{Error, Result};
pub use image::MaskSet;
pub use model::Device;
pub use pipeline::{Config, DemoOutput, DiffEdit, DiffEditBuilder, Stage};
