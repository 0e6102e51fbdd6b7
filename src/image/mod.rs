//! Image loading, conversion, visualisation and persistence.

mod artifacts;
mod blend;
mod load;
mod save;

pub use artifacts::{
    load_mask_set, save_inpainted_image, save_mask_set, MaskSet, BLENDED_MASK_FILE,
    INPAINTED_IMAGE_FILE, MASK_FILE, ORIGINAL_IMAGE_FILE, ROUGH_MASK_FILE,
};
pub use blend::{blend, BLEND_ALPHA, BLEND_TINT};
pub use load::{check_dimensions, image_to_tensor, load_image, mask_to_tensor};
pub use save::{save_bmp, tensor_to_image};

use ndarray::Array4;

/// Image tensor in NCHW format (batch, channels, height, width).
/// Values are normalized to [-1, 1] range for diffusion model compatibility.
pub type ImageTensor = Array4<f32>;

/// Standard image size for Stable Diffusion 1.x.
pub const SD_IMAGE_SIZE: u32 = 512;

/// Number of channels in RGB images.
pub const RGB_CHANNELS: usize = 3;

/// Mask pixel value marking the region to edit.
pub const MASK_FOREGROUND: u8 = 255;
