//! Mask visualisation.

use image::{GrayImage, Rgb, RgbImage};

use crate::error::{Error, Result};

/// Default opacity of the mask overlay.
pub const BLEND_ALPHA: f32 = 0.5;

/// Overlay colour used for the edit region.
pub const BLEND_TINT: Rgb<u8> = Rgb([255, 0, 0]);

/// Overlay the mask foreground on `image` with [`BLEND_TINT`] at opacity `alpha`.
///
/// Background pixels are copied unchanged. Neither input is modified.
///
/// # Errors
///
/// Returns [`Error::DimensionMismatch`] if the mask and image sizes differ, or
/// [`Error::InvalidParameter`] if `alpha` is outside [0, 1].
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn blend(image: &RgbImage, mask: &GrayImage, alpha: f32) -> Result<RgbImage> {
    if !(0.0..=1.0).contains(&alpha) {
        return Err(Error::invalid("alpha", "must be between 0.0 and 1.0"));
    }
    if image.dimensions() != mask.dimensions() {
        return Err(Error::DimensionMismatch {
            what: "mask",
            expected_width: image.width(),
            expected_height: image.height(),
            width: mask.width(),
            height: mask.height(),
        });
    }

    let blended = RgbImage::from_fn(image.width(), image.height(), |x, y| {
        let pixel = *image.get_pixel(x, y);
        if mask.get_pixel(x, y)[0] < 128 {
            return pixel;
        }
        let mut out = pixel;
        for (channel, tint) in out.0.iter_mut().zip(BLEND_TINT.0) {
            let mixed = f32::from(*channel).mul_add(1.0 - alpha, f32::from(tint) * alpha);
            *channel = mixed.round().clamp(0.0, 255.0) as u8;
        }
        out
    });

    Ok(blended)
}
