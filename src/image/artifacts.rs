//! Persistence of the workdir artifact set.

use std::path::{Path, PathBuf};

use image::{DynamicImage, GrayImage, RgbImage};

use crate::error::{Error, Result};

use super::save_bmp;

/// Processed mask file name.
pub const MASK_FILE: &str = "mask.bmp";
/// Rough (unsmoothed) mask file name.
pub const ROUGH_MASK_FILE: &str = "rough_mask.bmp";
/// Mask visualisation file name.
pub const BLENDED_MASK_FILE: &str = "blended_mask.bmp";
/// Resized source image file name.
pub const ORIGINAL_IMAGE_FILE: &str = "original_image.bmp";
/// Inpainting result file name.
pub const INPAINTED_IMAGE_FILE: &str = "inpainted_image.bmp";

/// The masks produced by one mask generation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskSet {
    /// Cleaned binary mask used for inpainting.
    pub mask: GrayImage,
    /// Raw thresholded divergence.
    pub rough_mask: GrayImage,
    /// Source image with the mask overlaid, for inspection only.
    pub blended: RgbImage,
}

/// Write the mask set and the resized source image into `workdir`.
///
/// Each file is written atomically. The set as a whole is not: a crash between
/// files leaves a partial set, which [`load_mask_set`] reports as missing.
///
/// # Errors
///
/// Returns an error if the directory cannot be created or any file fails to write.
pub fn save_mask_set<P: AsRef<Path>>(set: &MaskSet, original: &RgbImage, workdir: P) -> Result<()> {
    let workdir = workdir.as_ref();

    save_bmp(&DynamicImage::ImageLuma8(set.mask.clone()), workdir.join(MASK_FILE))?;
    save_bmp(
        &DynamicImage::ImageLuma8(set.rough_mask.clone()),
        workdir.join(ROUGH_MASK_FILE),
    )?;
    save_bmp(
        &DynamicImage::ImageRgb8(set.blended.clone()),
        workdir.join(BLENDED_MASK_FILE),
    )?;
    save_bmp(
        &DynamicImage::ImageRgb8(original.clone()),
        workdir.join(ORIGINAL_IMAGE_FILE),
    )?;

    tracing::debug!("Saved mask set to {}", workdir.display());
    Ok(())
}

/// Load a mask set previously written by [`save_mask_set`].
///
/// # Errors
///
/// Returns [`Error::ArtifactsNotFound`] if any of the three mask files is
/// missing, or an image error if one cannot be decoded.
pub fn load_mask_set<P: AsRef<Path>>(workdir: P) -> Result<MaskSet> {
    let workdir = workdir.as_ref();

    let paths = [MASK_FILE, ROUGH_MASK_FILE, BLENDED_MASK_FILE].map(|name| workdir.join(name));
    let missing: Vec<&str> = paths
        .iter()
        .filter(|path| !path.exists())
        .filter_map(|path| path.file_name().and_then(|name| name.to_str()))
        .collect();

    if !missing.is_empty() {
        return Err(Error::ArtifactsNotFound {
            workdir: workdir.to_path_buf(),
            missing: missing.join(", "),
        });
    }

    let [mask_path, rough_path, blended_path] = paths;
    Ok(MaskSet {
        mask: open(&mask_path)?.to_luma8(),
        rough_mask: open(&rough_path)?.to_luma8(),
        blended: open(&blended_path)?.to_rgb8(),
    })
}

/// Write the inpainting result into `workdir`, returning its path.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn save_inpainted_image<P: AsRef<Path>>(image: &RgbImage, workdir: P) -> Result<PathBuf> {
    let path = workdir.as_ref().join(INPAINTED_IMAGE_FILE);
    save_bmp(&DynamicImage::ImageRgb8(image.clone()), &path)?;
    Ok(path)
}

fn open(path: &Path) -> Result<DynamicImage> {
    image::open(path).map_err(|source| Error::ImageLoad {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb};
    use std::fs;

    fn sample_set() -> (MaskSet, RgbImage) {
        let mask = GrayImage::from_fn(32, 32, |x, y| {
            if (8..24).contains(&x) && (4..20).contains(&y) {
                Luma([255])
            } else {
                Luma([0])
            }
        });
        let rough_mask = GrayImage::from_fn(32, 32, |x, y| Luma([if (x + y) % 5 == 0 { 255 } else { 0 }]));
        let original = RgbImage::from_fn(32, 32, |x, y| Rgb([(x * 7) as u8, (y * 5) as u8, 40]));
        let blended = crate::image::blend(&original, &mask, 0.5).unwrap();
        (
            MaskSet {
                mask,
                rough_mask,
                blended,
            },
            original,
        )
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (set, original) = sample_set();

        save_mask_set(&set, &original, dir.path()).unwrap();
        let loaded = load_mask_set(dir.path()).unwrap();

        assert_eq!(loaded, set);
        for name in [MASK_FILE, ROUGH_MASK_FILE, BLENDED_MASK_FILE, ORIGINAL_IMAGE_FILE] {
            assert!(dir.path().join(name).exists(), "{name} missing");
        }
    }

    #[test]
    fn test_save_is_idempotent_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let (set, original) = sample_set();

        save_mask_set(&set, &original, dir.path()).unwrap();
        let first = fs::read(dir.path().join(MASK_FILE)).unwrap();
        let reloaded = load_mask_set(dir.path()).unwrap();
        save_mask_set(&reloaded, &original, dir.path()).unwrap();
        let second = fs::read(dir.path().join(MASK_FILE)).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_load_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_mask_set(dir.path()).unwrap_err();
        assert!(matches!(err, Error::ArtifactsNotFound { .. }));
    }

    #[test]
    fn test_load_partial_dir_names_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let (set, original) = sample_set();
        save_mask_set(&set, &original, dir.path()).unwrap();
        fs::remove_file(dir.path().join(ROUGH_MASK_FILE)).unwrap();

        match load_mask_set(dir.path()) {
            Err(Error::ArtifactsNotFound { missing, .. }) => assert_eq!(missing, ROUGH_MASK_FILE),
            other => panic!("expected ArtifactsNotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_save_creates_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("session").join("one");
        let path = save_inpainted_image(&RgbImage::new(4, 4), &nested).unwrap();
        assert_eq!(path, nested.join(INPAINTED_IMAGE_FILE));
        assert!(path.exists());
    }
}
