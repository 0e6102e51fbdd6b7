//! Model downloading and loading utilities.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use ort::session::Session;

use crate::error::{Error, Result};

use super::device::Device;

const SD_ONNX_REPO: &str = "https://huggingface.co/modularai/stable-diffusion-1.5-onnx/resolve/main";

/// Default location of the SD 1.5 inpainting ONNX export.
pub const DEFAULT_INPAINT_REPO: &str =
    "https://huggingface.co/stable-diffusion-v1-5/stable-diffusion-inpainting/resolve/onnx";

/// Files used by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelType {
    /// VAE Encoder - encodes images to latent space.
    VaeEncoder,
    /// VAE Decoder - decodes latents to images.
    VaeDecoder,
    /// CLIP text encoder - embeds tokenized prompts.
    TextEncoder,
    /// CLIP BPE tokenizer definition.
    Tokenizer,
    /// `UNet` - predicts noise for 4-channel latents.
    Unet,
    /// Inpainting `UNet` - predicts noise for latents + mask + masked image (9 channels).
    InpaintUnet,
}

impl ModelType {
    /// Cache subdirectory holding this model and its external data.
    #[must_use]
    pub const fn dir(&self) -> &'static str {
        match self {
            Self::VaeEncoder => "vae_encoder",
            Self::VaeDecoder => "vae_decoder",
            Self::TextEncoder => "text_encoder",
            Self::Tokenizer => "tokenizer",
            Self::Unet => "unet",
            Self::InpaintUnet => "inpaint_unet",
        }
    }

    /// Get the filename for this model type.
    #[must_use]
    pub const fn filename(&self) -> &'static str {
        match self {
            Self::Tokenizer => "tokenizer.json",
            _ => "model.onnx",
        }
    }

    /// Get the download URL for this model type, taking the inpainting
    /// `UNet` from `inpaint_repo`.
    #[must_use]
    pub fn url(&self, inpaint_repo: &str) -> String {
        match self {
            Self::VaeEncoder | Self::VaeDecoder | Self::TextEncoder | Self::Unet => {
                format!("{SD_ONNX_REPO}/{}/model.onnx", self.dir())
            }
            Self::Tokenizer => {
                "https://huggingface.co/openai/clip-vit-large-patch14/resolve/main/tokenizer.json"
                    .to_string()
            }
            Self::InpaintUnet => format!("{}/unet/model.onnx", inpaint_repo.trim_end_matches('/')),
        }
    }

    /// Get the approximate size in bytes for progress indication.
    #[must_use]
    pub const fn approx_size(&self) -> u64 {
        match self {
            Self::VaeEncoder => 140_000_000,
            Self::VaeDecoder => 100_000_000,
            Self::TextEncoder => 490_000_000,
            Self::Tokenizer => 2_200_000,
            Self::Unet | Self::InpaintUnet => 1_300_000,
        }
    }

    /// Get the external data file URL if this model has one.
    #[must_use]
    pub fn data_url(&self, inpaint_repo: &str) -> Option<String> {
        match self {
            Self::Unet => Some(format!("{SD_ONNX_REPO}/unet/model.onnx_data")),
            Self::InpaintUnet => Some(format!(
                "{}/unet/weights.pb",
                inpaint_repo.trim_end_matches('/')
            )),
            _ => None,
        }
    }

    /// Get the data filename for models with external data.
    /// Must match the reference stored inside the ONNX graph.
    #[must_use]
    pub const fn data_filename(&self) -> Option<&'static str> {
        match self {
            Self::Unet => Some("model.onnx_data"),
            Self::InpaintUnet => Some("weights.pb"),
            _ => None,
        }
    }

    /// Get the approximate size of the data file in bytes.
    #[must_use]
    pub const fn data_approx_size(&self) -> u64 {
        match self {
            Self::Unet | Self::InpaintUnet => 3_500_000_000,
            _ => 0,
        }
    }
}

/// Manages the model cache directory and downloads.
pub struct ModelCache {
    cache_dir: PathBuf,
    device: Device,
    inpaint_repo: String,
}

impl ModelCache {
    /// Create a new model cache in the platform cache directory.
    ///
    /// - Windows: `%LOCALAPPDATA%\diffedit\models`
    /// - Linux: `~/.cache/diffedit/models`
    /// - macOS: `~/Library/Caches/diffedit/models`
    ///
    /// # Errors
    ///
    /// Returns an error if the cache directory cannot be created.
    pub fn new(device: Device) -> Result<Self> {
        let base = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::with_dir(base.join("diffedit").join("models"), device)
    }

    /// Create a model cache rooted at `cache_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn with_dir<P: Into<PathBuf>>(cache_dir: P, device: Device) -> Result<Self> {
        let cache_dir = cache_dir.into();

        fs::create_dir_all(&cache_dir).map_err(|source| Error::CacheDir {
            path: cache_dir.clone(),
            source,
        })?;

        Ok(Self {
            cache_dir,
            device,
            inpaint_repo: DEFAULT_INPAINT_REPO.to_string(),
        })
    }

    /// Download the inpainting `UNet` from another repository.
    ///
    /// The repository must hold `unet/model.onnx` and `unet/weights.pb`.
    #[must_use]
    pub fn with_inpaint_repo(mut self, repo: impl Into<String>) -> Self {
        self.inpaint_repo = repo.into();
        self
    }

    /// Device every session from this cache runs on.
    #[must_use]
    pub const fn device(&self) -> Device {
        self.device
    }

    /// Get the path to a model file, downloading if necessary.
    ///
    /// # Errors
    ///
    /// Returns an error if the model cannot be downloaded or accessed.
    pub fn get_model_path(&self, model_type: ModelType) -> Result<PathBuf> {
        let dir = self.cache_dir.join(model_type.dir());
        fs::create_dir_all(&dir).map_err(|source| Error::CacheDir {
            path: dir.clone(),
            source,
        })?;

        let path = dir.join(model_type.filename());
        if !path.exists() {
            download_file(
                &model_type.url(&self.inpaint_repo),
                &path,
                model_type.filename(),
                model_type.approx_size(),
            )?;
        }

        // Download external data file if needed
        if let (Some(data_url), Some(data_filename)) =
            (model_type.data_url(&self.inpaint_repo), model_type.data_filename())
        {
            let data_path = dir.join(data_filename);
            if !data_path.exists() {
                download_file(
                    &data_url,
                    &data_path,
                    data_filename,
                    model_type.data_approx_size(),
                )?;
            }
        }

        Ok(path)
    }

    /// Load an ONNX model session on the cache's device.
    ///
    /// # Errors
    ///
    /// Returns an error if the model cannot be loaded.
    pub fn load_session(&self, model_type: ModelType) -> Result<Session> {
        let path = self.get_model_path(model_type)?;
        let name = format!("{}/{}", model_type.dir(), model_type.filename());

        tracing::debug!("Loading {name} on {}", self.device);

        let load_error = |source| Error::ModelLoad {
            name: name.clone(),
            source,
        };

        Session::builder()
            .map_err(load_error)?
            .with_execution_providers(self.device.execution_providers())
            .map_err(|err| self.device.registration_error(err))?
            .commit_from_file(&path)
            .map_err(load_error)
    }
}

/// Download a file from a URL to a path with progress indication.
#[allow(clippy::cast_possible_truncation)]
fn download_file(url: &str, path: &Path, name: &str, approx_size: u64) -> Result<()> {
    tracing::info!("Downloading {name} from {url}");

    let client = reqwest::blocking::Client::new();
    let response = client
        .get(url)
        .send()
        .and_then(reqwest::blocking::Response::error_for_status)
        .map_err(|source| Error::ModelDownload {
            name: name.to_string(),
            source,
        })?;

    let total_size = response.content_length().unwrap_or(approx_size);

    let pb = ProgressBar::new(total_size);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb.set_message(format!("Downloading {name}"));

    // Write to a temporary file first, then rename for atomicity
    let temp_path = path.with_extension("part");
    let mut file = fs::File::create(&temp_path)?;

    let mut downloaded = 0u64;
    let mut reader = response;

    loop {
        let mut buffer = [0u8; 8192];
        let bytes_read = std::io::Read::read(&mut reader, &mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        file.write_all(&buffer[..bytes_read])?;
        downloaded += bytes_read as u64;
        pb.set_position(downloaded);
    }
    file.flush()?;

    pb.finish_with_message(format!("Downloaded {name}"));

    fs::rename(&temp_path, path)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unet_models_have_external_data() {
        for model in [ModelType::Unet, ModelType::InpaintUnet] {
            assert!(model.data_url(DEFAULT_INPAINT_REPO).is_some());
            assert!(model.data_filename().is_some());
        }
        assert!(ModelType::VaeEncoder.data_url(DEFAULT_INPAINT_REPO).is_none());
    }

    #[test]
    fn test_model_dirs_are_distinct() {
        let all = [
            ModelType::VaeEncoder,
            ModelType::VaeDecoder,
            ModelType::TextEncoder,
            ModelType::Tokenizer,
            ModelType::Unet,
            ModelType::InpaintUnet,
        ];
        let mut dirs: Vec<_> = all.iter().map(ModelType::dir).collect();
        dirs.sort_unstable();
        dirs.dedup();
        assert_eq!(dirs.len(), all.len());
    }

    #[test]
    fn test_urls_point_at_component_dirs() {
        let repo = DEFAULT_INPAINT_REPO;
        assert!(ModelType::TextEncoder.url(repo).ends_with("/text_encoder/model.onnx"));
        assert!(ModelType::InpaintUnet.url(repo).contains("stable-diffusion-inpainting"));
        assert!(ModelType::Tokenizer.url(repo).ends_with("tokenizer.json"));
    }

    #[test]
    fn test_default_inpaint_repo() {
        assert!(!DEFAULT_INPAINT_REPO.contains("runwayml"));
        assert!(DEFAULT_INPAINT_REPO.starts_with("https://huggingface.co/stable-diffusion-v1-5/"));
    }

    #[test]
    fn test_inpaint_repo_override() {
        let repo = "https://example.org/mirror/";
        assert_eq!(
            ModelType::InpaintUnet.url(repo),
            "https://example.org/mirror/unet/model.onnx"
        );
        assert_eq!(
            ModelType::InpaintUnet.data_url(repo).as_deref(),
            Some("https://example.org/mirror/unet/weights.pb")
        );
        assert_eq!(
            ModelType::VaeDecoder.url(repo),
            ModelType::VaeDecoder.url(DEFAULT_INPAINT_REPO)
        );
    }

    #[test]
    fn test_cache_with_dir_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("models");
        let cache = ModelCache::with_dir(&root, Device::Cpu).unwrap();
        assert!(root.is_dir());
        assert_eq!(cache.device(), Device::Cpu);
    }
}
