//! Custom error types for diffedit.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the diffedit library.
#[derive(Error, Debug)]
pub enum Error {
    /// The source image does not exist.
    #[error("image path {path} does not exist, check the provided path")]
    PathNotFound { path: PathBuf },

    /// The persisted mask set is incomplete.
    #[error("mask files not found in {workdir}: missing {missing}, run create_mask first")]
    ArtifactsNotFound { workdir: PathBuf, missing: String },

    /// Image or mask dimensions do not match the working resolution.
    #[error("dimension mismatch for {what}: expected {expected_width}x{expected_height}, got {width}x{height}")]
    DimensionMismatch {
        what: &'static str,
        expected_width: u32,
        expected_height: u32,
        width: u32,
        height: u32,
    },

    /// The requested accelerator is unavailable or failed to initialize.
    #[error("device {device}: {reason}")]
    Device { device: String, reason: String },

    /// A required collaborator was not supplied to the builder.
    #[error("cannot build session: {0} was not provided")]
    MissingComponent(&'static str),

    /// Failed to load an image file.
    #[error("failed to load image from {path}: {source}")]
    ImageLoad {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// Failed to save an image file.
    #[error("failed to save image to {path}: {source}")]
    ImageSave {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// Failed to download a model.
    #[error("failed to download model {name}: {source}")]
    ModelDownload {
        name: String,
        #[source]
        source: reqwest::Error,
    },

    /// Failed to load an ONNX model.
    #[error("failed to load ONNX model {name}: {source}")]
    ModelLoad {
        name: String,
        #[source]
        source: ort::Error,
    },

    /// Model inference failed.
    #[error("model inference failed: {source}")]
    Inference {
        #[source]
        source: ort::Error,
    },

    /// Tokenizer could not be loaded or failed to encode.
    #[error("tokenizer error: {reason}")]
    Tokenizer { reason: String },

    /// Failed to create cache directory.
    #[error("failed to create cache directory {path}: {source}")]
    CacheDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Invalid parameter value.
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Shape mismatch in tensor operations.
    #[error("tensor shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },
}

impl Error {
    pub(crate) fn invalid(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for diffedit operations.
pub type Result<T> = std::result::Result<T, Error>;
