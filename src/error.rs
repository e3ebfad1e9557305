use std::path::PathBuf;

/// Detection pipeline error enum.
#[derive(thiserror::Error, Debug)]
pub enum DetectError {
    /// A required input file does not exist.
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// The network produced an output that cannot be decoded.
    #[error("Invalid tensor shape: {0}")]
    InvalidTensorShape(String),

    /// The input image could not be decoded.
    #[error("Failed to decode image {}: {reason}", path.display())]
    ImageDecodeFailure {
        /// Path of the image.
        path: PathBuf,
        /// Decoder message.
        reason: String,
    },

    /// The network config or the run configuration is invalid.
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// The weights file does not match the network config.
    #[error("Invalid weights: {0}")]
    InvalidWeights(String),

    /// Internal candle error.
    #[error(transparent)]
    CandleError(#[from] candle_core::Error),

    /// Kornia image error.
    #[error(transparent)]
    KorniaImageError(#[from] kornia_image::ImageError),

    /// Image encoding error.
    #[error(transparent)]
    ImageError(#[from] image::ImageError),

    /// I/O error.
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// Detections could not be serialized.
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
}

impl DetectError {
    /// Map an I/O error on `path`, turning a missing file into `FileNotFound`.
    pub(crate) fn from_io(err: std::io::Error, path: &std::path::Path) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => DetectError::FileNotFound(path.to_path_buf()),
            _ => DetectError::IoError(err),
        }
    }
}
