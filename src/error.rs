//! Error types for the img2img generator.

use std::fmt;
use std::path::PathBuf;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A required configuration key is absent.
    #[error("missing required configuration key `{key}`")]
    MissingConfig { key: String },

    /// A configuration key is present but unusable.
    #[error("invalid configuration for `{key}`: {reason}")]
    InvalidConfig { key: String, reason: String },

    /// Malformed job document.
    #[error("config: {0}")]
    Config(String),

    /// The job names a process type this binary does not provide.
    #[error("unknown process type `{0}`")]
    UnknownProcess(String),

    /// The requested sampler is not in the registry.
    #[error("unknown sampler `{name}` (supported: {supported})")]
    UnknownSampler { name: String, supported: String },

    /// The model variant is loadable but has no pipeline.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Model weights or tokenizer files could not be located.
    #[error("model files: {0}")]
    ModelFiles(String),

    /// Pipeline used before `load_model` or after `release`.
    #[error("model not loaded")]
    ModelNotLoaded,

    /// Dataset scanning or decoding failure.
    #[error("dataset {path}: {reason}")]
    Dataset { path: PathBuf, reason: String },

    /// Candle tensor/model error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Tokenizer error.
    #[error("tokenizer: {0}")]
    Tokenizer(TokenizerError),

    /// Image decode/encode error.
    #[error("image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// YAML error.
    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn invalid(key: impl Into<String>, reason: impl fmt::Display) -> Self {
        Error::InvalidConfig {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn image(path: impl Into<PathBuf>, source: image::ImageError) -> Self {
        Error::Image {
            path: path.into(),
            source,
        }
    }
}

/// Wrapper for tokenizer errors (tokenizers::Error doesn't impl std::error::Error).
#[derive(Debug)]
pub struct TokenizerError(pub String);

impl fmt::Display for TokenizerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<tokenizers::Error> for Error {
    fn from(error: tokenizers::Error) -> Self {
        Error::Tokenizer(TokenizerError(error.to_string()))
    }
}
