use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata store error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("invalid glob pattern: {0}")]
    Pattern(#[from] globset::Error),

    #[error("vector dimension {actual} does not match configured dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("vector index at {path} is unreadable: {details}")]
    CorruptIndex { path: PathBuf, details: String },

    #[error("text extraction failed: {0}")]
    Extraction(String),

    #[error("embedding failed: {0}")]
    Embed(#[from] EmbedError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Provider-side failures. An over-budget batch is not one of these; see
/// [`crate::embeddings::EmbedOutcome::Rejected`].
#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid response from {provider}: {details}")]
    Provider { provider: String, details: String },

    #[error("malformed embedding response: {0}")]
    MalformedResponse(String),

    #[error("embedding dimension {actual} != {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{0} selected but its settings section is missing")]
    MissingProviderSettings(String),

    #[error("missing credential: set `{0}` in the config or the environment")]
    MissingCredential(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type Result<T, E = IndexError> = std::result::Result<T, E>;
