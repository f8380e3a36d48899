//! Error types for vidgan.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Architecture parameters that cannot produce a consistent layer chain.
    #[error("configuration: {0}")]
    Configuration(String),

    /// Input tensor rank, shape, kind or label range rejected at call time.
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// Frame sequencer driven out of order.
    #[error("usage sequence: {0}")]
    UsageSequence(String),

    #[error("torch: {0}")]
    Torch(#[from] tch::TchError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("image: {0}")]
    Image(#[from] image::ImageError),

    #[error("gif decode: {0}")]
    GifDecode(#[from] gif::DecodingError),

    #[error("gif encode: {0}")]
    GifEncode(#[from] gif::EncodingError),

    #[error("config: {0}")]
    Json5(#[from] json5::Error),

    #[error("glob: {0}")]
    Glob(#[from] glob::PatternError),

    /// Malformed dataset layout or video contents.
    #[error("dataset: {0}")]
    Dataset(String),
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub(crate) fn contract(msg: impl Into<String>) -> Self {
        Error::ContractViolation(msg.into())
    }
}
