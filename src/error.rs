use thiserror::Error;

/// Errors that can occur while configuring, training, querying, or persisting an index.
#[derive(Debug, Error)]
pub enum ItqError {
    /// Invalid configuration: an unknown distance method label, or a bit length or iteration count out of range.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Invalid input data: an empty training corpus, vectors of mismatched dimension, or non-finite components.
    #[error("invalid input: {0}")]
    Input(String),

    /// The operation needs a trained index, but no training pass has succeeded yet.
    #[error("index has not been built")]
    NotTrained,

    /// The index is trained but holds no descriptors.
    #[error("index holds no descriptors")]
    EmptyIndex,

    /// The index state could not be written.
    #[error("unable to save index state: {0}")]
    Save(String),

    /// The index state could not be read, or what was read is not a valid index.
    #[error("unable to load index state: {0}")]
    Load(String),

    /// The code index backend failed.
    #[error(transparent)]
    CodeIndex(#[from] anyhow::Error),
}

/// The result type used throughout this crate.
pub type Result<T> = std::result::Result<T, ItqError>;
