use pictor_storage::ResolveError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("Failed to load source: {0}")]
    Source(#[from] ResolveError),

    #[error("Failed to decode source image: {0}")]
    Decode(String),

    #[error("Failed to encode artifact: {0}")]
    Encode(String),

    #[error("Invalid target dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("Generation task failed: {0}")]
    Task(String),
}

impl GenerateError {
    /// Problems with the request itself rather than with decoding or encoding.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            GenerateError::InvalidDimensions { .. }
                | GenerateError::Source(ResolveError::UnsupportedContainer(_))
                | GenerateError::Source(ResolveError::TooLarge { .. })
        )
    }
}
