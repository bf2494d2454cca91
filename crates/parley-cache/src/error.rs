use thiserror::Error;

/// Cache errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The requested data is not (fully) cached.
    #[error("Cache miss")]
    Miss,

    /// The cache cannot be used right now.
    #[error("Cache unavailable: {0}")]
    Unavailable(String),
}

impl CacheError {
    #[must_use]
    pub fn is_miss(&self) -> bool {
        matches!(self, CacheError::Miss)
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
