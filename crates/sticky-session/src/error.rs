//! Error types for sticky session operations.

/// Error type for sticky session operations.
///
/// A missing session is not an error: lookups return `Ok(None)` instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error reported by the remote session store.
    #[error("Remote store error: {0}")]
    Remote(String),

    /// The configuration is inconsistent.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Create a remote store error from anything displayable.
    pub fn remote(err: impl std::fmt::Display) -> Self {
        Self::Remote(err.to_string())
    }
}

/// Result type for sticky session operations.
pub type Result<T> = std::result::Result<T, Error>;
