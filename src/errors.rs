use thiserror::Error;

/// Typed error hierarchy for contextify.
///
/// Use at module boundaries (catalog builds, upstream calls, config
/// validation). Internal/leaf functions can continue using `anyhow::Result`
/// — the `Internal` variant allows seamless conversion via the `?` operator.
#[derive(Debug, Error)]
pub enum ContextifyError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Policy error: {0}")]
    Policy(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Upstream error: {upstream}: {message}")]
    Upstream {
        upstream: String,
        message: String,
        retryable: bool,
    },

    #[error("Rate limit exceeded")]
    RateLimit { retry_after: Option<u64> },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Convenience alias for results using `ContextifyError`.
pub type ContextifyResult<T> = std::result::Result<T, ContextifyError>;

impl ContextifyError {
    /// Whether this error is retryable (rate limits, transient upstream failures).
    pub fn is_retryable(&self) -> bool {
        match self {
            ContextifyError::RateLimit { .. } => true,
            ContextifyError::Upstream { retryable, .. } => *retryable,
            _ => false,
        }
    }
}
