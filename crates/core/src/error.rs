use thiserror::Error;

pub type DripResult<T> = Result<T, DripError>;

#[derive(Error, Debug)]
pub enum DripError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Provider fault expected to clear on its own (rate limit, 5xx).
    /// The only class the queue retries, besides unexpected internals.
    #[error("Transient provider error: {0}")]
    TransientProvider(String),

    /// Provider rejected the send outright (bad address, suppressed
    /// recipient, revoked key). Never retried.
    #[error("Fatal provider error: {0}")]
    FatalProvider(String),

    /// No provider is configured for the tenant/channel. Never retried.
    #[error("Channel unconfigured: {0}")]
    Unconfigured(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl DripError {
    /// Whether the queue should re-run the job with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DripError::TransientProvider(_) | DripError::Internal(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_and_internal_are_retryable() {
        assert!(DripError::TransientProvider("throttled".to_string()).is_retryable());
        assert!(DripError::Internal(anyhow::anyhow!("boom")).is_retryable());

        assert!(!DripError::FatalProvider("bounced".to_string()).is_retryable());
        assert!(!DripError::Unconfigured("no email provider".to_string()).is_retryable());
        assert!(!DripError::Validation("bad payload".to_string()).is_retryable());
        assert!(!DripError::NotFound("instance".to_string()).is_retryable());
    }
}
