use thiserror::Error;

/// Failure kinds observed while executing a fetch job.
///
/// Network-level variants never escape the fetch executor as `Err`; they ride
/// inside a `FetchOutcome` and are turned into a status transition by the
/// retry policy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Job or proxy absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Network operation exceeded its deadline
    #[error("Request timeout")]
    Timeout,

    /// Connection-level failure, or a request that could not be built
    #[error("{0}")]
    Transport(String),

    /// Non-200 response
    #[error("HTTP {0}")]
    HttpStatus(u16),

    /// No active proxy available, the fetch goes out directly
    #[error("No active proxy available")]
    ProxyExhausted,

    /// Session cookie refresh failed, the fetch goes out without cookies
    #[error("Cookie refresh failed for {domain}")]
    RefreshFailed { domain: String },

    /// Terminal job failure
    #[error("Retries exhausted after {retries} attempts: {last_error}")]
    RetriesExhausted { retries: u32, last_error: String },

    /// The request could not be issued at all (bad URL, bad header, unusable proxy)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Task store unavailable
    #[error("Store error: {0}")]
    Store(String),
}

impl DispatchError {
    /// Whether a job failing with this error should be rescheduled
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::Transport(_) | Self::Store(_) => true,
            Self::HttpStatus(status) => matches!(status, 408 | 429 | 500..=599),
            Self::NotFound(_)
            | Self::InvalidRequest(_)
            | Self::RetriesExhausted { .. } => false,
            // Degradations, never the reason a fetch failed
            Self::ProxyExhausted | Self::RefreshFailed { .. } => true,
        }
    }
}

impl From<reqwest::Error> for DispatchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_builder() {
            Self::InvalidRequest(e.to_string())
        } else if let Some(status) = e.status() {
            Self::HttpStatus(status.as_u16())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(DispatchError::Timeout.is_retryable());
        assert!(DispatchError::Transport("connection refused".into()).is_retryable());
        assert!(DispatchError::HttpStatus(503).is_retryable());
        assert!(DispatchError::HttpStatus(429).is_retryable());

        assert!(!DispatchError::HttpStatus(404).is_retryable());
        assert!(!DispatchError::InvalidRequest("relative URL".into()).is_retryable());
    }

    #[test]
    fn test_messages_are_human_readable() {
        assert_eq!(DispatchError::HttpStatus(500).to_string(), "HTTP 500");
        assert_eq!(DispatchError::Timeout.to_string(), "Request timeout");
    }
}
