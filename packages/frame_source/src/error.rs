use thiserror::Error;

/// Errors surfaced by upstream frame-source calls.
///
/// These are returned as values and folded into session error counters by the
/// caller; they never cross the poll boundary as panics.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Upstream answered with a non-success HTTP status.
    #[error("upstream returned status {code}")]
    Status { code: u16 },
    /// The request did not complete within the given deadline.
    #[error("upstream request timed out")]
    Timeout,
    /// Connection-level failure (refused, reset, DNS, ...).
    #[error("upstream transport error: {0}")]
    Transport(String),
    /// The response body could not be decoded.
    #[error("failed to decode upstream response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else if err.is_decode() {
            FetchError::Decode(err.to_string())
        } else {
            FetchError::Transport(err.to_string())
        }
    }
}
