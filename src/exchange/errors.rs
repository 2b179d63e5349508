// =============================================================================
// Error taxonomy for the exchange transport layer (spec.md §7)
// =============================================================================

use thiserror::Error;

/// WS session failure. Recovered locally by `SourceManager` (failover + backoff).
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("websocket connect failed: {0}")]
    Connect(String),
    #[error("websocket closed by peer")]
    Closed,
    #[error("websocket read deadline exceeded")]
    ReadTimeout,
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// REST network/timeout/5xx failure.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("server error: status {0}")]
    ServerError(u16),
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
}

/// Malformed upstream payload shape. Folds into `TransportError` for the
/// affected item (spec.md §7).
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("unexpected shape: {0}")]
    UnexpectedShape(String),
    #[error("numeric parse failure for {field}: {value}")]
    NumericParse { field: &'static str, value: String },
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if let Some(status) = err.status() {
            TransportError::ServerError(status.as_u16())
        } else {
            TransportError::Network(err.to_string())
        }
    }
}
