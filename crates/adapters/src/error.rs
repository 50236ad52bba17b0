use bookgen_core::GenerationError;
use thiserror::Error;

/// Failures while building a dispatcher. Request-time failures are
/// [`GenerationError`]s.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("failed to build http client: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid dispatcher configuration: {0}")]
    InvalidConfig(String),
}

/// Classify a transport-level reqwest failure.
pub(crate) fn transport_error(err: reqwest::Error) -> GenerationError {
    if err.is_decode() {
        GenerationError::MalformedUpstreamResponse(err.to_string())
    } else {
        GenerationError::Transport(err.to_string())
    }
}
