mod base_url;
mod error;
mod image;
mod llm;
mod payload;
mod rate_limit;
mod retry;
#[cfg(test)]
mod test_support;

pub use base_url::{endpoint_url, normalize_base_url, DEFAULT_BASE_URL};
pub use error::AdapterError;
pub use llm::{RequestDispatcher, VALIDATION_MODEL};
pub use rate_limit::{classify_failure, parse_reset_duration, retry_after, RateLimitSnapshot};
pub use retry::generate_with_retry;

pub use bookgen_core::{CompletionService, GenerationError, GenerationRequest, StreamDelta};
