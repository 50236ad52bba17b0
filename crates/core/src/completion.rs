use async_trait::async_trait;

use crate::error::GenerationError;
use crate::request::GenerationRequest;
use crate::stream::StreamDelta;

/// The seam between the pipeline and whatever performs completions.
///
/// Implementations own endpoint selection, retries and rate-limit tracking;
/// errors reaching the caller have already exhausted any local retry budget.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, request: &GenerationRequest) -> Result<String, GenerationError>;

    /// Like [`complete`](Self::complete) but reports text as it arrives.
    ///
    /// `on_delta` sees one delta per token and then exactly one delta with
    /// `is_final` set; the returned text equals that final aggregate.
    async fn complete_streaming(
        &self,
        request: &GenerationRequest,
        on_delta: &mut (dyn for<'d> FnMut(&'d StreamDelta) + Send),
    ) -> Result<String, GenerationError>;
}
