use std::future::Future;

use log::warn;

use bookgen_core::{GenerationError, Presenter, RetryPolicy};

/// Run `operation` up to `policy.attempts()` times.
///
/// Rate limits wait `2^attempt` base units before the next attempt, other
/// retryable failures wait `attempt` units. Non-retryable errors and the
/// error of the final attempt are returned untouched. Each wait is announced
/// through `presenter`.
pub async fn generate_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    presenter: &dyn Presenter,
    mut operation: F,
) -> Result<T, GenerationError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, GenerationError>>,
{
    let attempts = policy.attempts();
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts && err.is_retryable() => {
                let wait = policy.backoff(attempt, &err);
                warn!(
                    "[generate_with_retry] attempt {}/{} failed: {}; retrying in {:?}",
                    attempt, attempts, err, wait
                );
                presenter.progress(&format!(
                    "{} Retrying in {:.1}s (attempt {} of {})",
                    retry_reason(&err),
                    wait.as_secs_f32(),
                    attempt + 1,
                    attempts
                ));
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn retry_reason(err: &GenerationError) -> &'static str {
    match err {
        GenerationError::RateLimited { .. } => "Rate limited.",
        GenerationError::ServiceUnavailable(_) => "Service unavailable.",
        _ => "Connection problem.",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bookgen_core::{NullPresenter, RecordingPresenter};
    use std::cell::Cell;
    use std::time::Duration;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn rate_limits_back_off_exponentially_then_reraise() {
        let policy = RetryPolicy::new(4, Duration::from_secs(1));
        let presenter = RecordingPresenter::new();
        let calls = Cell::new(0);
        let started = Instant::now();

        let result: Result<(), _> = generate_with_retry(&policy, &presenter, |attempt| {
            calls.set(calls.get() + 1);
            async move { Err(GenerationError::rate_limited(None, format!("limited #{attempt}"))) }
        })
        .await;

        assert_eq!(calls.get(), 4);
        match result {
            Err(GenerationError::RateLimited { message, .. }) => assert_eq!(message, "limited #4"),
            other => panic!("unexpected: {other:?}"),
        }
        // 2 + 4 + 8 units
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(14) && elapsed < Duration::from_millis(14_050));
        assert_eq!(presenter.progress_messages().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_back_off_linearly() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        let calls = Cell::new(0);
        let started = Instant::now();

        let result = generate_with_retry(&policy, &NullPresenter, |attempt| {
            calls.set(calls.get() + 1);
            async move {
                if attempt < 3 {
                    Err(GenerationError::ServiceUnavailable("503".into()))
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.get(), 3);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300) && elapsed < Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn credential_errors_are_not_retried() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1));
        let calls = Cell::new(0);
        let started = Instant::now();

        let result: Result<(), _> = generate_with_retry(&policy, &NullPresenter, |_| {
            calls.set(calls.get() + 1);
            async { Err(GenerationError::InvalidCredential("401".into())) }
        })
        .await;

        assert!(matches!(result, Err(GenerationError::InvalidCredential(_))));
        assert_eq!(calls.get(), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
