use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde_json::Value;

use bookgen_core::GenerationError;

const REMAINING_REQUESTS: &str = "x-ratelimit-remaining-requests";
const REMAINING_TOKENS: &str = "x-ratelimit-remaining-tokens";
const RESET_REQUESTS: &str = "x-ratelimit-reset-requests";
const RESET_TOKENS: &str = "x-ratelimit-reset-tokens";
const RETRY_AFTER_MS: &str = "retry-after-ms";

static DURATION_PART_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+(?:\.\d+)?)(ms|h|m|s)").unwrap());

/// Quota state as last reported by the service. Fields the service did not
/// mention keep their previous values.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RateLimitSnapshot {
    pub remaining_requests: Option<u64>,
    pub remaining_tokens: Option<u64>,
    pub reset_requests: Option<Duration>,
    pub reset_tokens: Option<Duration>,
}

impl RateLimitSnapshot {
    pub fn update(&mut self, headers: &HeaderMap) {
        if let Some(value) = header_str(headers, REMAINING_REQUESTS).and_then(|v| v.parse().ok()) {
            self.remaining_requests = Some(value);
        }
        if let Some(value) = header_str(headers, REMAINING_TOKENS).and_then(|v| v.parse().ok()) {
            self.remaining_tokens = Some(value);
        }
        if let Some(value) = header_str(headers, RESET_REQUESTS).and_then(parse_reset_duration) {
            self.reset_requests = Some(value);
        }
        if let Some(value) = header_str(headers, RESET_TOKENS).and_then(parse_reset_duration) {
            self.reset_tokens = Some(value);
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining_requests == Some(0) || self.remaining_tokens == Some(0)
    }
}

/// Parse reset hints such as `1s`, `250ms`, `6m0s` or `1h2m3.5s`.
pub fn parse_reset_duration(text: &str) -> Option<Duration> {
    let text = text.trim();
    if let Ok(seconds) = text.parse::<f64>() {
        return Duration::try_from_secs_f64(seconds).ok();
    }

    let mut total = Duration::ZERO;
    let mut matched = false;
    for caps in DURATION_PART_RE.captures_iter(text) {
        let amount: f64 = caps[1].parse().ok()?;
        let seconds = match &caps[2] {
            "h" => amount * 3600.0,
            "m" => amount * 60.0,
            "s" => amount,
            _ => amount / 1000.0,
        };
        total += Duration::try_from_secs_f64(seconds).ok()?;
        matched = true;
    }
    matched.then_some(total)
}

/// Server-suggested wait for a rate-limited response.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    if let Some(ms) = header_str(headers, RETRY_AFTER_MS).and_then(|v| v.parse::<u64>().ok()) {
        return Some(Duration::from_millis(ms));
    }
    if let Some(seconds) = headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
    {
        return Duration::try_from_secs_f64(seconds).ok();
    }
    header_str(headers, RESET_REQUESTS).and_then(parse_reset_duration)
}

/// Map a non-success response onto the error taxonomy.
pub fn classify_failure(status: StatusCode, headers: &HeaderMap, body: &str) -> GenerationError {
    let (message, code) = upstream_error(body);
    let message = if message.is_empty() {
        format!("http {status}")
    } else {
        message
    };

    match status.as_u16() {
        401 | 403 => GenerationError::InvalidCredential(message),
        429 if code.as_deref() == Some("insufficient_quota") => GenerationError::Other(message),
        429 => GenerationError::rate_limited(retry_after(headers), message),
        408 | 500..=599 => GenerationError::ServiceUnavailable(message),
        _ => GenerationError::Other(message),
    }
}

/// `(message, code)` from an `{"error": {...}}` body, or the raw text.
fn upstream_error(body: &str) -> (String, Option<String>) {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return (body.trim().to_string(), None);
    };
    let error = value.get("error").unwrap_or(&value);
    let message = match error {
        Value::String(text) => text.clone(),
        _ => error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    };
    let code = error
        .get("code")
        .or_else(|| error.get("type"))
        .and_then(Value::as_str)
        .map(str::to_string);
    (message, code)
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
