use once_cell::sync::Lazy;
use regex::Regex;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

static VERSION_SUFFIX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"/v\d+$").unwrap());

/// Normalise a user-entered API root.
///
/// Empty input falls back to the public endpoint. A trailing `#` means
/// "use verbatim"; otherwise `/v1` is appended when no version segment is
/// present.
pub fn normalize_base_url(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return DEFAULT_BASE_URL.to_string();
    }
    if let Some(verbatim) = trimmed.strip_suffix('#') {
        return verbatim.trim_end_matches('/').to_string();
    }

    let without_slash = trimmed.trim_end_matches('/');
    if VERSION_SUFFIX_RE.is_match(without_slash) || without_slash.contains("/v1/") {
        without_slash.to_string()
    } else {
        format!("{without_slash}/v1")
    }
}

pub fn endpoint_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
