use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::error::GenerationError;
use crate::request::SamplingParams;

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_output_tokens() -> u32 {
    4096
}

fn default_true() -> bool {
    true
}

fn default_chapter_delay_ms() -> u64 {
    2_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_unit_ms() -> u64 {
    1_000
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_timeout() -> u64 {
    600
}

fn default_image_model() -> String {
    "gpt-image-1".to_string()
}

fn default_image_size() -> String {
    "1024x1024".to_string()
}

fn default_chapter_count() -> u32 {
    10
}

fn default_words_per_chapter() -> u32 {
    2_000
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access settings: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings: {0}")]
    Parse(#[from] serde_json::Error),
}

/// What the book is about; feeds the concept prompt.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BookBrief {
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub genre: String,
    #[serde(default)]
    pub audience: String,
    #[serde(default = "default_chapter_count")]
    pub chapter_count: u32,
    #[serde(default = "default_words_per_chapter")]
    pub words_per_chapter: u32,
    #[serde(default)]
    pub guidance: String,
}

impl Default for BookBrief {
    fn default() -> Self {
        Self {
            topic: String::new(),
            genre: String::new(),
            audience: String::new(),
            chapter_count: default_chapter_count(),
            words_per_chapter: default_words_per_chapter(),
            guidance: String::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default)]
    pub seed: Option<u64>,
    /// Stream chapter text when the model supports it.
    #[serde(default = "default_true")]
    pub stream: bool,
    #[serde(default = "default_true")]
    pub auto_generate: bool,
    #[serde(default = "default_chapter_delay_ms")]
    pub chapter_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_unit_ms")]
    pub backoff_unit_ms: u64,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_image_model")]
    pub image_model: String,
    #[serde(default = "default_image_size")]
    pub image_size: String,
    /// Keep a credential even when validating it failed.
    #[serde(default = "default_true")]
    pub allow_unverified_credential: bool,
    #[serde(default)]
    pub prompt_directories: Vec<PathBuf>,
    #[serde(default)]
    pub book: BookBrief,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model: default_model(),
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
            seed: None,
            stream: true,
            auto_generate: true,
            chapter_delay_ms: default_chapter_delay_ms(),
            max_attempts: default_max_attempts(),
            backoff_unit_ms: default_backoff_unit_ms(),
            base_url: default_base_url(),
            timeout: default_timeout(),
            image_model: default_image_model(),
            image_size: default_image_size(),
            allow_unverified_credential: true,
            prompt_directories: Vec::new(),
            book: BookBrief::default(),
        }
    }
}

impl Settings {
    pub fn sampling(&self) -> SamplingParams {
        SamplingParams {
            temperature: self.temperature,
            max_output_tokens: self.max_output_tokens,
            seed: self.seed,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.backoff_unit_ms))
    }

    pub fn chapter_delay(&self) -> Duration {
        Duration::from_millis(self.chapter_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.max(1))
    }

    pub fn from_json_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(input)?)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    pub fn to_path(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let serialized = serde_json::to_string_pretty(self)?;
        fs::write(path, serialized)?;
        Ok(())
    }

    /// Apply a `key=value` override as used by `bookctl settings set`.
    pub fn set_field(&mut self, key: &str, value: &str) -> Result<(), String> {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, String> {
            value
                .trim()
                .parse()
                .map_err(|_| format!("invalid value `{value}` for `{key}`"))
        }

        match key {
            "model" => self.model = value.trim().to_string(),
            "temperature" => self.temperature = parse(key, value)?,
            "max_output_tokens" => self.max_output_tokens = parse(key, value)?,
            "seed" => {
                self.seed = if value.trim().is_empty() || value.trim() == "none" {
                    None
                } else {
                    Some(parse(key, value)?)
                }
            }
            "stream" => self.stream = parse(key, value)?,
            "auto_generate" => self.auto_generate = parse(key, value)?,
            "chapter_delay_ms" => self.chapter_delay_ms = parse(key, value)?,
            "max_attempts" => self.max_attempts = parse(key, value)?,
            "backoff_unit_ms" => self.backoff_unit_ms = parse(key, value)?,
            "base_url" => self.base_url = value.trim().to_string(),
            "timeout" => self.timeout = parse(key, value)?,
            "image_model" => self.image_model = value.trim().to_string(),
            "image_size" => self.image_size = value.trim().to_string(),
            "allow_unverified_credential" => {
                self.allow_unverified_credential = parse(key, value)?
            }
            "book.topic" => self.book.topic = value.to_string(),
            "book.genre" => self.book.genre = value.to_string(),
            "book.audience" => self.book.audience = value.to_string(),
            "book.chapter_count" => self.book.chapter_count = parse(key, value)?,
            "book.words_per_chapter" => self.book.words_per_chapter = parse(key, value)?,
            "book.guidance" => self.book.guidance = value.to_string(),
            other => return Err(format!("unknown setting `{other}`")),
        }
        Ok(())
    }
}

/// Attempt budget and backoff unit for one dispatcher call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_unit: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, base_unit: Duration) -> Self {
        Self {
            max_attempts,
            base_unit,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Wait after failed `attempt` (1-based): `2^attempt` units when rate
    /// limited, `attempt` units for other retryable failures.
    pub fn backoff(&self, attempt: u32, error: &GenerationError) -> Duration {
        let units = match error {
            GenerationError::RateLimited { .. } => 1u32.checked_shl(attempt).unwrap_or(u32::MAX),
            _ => attempt,
        };
        self.base_unit.saturating_mul(units)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(default_max_attempts(), Duration::from_millis(default_backoff_unit_ms()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn empty_document_yields_defaults() {
        let settings = Settings::from_json_str("  ").unwrap();
        assert_eq!(settings, Settings::default());
        assert!(settings.allow_unverified_credential);
    }

    #[test]
    fn partial_document_fills_missing_fields() {
        let settings =
            Settings::from_json_str(r#"{"model":"o3","book":{"topic":"tides"}}"#).unwrap();
        assert_eq!(settings.model, "o3");
        assert_eq!(settings.book.topic, "tides");
        assert_eq!(settings.book.chapter_count, 10);
        assert_eq!(settings.max_attempts, 3);
    }

    #[test]
    fn settings_persist_to_disk() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("nested").join("settings.json");
        let mut settings = Settings::default();
        settings.seed = Some(42);
        settings.book.genre = "mystery".into();
        settings.to_path(&path).unwrap();

        assert_eq!(Settings::from_path(&path).unwrap(), settings);
    }

    #[test]
    fn set_field_parses_typed_values() {
        let mut settings = Settings::default();
        settings.set_field("temperature", "0.2").unwrap();
        settings.set_field("auto_generate", "false").unwrap();
        settings.set_field("seed", "7").unwrap();
        settings.set_field("book.chapter_count", "3").unwrap();
        assert_eq!(settings.temperature, 0.2);
        assert!(!settings.auto_generate);
        assert_eq!(settings.seed, Some(7));
        assert_eq!(settings.book.chapter_count, 3);

        settings.set_field("seed", "none").unwrap();
        assert_eq!(settings.seed, None);
        assert!(settings.set_field("max_attempts", "many").is_err());
        assert!(settings.set_field("colour", "blue").is_err());
    }

    #[test]
    fn backoff_is_exponential_only_for_rate_limits() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100));
        let limited = GenerationError::rate_limited(None, "slow");
        let unavailable = GenerationError::ServiceUnavailable("503".into());

        assert_eq!(policy.backoff(1, &limited), Duration::from_millis(200));
        assert_eq!(policy.backoff(3, &limited), Duration::from_millis(800));
        assert_eq!(policy.backoff(1, &unavailable), Duration::from_millis(100));
        assert_eq!(policy.backoff(3, &unavailable), Duration::from_millis(300));
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        assert_eq!(RetryPolicy::new(0, Duration::from_secs(1)).attempts(), 1);
    }
}
