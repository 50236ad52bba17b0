use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::persistence::PersistenceError;
use crate::prompts::PromptError;

/// A pipeline phase with its own prompt and prerequisite.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Stage {
    Concept,
    Outline,
    Chapters,
    Cover,
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Concept => "concept",
            Self::Outline => "outline",
            Self::Chapters => "chapters",
            Self::Cover => "cover",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("no API key is configured; add one before generating")]
    CredentialMissing,
    #[error("the API key was rejected by the completion service: {0}")]
    InvalidCredential(String),
    #[error("rate limited by the completion service: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },
    #[error("the completion service is temporarily unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("malformed response from the completion service: {0}")]
    MalformedUpstreamResponse(String),
    #[error("network failure while contacting the completion service: {0}")]
    Transport(String),
    #[error("{0}")]
    Other(String),
    #[error("the outline did not contain any chapter titles")]
    NoChaptersFound,
    #[error("cannot generate the {stage} before the {requires} exists")]
    StageOutOfOrder { stage: Stage, requires: Stage },
    #[error("chapter {} has not been generated yet", .index + 1)]
    ChapterNotGenerated { index: usize },
    #[error("failed to render prompt: {0}")]
    Prompt(#[from] PromptError),
    #[error("failed to persist project state: {0}")]
    Persistence(#[from] PersistenceError),
}

impl GenerationError {
    pub fn rate_limited(retry_after: Option<Duration>, message: impl Into<String>) -> Self {
        Self::RateLimited {
            retry_after,
            message: message.into(),
        }
    }

    /// Only rate limits and transient upstream or network faults are retried locally.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::ServiceUnavailable(_) | Self::Transport(_)
        )
    }

    /// Errors the user fixes by entering a different API key.
    pub fn is_credential_problem(&self) -> bool {
        matches!(self, Self::CredentialMissing | Self::InvalidCredential(_))
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
