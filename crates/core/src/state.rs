use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::outline::OutlineChapter;
use crate::structured::BookConcept;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum PipelineStage {
    Empty,
    ConceptReady,
    OutlineReady,
    ChaptersInProgress,
    ChaptersComplete,
}

impl PipelineStage {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::ConceptReady => "concept ready",
            Self::OutlineReady => "outline ready",
            Self::ChaptersInProgress => "chapters in progress",
            Self::ChaptersComplete => "chapters complete",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One chapter slot. A slot without a timestamp is a placeholder.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterRecord {
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub word_count: usize,
}

impl ChapterRecord {
    pub fn placeholder(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content: String::new(),
            generated_at: None,
            word_count: 0,
        }
    }

    pub fn is_generated(&self) -> bool {
        self.generated_at.is_some()
    }

    pub fn complete(&mut self, content: String, at: DateTime<Utc>) {
        self.word_count = count_words(&content);
        self.content = content;
        self.generated_at = Some(at);
    }
}

pub fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

/// The durable project.
///
/// Invariants kept by the pipeline: chapter slots follow outline order,
/// `cursor <= chapters.len()`, an outline only exists after a concept, and
/// chapter slots only exist after an outline.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concept: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concept_details: Option<BookConcept>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outline_chapters: Option<Vec<OutlineChapter>>,
    #[serde(default)]
    pub chapters: Vec<ChapterRecord>,
    #[serde(default)]
    pub cursor: usize,
    /// Session-local reentrancy guard; never persisted.
    #[serde(skip)]
    pub is_generating: bool,
}

impl PipelineState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&self) -> PipelineStage {
        if self.concept.is_none() {
            PipelineStage::Empty
        } else if self.outline.is_none() {
            PipelineStage::ConceptReady
        } else if self.chapters.is_empty() || !self.chapters.iter().any(ChapterRecord::is_generated)
        {
            PipelineStage::OutlineReady
        } else if self.cursor < self.chapters.len() {
            PipelineStage::ChaptersInProgress
        } else {
            PipelineStage::ChaptersComplete
        }
    }

    pub fn has_concept(&self) -> bool {
        self.concept.is_some()
    }

    pub fn has_outline(&self) -> bool {
        self.outline.is_some()
    }

    pub fn chapter(&self, index: usize) -> Option<&ChapterRecord> {
        self.chapters.get(index)
    }

    /// `(generated, total)` chapter slots.
    pub fn progress(&self) -> (usize, usize) {
        let generated = self.chapters.iter().filter(|c| c.is_generated()).count();
        (generated, self.chapters.len())
    }

    pub fn total_words(&self) -> usize {
        self.chapters.iter().map(|c| c.word_count).sum()
    }

    pub fn book_title(&self) -> &str {
        self.concept_details
            .as_ref()
            .map(BookConcept::display_title)
            .unwrap_or(BookConcept::UNTITLED)
    }

    /// Drop everything that was derived from the outline.
    pub(crate) fn clear_chapters(&mut self) {
        self.chapters.clear();
        self.cursor = 0;
    }

    /// Drop everything that was derived from the concept.
    pub(crate) fn clear_outline(&mut self) {
        self.outline = None;
        self.outline_chapters = None;
        self.clear_chapters();
    }

    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn check_invariants(&self) -> Result<(), String> {
        if self.cursor > self.chapters.len() {
            return Err(format!(
                "cursor {} is past the {} chapter slots",
                self.cursor,
                self.chapters.len()
            ));
        }
        if self.outline.is_some() && self.concept.is_none() {
            return Err("outline exists without a concept".to_string());
        }
        if !self.chapters.is_empty() && self.outline.is_none() {
            return Err("chapters exist without an outline".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()
    }

    #[test]
    fn stage_follows_content() {
        let mut state = PipelineState::new();
        assert_eq!(state.stage(), PipelineStage::Empty);

        state.concept = Some("concept".into());
        assert_eq!(state.stage(), PipelineStage::ConceptReady);

        state.outline = Some("Chapter 1: A\nChapter 2: B".into());
        assert_eq!(state.stage(), PipelineStage::OutlineReady);

        state.chapters = vec![ChapterRecord::placeholder("A"), ChapterRecord::placeholder("B")];
        assert_eq!(state.stage(), PipelineStage::OutlineReady);

        state.chapters[0].complete("one two".into(), at());
        state.cursor = 1;
        assert_eq!(state.stage(), PipelineStage::ChaptersInProgress);

        state.chapters[1].complete("three".into(), at());
        state.cursor = 2;
        assert_eq!(state.stage(), PipelineStage::ChaptersComplete);
        assert_eq!(state.progress(), (2, 2));
        assert_eq!(state.total_words(), 3);
        assert!(state.check_invariants().is_ok());
    }

    #[test]
    fn word_count_uses_whitespace_tokens() {
        assert_eq!(count_words("  The quick\n\tbrown  fox "), 4);
        assert_eq!(count_words(""), 0);
    }

    #[test]
    fn json_round_trip_preserves_everything_but_the_session_flag() {
        let mut state = PipelineState::new();
        state.concept = Some("A lighthouse keeper".into());
        state.concept_details = Some(BookConcept::synthetic("A lighthouse keeper"));
        state.outline = Some("Chapter 1: Storm\nChapter 2: Calm".into());
        state.outline_chapters = Some(vec![OutlineChapter {
            number: 1,
            title: "Storm".into(),
            description: "it rains".into(),
        }]);
        state.chapters = vec![ChapterRecord::placeholder("Storm"), ChapterRecord::placeholder("Calm")];
        state.chapters[0].complete("Rain fell.".into(), at());
        state.cursor = 1;

        let json = serde_json::to_string(&state).unwrap();
        let restored: PipelineState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, state);

        state.is_generating = true;
        let restored: PipelineState =
            serde_json::from_str(&serde_json::to_string(&state).unwrap()).unwrap();
        assert!(!restored.is_generating);
    }

    #[test]
    fn invariant_violations_are_reported() {
        let mut state = PipelineState::new();
        state.cursor = 1;
        assert!(state.check_invariants().is_err());

        let mut state = PipelineState::new();
        state.outline = Some("x".into());
        assert!(state.check_invariants().is_err());
    }
}
