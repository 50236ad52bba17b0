//! The Concept → Outline → Chapters state machine.
//!
//! Every operation works on a copy of the caller's [`PipelineState`] and
//! writes it back only after the gateway has persisted it, so a failed step
//! leaves the caller's state exactly as it was before that step.

use chrono::Utc;

use crate::completion::CompletionService;
use crate::config::Settings;
use crate::context::build_context;
use crate::error::{GenerationError, Stage};
use crate::logging::LogSink;
use crate::outline::{extract_chapter_titles, titles_from_structured, OutlineChapter};
use crate::persistence::PersistenceGateway;
use crate::presenter::{NullPresenter, Presenter};
use crate::prompts::{keys, PromptArguments, PromptRegistry};
use crate::request::GenerationRequest;
use crate::state::{ChapterRecord, PipelineState};
use crate::stream::StreamDelta;
use crate::structured::{decode_or_else, extract_json_object, BookConcept, OutlineDocument};

const COMPONENT: &str = "pipeline";

static NULL_PRESENTER: NullPresenter = NullPresenter;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageOutcome {
    /// A generation was already running on this state; nothing was done.
    Skipped,
    Completed,
    /// Chapters were written but more remain; `next` is the new cursor.
    Paused { generated: usize, next: usize },
}

/// Sets `is_generating` for the lifetime of one operation and clears it on
/// every exit path, including a dropped future.
struct GeneratingGuard<'s> {
    state: &'s mut PipelineState,
}

impl<'s> GeneratingGuard<'s> {
    fn acquire(state: &'s mut PipelineState) -> Option<Self> {
        if state.is_generating {
            return None;
        }
        state.is_generating = true;
        Some(Self { state })
    }

    fn state(&self) -> &PipelineState {
        self.state
    }

    fn working_copy(&self) -> PipelineState {
        let mut copy = self.state.clone();
        copy.is_generating = false;
        copy
    }

    fn commit(&mut self, next: PipelineState) {
        *self.state = next;
        self.state.is_generating = true;
    }
}

impl Drop for GeneratingGuard<'_> {
    fn drop(&mut self) {
        self.state.is_generating = false;
    }
}

pub struct GenerationPipeline<'a> {
    prompts: &'a PromptRegistry,
    sink: &'a dyn LogSink,
    service: &'a dyn CompletionService,
    gateway: &'a dyn PersistenceGateway,
    presenter: &'a dyn Presenter,
    settings: Settings,
}

impl<'a> GenerationPipeline<'a> {
    pub fn new(
        prompts: &'a PromptRegistry,
        sink: &'a dyn LogSink,
        service: &'a dyn CompletionService,
        gateway: &'a dyn PersistenceGateway,
        settings: Settings,
    ) -> Self {
        Self {
            prompts,
            sink,
            service,
            gateway,
            presenter: &NULL_PRESENTER,
            settings,
        }
    }

    pub fn with_presenter(mut self, presenter: &'a dyn Presenter) -> Self {
        self.presenter = presenter;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub async fn generate_concept(
        &self,
        state: &mut PipelineState,
    ) -> Result<StageOutcome, GenerationError> {
        let Some(mut guard) = GeneratingGuard::acquire(state) else {
            return Ok(self.skipped(Stage::Concept));
        };

        self.progress("Generating book concept...");
        let brief = &self.settings.book;
        let prompt = self.prompts.format_with(
            keys::CONCEPT,
            [
                ("topic", brief.topic.trim().to_string()),
                ("genre", brief.genre.trim().to_string()),
                ("audience", brief.audience.trim().to_string()),
                ("chapter_count", brief.chapter_count.to_string()),
                ("words_per_chapter", brief.words_per_chapter.to_string()),
                ("guidance", brief.guidance.trim().to_string()),
            ],
        )?;
        let request = self.request(keys::CONCEPT_SYSTEM, prompt)?.structured();
        let text = non_empty(self.service.complete(&request).await?, Stage::Concept)?;

        let mut working = guard.working_copy();
        working.clear_outline();
        working.concept_details = Some(decode_or_else(&text, BookConcept::synthetic));
        working.concept = Some(text);
        self.checkpoint(&mut guard, working)?;

        self.sink.info(
            COMPONENT,
            format!("concept ready: {}", guard.state().book_title()),
        );
        self.presenter.stage_completed(Stage::Concept, guard.state());
        Ok(StageOutcome::Completed)
    }

    pub async fn generate_outline(
        &self,
        state: &mut PipelineState,
    ) -> Result<StageOutcome, GenerationError> {
        let Some(mut guard) = GeneratingGuard::acquire(state) else {
            return Ok(self.skipped(Stage::Outline));
        };
        let concept = guard.state().concept.clone().ok_or(GenerationError::StageOutOfOrder {
            stage: Stage::Outline,
            requires: Stage::Concept,
        })?;

        self.progress("Generating chapter outline...");
        let prompt = self.prompts.format_with(
            keys::OUTLINE,
            [
                ("concept", concept),
                ("chapter_count", self.settings.book.chapter_count.to_string()),
                ("guidance", self.settings.book.guidance.trim().to_string()),
            ],
        )?;
        let request = self.request(keys::OUTLINE_SYSTEM, prompt)?.structured();
        let text = non_empty(self.service.complete(&request).await?, Stage::Outline)?;
        let structured = structured_outline(&text)?;

        let mut working = guard.working_copy();
        working.clear_chapters();
        match structured {
            Some(chapters) => {
                working.outline = Some(render_outline(&chapters));
                working.outline_chapters = Some(chapters);
            }
            None => {
                working.outline = Some(text);
                working.outline_chapters = None;
            }
        }
        self.checkpoint(&mut guard, working)?;

        let titles = resolve_titles(guard.state());
        self.sink.info(
            COMPONENT,
            format!("outline ready with {} chapters", titles.len()),
        );
        if titles.is_empty() {
            self.sink.warn(
                COMPONENT,
                "outline contains no recognisable chapter titles".into(),
            );
        }
        self.presenter.stage_completed(Stage::Outline, guard.state());
        Ok(StageOutcome::Completed)
    }

    /// Write chapters from the cursor onward.
    ///
    /// With `auto_generate` unset exactly one chapter is written per call.
    /// Each finished chapter is persisted before the next one starts.
    pub async fn generate_chapters(
        &self,
        state: &mut PipelineState,
    ) -> Result<StageOutcome, GenerationError> {
        let Some(mut guard) = GeneratingGuard::acquire(state) else {
            return Ok(self.skipped(Stage::Chapters));
        };
        let mut working = guard.working_copy();
        require_outline(&working, Stage::Chapters)?;

        if working.chapters.is_empty() {
            let titles = resolve_titles(&working);
            if titles.is_empty() {
                return Err(GenerationError::NoChaptersFound);
            }
            working.chapters = titles.into_iter().map(ChapterRecord::placeholder).collect();
            working.cursor = 0;
        }

        let total = working.chapters.len();
        if working.cursor >= total {
            self.sink
                .info(COMPONENT, "all chapters are already written".into());
            return Ok(StageOutcome::Completed);
        }

        let mut generated = 0;
        loop {
            let index = working.cursor;
            self.progress(&format!(
                "Generating chapter {} of {}: {}",
                index + 1,
                total,
                working.chapters[index].title
            ));
            let content = self.write_chapter(&working, index).await?;

            working.chapters[index].complete(content, Utc::now());
            working.cursor = index + 1;
            self.checkpoint(&mut guard, working.clone())?;
            generated += 1;
            self.sink.info(
                COMPONENT,
                format!(
                    "chapter {} saved ({} words)",
                    index + 1,
                    working.chapters[index].word_count
                ),
            );

            if working.cursor >= total {
                self.presenter.stage_completed(Stage::Chapters, guard.state());
                return Ok(StageOutcome::Completed);
            }
            if !self.settings.auto_generate {
                return Ok(StageOutcome::Paused {
                    generated,
                    next: working.cursor,
                });
            }

            let delay = self.settings.chapter_delay();
            if !delay.is_zero() {
                self.progress(&format!(
                    "Waiting {:.1}s before chapter {}",
                    delay.as_secs_f32(),
                    working.cursor + 1
                ));
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Rewrite one already generated chapter in place. The cursor does not move.
    pub async fn regenerate_chapter(
        &self,
        state: &mut PipelineState,
        index: usize,
    ) -> Result<StageOutcome, GenerationError> {
        let Some(mut guard) = GeneratingGuard::acquire(state) else {
            return Ok(self.skipped(Stage::Chapters));
        };
        let mut working = guard.working_copy();
        require_outline(&working, Stage::Chapters)?;
        if !working.chapter(index).is_some_and(ChapterRecord::is_generated) {
            return Err(GenerationError::ChapterNotGenerated { index });
        }

        self.progress(&format!(
            "Regenerating chapter {}: {}",
            index + 1,
            working.chapters[index].title
        ));
        let content = self.write_chapter(&working, index).await?;
        working.chapters[index].complete(content, Utc::now());
        self.checkpoint(&mut guard, working)?;

        self.sink
            .info(COMPONENT, format!("chapter {} regenerated", index + 1));
        self.presenter.stage_completed(Stage::Chapters, guard.state());
        Ok(StageOutcome::Completed)
    }

    /// Clear every stage and persist the empty project.
    pub fn reset(&self, state: &mut PipelineState) -> Result<(), GenerationError> {
        let mut next = state.clone();
        next.clear();
        self.gateway.save_project(&next)?;
        *state = next;
        self.sink.info(COMPONENT, "project reset".into());
        self.progress("Project reset");
        Ok(())
    }

    /// Image prompt for the cover, built from the concept.
    pub fn cover_prompt(&self, state: &PipelineState) -> Result<String, GenerationError> {
        if !state.has_concept() {
            return Err(GenerationError::StageOutOfOrder {
                stage: Stage::Cover,
                requires: Stage::Concept,
            });
        }
        let details = state.concept_details.clone().unwrap_or_default();
        let genre = if details.genre.trim().is_empty() {
            self.settings.book.genre.trim().to_string()
        } else {
            details.genre.trim().to_string()
        };
        Ok(self.prompts.format_with(
            keys::COVER_IMAGE,
            [
                ("title", state.book_title().to_string()),
                ("genre", genre),
                ("logline", details.logline.trim().to_string()),
            ],
        )?)
    }

    async fn write_chapter(
        &self,
        state: &PipelineState,
        index: usize,
    ) -> Result<String, GenerationError> {
        let description = state
            .outline_chapters
            .as_ref()
            .and_then(|chapters| chapters.get(index))
            .map(|chapter| chapter.description.trim().to_string())
            .unwrap_or_default();
        let prompt = self.prompts.format_with(
            keys::CHAPTER,
            [
                ("concept", state.concept.clone().unwrap_or_default()),
                ("outline", state.outline.clone().unwrap_or_default()),
                ("chapter_number", (index + 1).to_string()),
                ("chapter_total", state.chapters.len().to_string()),
                ("chapter_title", state.chapters[index].title.clone()),
                ("chapter_description", description),
                ("previous_context", build_context(&state.chapters, index)),
                ("word_target", self.settings.book.words_per_chapter.to_string()),
            ],
        )?;
        let request = self.request(keys::CHAPTER_SYSTEM, prompt)?;

        let text = if self.settings.stream && request.capabilities().streams() {
            let presenter = self.presenter;
            let mut on_delta = |delta: &StreamDelta| presenter.token(delta);
            self.service
                .complete_streaming(&request.streaming(), &mut on_delta)
                .await?
        } else {
            self.service.complete(&request).await?
        };
        non_empty(text, Stage::Chapters)
    }

    fn request(&self, system_key: &str, prompt: String) -> Result<GenerationRequest, GenerationError> {
        let system = self.prompts.format(system_key, &PromptArguments::new())?;
        Ok(GenerationRequest::new(self.settings.model.trim(), system, prompt)
            .with_sampling(self.settings.sampling()))
    }

    fn checkpoint(
        &self,
        guard: &mut GeneratingGuard<'_>,
        next: PipelineState,
    ) -> Result<(), GenerationError> {
        self.gateway.save_project(&next)?;
        guard.commit(next);
        Ok(())
    }

    fn skipped(&self, stage: Stage) -> StageOutcome {
        self.sink.warn(
            COMPONENT,
            format!("{stage} requested while a generation is already running; ignored"),
        );
        StageOutcome::Skipped
    }

    fn progress(&self, message: &str) {
        self.sink.debug(COMPONENT, message.to_string());
        self.presenter.progress(message);
    }
}

/// Ordered chapter titles: the structured list when present, the outline text otherwise.
pub fn resolve_titles(state: &PipelineState) -> Vec<String> {
    if let Some(chapters) = &state.outline_chapters {
        let titles = titles_from_structured(chapters);
        if !titles.is_empty() {
            return titles;
        }
    }
    state
        .outline
        .as_deref()
        .map(extract_chapter_titles)
        .unwrap_or_default()
}

fn require_outline(state: &PipelineState, stage: Stage) -> Result<(), GenerationError> {
    if !state.has_concept() {
        return Err(GenerationError::StageOutOfOrder {
            stage,
            requires: Stage::Concept,
        });
    }
    if !state.has_outline() {
        return Err(GenerationError::StageOutOfOrder {
            stage,
            requires: Stage::Outline,
        });
    }
    Ok(())
}

/// Chapter list from a JSON outline.
///
/// `Ok(None)` means the text holds no JSON object and is treated as prose.
/// A JSON object without usable chapter titles is rejected rather than
/// parsed line by line.
fn structured_outline(text: &str) -> Result<Option<Vec<OutlineChapter>>, GenerationError> {
    let Some(value) = extract_json_object(text) else {
        return Ok(None);
    };
    let document: OutlineDocument = serde_json::from_value(value).map_err(|err| {
        GenerationError::MalformedUpstreamResponse(format!("outline JSON could not be read: {err}"))
    })?;
    let mut chapters: Vec<OutlineChapter> = document
        .chapters
        .into_iter()
        .filter(|chapter| !chapter.title.trim().is_empty())
        .collect();
    if chapters.is_empty() {
        return Err(GenerationError::MalformedUpstreamResponse(
            "outline JSON contains no chapter titles".to_string(),
        ));
    }
    for (position, chapter) in chapters.iter_mut().enumerate() {
        if chapter.number == 0 {
            chapter.number = position as u32 + 1;
        }
    }
    Ok(Some(chapters))
}

fn render_outline(chapters: &[OutlineChapter]) -> String {
    chapters
        .iter()
        .map(|chapter| {
            let title = chapter.title.trim();
            let description = chapter.description.trim();
            if description.is_empty() {
                format!("Chapter {}: {}", chapter.number, title)
            } else {
                format!("Chapter {}: {} - {}", chapter.number, title, description)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn non_empty(text: String, stage: Stage) -> Result<String, GenerationError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(GenerationError::MalformedUpstreamResponse(format!(
            "the {stage} response was empty"
        )));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outlined(text: &str, structured: Option<Vec<OutlineChapter>>) -> PipelineState {
        let mut state = PipelineState::new();
        state.concept = Some("concept".into());
        state.outline = Some(text.into());
        state.outline_chapters = structured;
        state
    }

    #[test]
    fn structured_list_wins_over_outline_text() {
        let state = outlined(
            "Chapter 1: Ignored",
            Some(vec![OutlineChapter {
                number: 1,
                title: "Kept".into(),
                description: String::new(),
            }]),
        );
        assert_eq!(resolve_titles(&state), vec!["Kept"]);
    }

    #[test]
    fn free_text_is_the_fallback() {
        let state = outlined("Chapter 1: Intro - a\nChapter 2: Middle - b", Some(vec![]));
        assert_eq!(resolve_titles(&state), vec!["Intro", "Middle"]);
    }

    #[test]
    fn structured_outline_numbers_missing_ordinals() {
        let chapters = structured_outline(
            r#"{"chapters":[{"title":"One","description":"first"},{"title":""},{"title":"Two"}]}"#,
        )
        .unwrap()
        .expect("structured");
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[1].number, 2);
        assert_eq!(
            render_outline(&chapters),
            "Chapter 1: One - first\nChapter 2: Two"
        );
        assert_eq!(
            extract_chapter_titles(&render_outline(&chapters)),
            vec!["One", "Two"]
        );
    }

    #[test]
    fn prose_outline_is_not_structured() {
        assert_eq!(structured_outline("Chapter 1: Intro").unwrap(), None);
    }

    #[test]
    fn json_outline_without_titles_is_rejected() {
        for text in [
            r#"{"chapters":[]}"#,
            r#"{"chapters":[{"number":"1","title":"  "}]}"#,
            r#"{"title":"The Salt Road"}"#,
            r#"{"chapters":"Intro, Rising Action"}"#,
        ] {
            assert!(
                matches!(
                    structured_outline(text),
                    Err(GenerationError::MalformedUpstreamResponse(_))
                ),
                "{text}"
            );
        }
    }

    #[test]
    fn blank_responses_are_malformed() {
        assert!(matches!(
            non_empty("  \n".into(), Stage::Concept),
            Err(GenerationError::MalformedUpstreamResponse(_))
        ));
        assert_eq!(non_empty(" text ".into(), Stage::Concept).unwrap(), "text");
    }

    #[test]
    fn guard_clears_flag_when_dropped() {
        let mut state = PipelineState::new();
        {
            let guard = GeneratingGuard::acquire(&mut state).expect("free");
            assert!(guard.state().is_generating);
        }
        assert!(!state.is_generating);

        state.is_generating = true;
        assert!(GeneratingGuard::acquire(&mut state).is_none());
        assert!(state.is_generating);
    }
}
