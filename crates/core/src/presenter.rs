use std::sync::{Arc, Mutex};

use crate::error::Stage;
use crate::state::PipelineState;
use crate::stream::StreamDelta;

/// Receives user-visible events while the pipeline runs. Every method
/// defaults to doing nothing.
pub trait Presenter: Send + Sync {
    /// Short status line, e.g. a retry countdown or "Generating chapter 3".
    fn progress(&self, _message: &str) {}

    /// Streamed chapter text as it arrives.
    fn token(&self, _delta: &StreamDelta) {}

    /// Called after a stage result has been persisted.
    fn stage_completed(&self, _stage: Stage, _state: &PipelineState) {}
}

pub type SharedPresenter = Arc<dyn Presenter>;

#[derive(Default)]
pub struct NullPresenter;

impl Presenter for NullPresenter {}

/// What a [`RecordingPresenter`] saw, in arrival order.
#[derive(Clone, Debug, PartialEq)]
pub enum PresenterEvent {
    Progress(String),
    Token(StreamDelta),
    StageCompleted(Stage),
}

/// Collects events in memory.
#[derive(Default)]
pub struct RecordingPresenter {
    events: Mutex<Vec<PresenterEvent>>,
}

impl RecordingPresenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PresenterEvent> {
        self.events
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn progress_messages(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                PresenterEvent::Progress(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn completed_stages(&self) -> Vec<Stage> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                PresenterEvent::StageCompleted(stage) => Some(stage),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: PresenterEvent) {
        if let Ok(mut guard) = self.events.lock() {
            guard.push(event);
        }
    }
}

impl Presenter for RecordingPresenter {
    fn progress(&self, message: &str) {
        self.push(PresenterEvent::Progress(message.to_string()));
    }

    fn token(&self, delta: &StreamDelta) {
        self.push(PresenterEvent::Token(delta.clone()));
    }

    fn stage_completed(&self, stage: Stage, _state: &PipelineState) {
        self.push(PresenterEvent::StageCompleted(stage));
    }
}
