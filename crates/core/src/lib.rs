pub mod completion;
pub mod config;
pub mod context;
pub mod credential;
pub mod endpoint;
pub mod error;
pub mod logging;
pub mod outline;
pub mod persistence;
pub mod pipeline;
pub mod presenter;
pub mod prompts;
pub mod request;
pub mod state;
pub mod stream;
pub mod structured;

pub use completion::CompletionService;
pub use config::{BookBrief, ConfigError, RetryPolicy, Settings};
pub use context::{build_context, CONTEXT_PREVIEW_CHARS, FIRST_CHAPTER_CONTEXT};
pub use credential::{judge_credential, store_credential, CredentialVerdict};
pub use endpoint::{
    capabilities, endpoint_choice, is_supported_model, supported_models, EndpointChoice,
    ModelCapabilities,
};
pub use error::{GenerationError, Stage};
pub use logging::{
    LogLevel, LogRecord, LogSink, NullLogSink, SharedLogSink, StderrLogSink, VecLogSink,
};
pub use outline::{extract_chapter_titles, titles_from_structured, OutlineChapter};
pub use persistence::{FileGateway, MemoryGateway, PersistenceError, PersistenceGateway};
pub use pipeline::{resolve_titles, GenerationPipeline, StageOutcome};
pub use presenter::{
    NullPresenter, Presenter, PresenterEvent, RecordingPresenter, SharedPresenter,
};
pub use prompts::{PromptArguments, PromptError, PromptRegistry, PromptSource, PromptTemplate};
pub use request::{GenerationRequest, SamplingParams};
pub use state::{count_words, ChapterRecord, PipelineStage, PipelineState};
pub use stream::{collect_stream, delta_stream, StreamAggregator, StreamDelta};
pub use structured::{
    decode_or_else, decode_structured, extract_json_object, BookConcept, CharacterSketch,
    OutlineDocument,
};
