use bookgen_adapters::{AdapterError, RequestDispatcher};
use bookgen_core::{
    store_credential, CredentialVerdict, FileGateway, GenerationError, GenerationPipeline,
    LogLevel, LogSink, PersistenceError, PersistenceGateway, PipelineState, Presenter,
    PromptError, PromptRegistry, Settings, Stage, StageOutcome, StderrLogSink, StreamDelta,
};
use clap::{Args, Parser, Subcommand};
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

const COMPONENT: &str = "cli";

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(CliError::Runtime)?;
    runtime.block_on(dispatch(cli))
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    let level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let session = Session::open(cli.data_dir, level)?;

    match cli.command {
        Command::Settings(command) => handle_settings(&session, command),
        Command::Credential(command) => handle_credential(&session, command).await,
        Command::Concept => run_concept(&session).await,
        Command::Outline => run_outline(&session).await,
        Command::Chapters(args) => run_chapters(&session, args).await,
        Command::Chapter(command) => handle_chapter(&session, command).await,
        Command::Status => show_status(&session),
        Command::Reset => run_reset(&session),
        Command::Cover(args) => run_cover(&session, args).await,
    }
}

/// Everything a command needs, loaded once from the data directory.
struct Session {
    gateway: FileGateway,
    settings: Settings,
    prompts: PromptRegistry,
    sink: StderrLogSink,
}

impl Session {
    fn open(data_dir: PathBuf, level: LogLevel) -> Result<Self, CliError> {
        let gateway = FileGateway::new(data_dir);
        let settings = gateway.load_settings()?;
        let prompts = PromptRegistry::from_settings(&settings)?;
        prompts.ensure_pipeline_keys()?;
        Ok(Self {
            gateway,
            settings,
            prompts,
            sink: StderrLogSink::new(level),
        })
    }

    fn dispatcher(&self, credential: Option<String>) -> Result<RequestDispatcher, CliError> {
        Ok(RequestDispatcher::from_settings(&self.settings, credential)?
            .with_presenter(Arc::new(ConsolePresenter)))
    }

    fn stored_dispatcher(&self) -> Result<RequestDispatcher, CliError> {
        let credential = self.gateway.load_credential()?;
        if credential.is_none() {
            return Err(CliError::Generation(GenerationError::CredentialMissing));
        }
        self.dispatcher(credential)
    }

    fn load_project(&self) -> Result<PipelineState, CliError> {
        Ok(self.gateway.load_last_project()?.unwrap_or_default())
    }
}

/// Prints progress to stderr and streamed chapter text to stdout.
struct ConsolePresenter;

impl Presenter for ConsolePresenter {
    fn progress(&self, message: &str) {
        eprintln!("» {message}");
    }

    fn token(&self, delta: &StreamDelta) {
        let mut stdout = io::stdout().lock();
        if delta.is_final {
            let _ = writeln!(stdout);
        } else {
            let _ = write!(stdout, "{}", delta.token);
        }
        let _ = stdout.flush();
    }

    fn stage_completed(&self, stage: Stage, state: &PipelineState) {
        let (done, total) = state.progress();
        eprintln!("✓ {stage} done ({done}/{total} chapters, {} words)", state.total_words());
    }
}

fn handle_settings(session: &Session, command: SettingsCommand) -> Result<(), CliError> {
    match command {
        SettingsCommand::Show => {
            let rendered = serde_json::to_string_pretty(&session.settings)
                .map_err(|err| CliError::InvalidSetting(err.to_string()))?;
            println!("{rendered}");
            Ok(())
        }
        SettingsCommand::Set(args) => {
            let mut settings = session.settings.clone();
            settings
                .set_field(&args.key, &args.value)
                .map_err(CliError::InvalidSetting)?;
            session.gateway.save_settings(&settings)?;
            session
                .sink
                .info(COMPONENT, format!("{} updated", args.key));
            Ok(())
        }
    }
}

async fn handle_credential(session: &Session, command: CredentialCommand) -> Result<(), CliError> {
    match command {
        CredentialCommand::Set(args) => {
            let dispatcher = session.dispatcher(Some(args.key.clone()))?;
            let validation = dispatcher.validate_credential().await;
            let verdict = store_credential(
                &session.gateway,
                &session.sink,
                &args.key,
                validation,
                session.settings.allow_unverified_credential,
            )?;
            match verdict {
                CredentialVerdict::Verified => println!("API key verified and saved."),
                CredentialVerdict::SavedUnverified(reason) => {
                    println!("API key saved, but it could not be verified: {reason}")
                }
            }
            Ok(())
        }
        CredentialCommand::Check => {
            let dispatcher = session.stored_dispatcher()?;
            dispatcher.validate_credential().await?;
            println!("API key is valid.");
            let snapshot = dispatcher.rate_limit();
            if let Some(remaining) = snapshot.remaining_requests {
                println!("Remaining requests: {remaining}");
            }
            if let Some(remaining) = snapshot.remaining_tokens {
                println!("Remaining tokens: {remaining}");
            }
            Ok(())
        }
    }
}

async fn run_concept(session: &Session) -> Result<(), CliError> {
    let dispatcher = session.stored_dispatcher()?;
    let pipeline = pipeline(session, &dispatcher, session.settings.clone());
    let mut state = session.load_project()?;

    let outcome = pipeline.generate_concept(&mut state).await?;
    report_outcome(outcome);
    if let Some(concept) = &state.concept {
        println!("{concept}");
    }
    Ok(())
}

async fn run_outline(session: &Session) -> Result<(), CliError> {
    let dispatcher = session.stored_dispatcher()?;
    let pipeline = pipeline(session, &dispatcher, session.settings.clone());
    let mut state = session.load_project()?;

    let outcome = pipeline.generate_outline(&mut state).await?;
    report_outcome(outcome);
    if let Some(outline) = &state.outline {
        println!("{outline}");
    }
    Ok(())
}

async fn run_chapters(session: &Session, args: ChaptersArgs) -> Result<(), CliError> {
    let dispatcher = session.stored_dispatcher()?;
    let mut settings = session.settings.clone();
    if args.auto {
        settings.auto_generate = true;
    }
    if args.single {
        settings.auto_generate = false;
    }
    let pipeline = pipeline(session, &dispatcher, settings);
    let mut state = session.load_project()?;

    let outcome = pipeline.generate_chapters(&mut state).await?;
    report_outcome(outcome);
    Ok(())
}

async fn handle_chapter(session: &Session, command: ChapterCommand) -> Result<(), CliError> {
    match command {
        ChapterCommand::Regenerate(args) => {
            let index = chapter_index(args.number)?;
            let dispatcher = session.stored_dispatcher()?;
            let pipeline = pipeline(session, &dispatcher, session.settings.clone());
            let mut state = session.load_project()?;
            let outcome = pipeline.regenerate_chapter(&mut state, index).await?;
            report_outcome(outcome);
            Ok(())
        }
        ChapterCommand::Show(args) => {
            let index = chapter_index(args.number)?;
            let state = session.load_project()?;
            let chapter = state
                .chapter(index)
                .filter(|chapter| chapter.is_generated())
                .ok_or(GenerationError::ChapterNotGenerated { index })?;
            println!("# {}\n\n{}", chapter.title, chapter.content);
            Ok(())
        }
    }
}

fn show_status(session: &Session) -> Result<(), CliError> {
    let state = session.load_project()?;
    let (done, total) = state.progress();
    println!("Title:    {}", state.book_title());
    println!("Stage:    {}", state.stage());
    println!("Progress: {done}/{total} chapters");
    println!("Words:    {}", state.total_words());
    println!("Model:    {}", session.settings.model);
    for (index, chapter) in state.chapters.iter().enumerate() {
        let marker = if chapter.is_generated() { "x" } else { " " };
        println!(
            "  [{marker}] {:>2}. {} ({} words)",
            index + 1,
            chapter.title,
            chapter.word_count
        );
    }
    Ok(())
}

fn run_reset(session: &Session) -> Result<(), CliError> {
    let dispatcher = session.dispatcher(None)?;
    let pipeline = pipeline(session, &dispatcher, session.settings.clone());
    let mut state = session.load_project()?;
    pipeline.reset(&mut state)?;
    Ok(())
}

async fn run_cover(session: &Session, args: CoverArgs) -> Result<(), CliError> {
    let dispatcher = session.stored_dispatcher()?;
    let pipeline = pipeline(session, &dispatcher, session.settings.clone());
    let state = session.load_project()?;

    let prompt = pipeline.cover_prompt(&state)?;
    session
        .sink
        .debug(COMPONENT, format!("cover prompt: {prompt}"));
    let bytes = dispatcher.generate_image(&prompt).await?;
    fs::write(&args.out, &bytes).map_err(|source| CliError::Io {
        path: args.out.clone(),
        source,
    })?;
    session.sink.info(
        COMPONENT,
        format!("cover written to {} ({} bytes)", args.out.display(), bytes.len()),
    );
    Ok(())
}

fn pipeline<'a>(
    session: &'a Session,
    dispatcher: &'a RequestDispatcher,
    settings: Settings,
) -> GenerationPipeline<'a> {
    GenerationPipeline::new(
        &session.prompts,
        &session.sink,
        dispatcher,
        &session.gateway,
        settings,
    )
    .with_presenter(&CONSOLE_PRESENTER)
}

static CONSOLE_PRESENTER: ConsolePresenter = ConsolePresenter;

fn report_outcome(outcome: StageOutcome) {
    match outcome {
        StageOutcome::Skipped => eprintln!("A generation is already running; nothing to do."),
        StageOutcome::Completed => {}
        StageOutcome::Paused { generated, next } => eprintln!(
            "Wrote {generated} chapter(s). Run `bookctl chapters` again to continue with chapter {}.",
            next + 1
        ),
    }
}

fn chapter_index(number: usize) -> Result<usize, CliError> {
    number
        .checked_sub(1)
        .ok_or(CliError::InvalidChapterNumber(number))
}

#[derive(Debug, Error)]
enum CliError {
    #[error("failed to start the async runtime: {0}")]
    Runtime(io::Error),
    #[error("chapter numbers start at 1, got {0}")]
    InvalidChapterNumber(usize),
    #[error("{0}")]
    InvalidSetting(String),
    #[error("failed to write `{path}`: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("storage error: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("prompt error: {0}")]
    Prompt(#[from] PromptError),
    #[error("client setup failed: {0}")]
    Adapter(#[from] AdapterError),
    #[error("{0}")]
    Generation(#[from] GenerationError),
}

#[derive(Parser)]
#[command(name = "bookctl", version, about = "Generate a book from concept to chapters")]
struct Cli {
    /// Directory holding settings.json, project.json and the API key
    #[arg(long, global = true, default_value = ".bookgen")]
    data_dir: PathBuf,

    /// Show debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Inspect or change settings
    #[command(subcommand)]
    Settings(SettingsCommand),
    /// Store or verify the API key
    #[command(subcommand)]
    Credential(CredentialCommand),
    /// Generate the book concept; clears any outline and chapters
    Concept,
    /// Generate the chapter outline from the concept; clears any chapters
    Outline,
    /// Write chapters from where the last run stopped
    Chapters(ChaptersArgs),
    /// Work with a single chapter
    #[command(subcommand)]
    Chapter(ChapterCommand),
    /// Print the project stage and chapter progress
    Status,
    /// Discard the current project
    Reset,
    /// Generate a cover image from the concept
    Cover(CoverArgs),
}

#[derive(Subcommand)]
enum SettingsCommand {
    /// Print the effective settings as JSON
    Show,
    /// Set one field, e.g. `model gpt-4o` or `book.topic "A lighthouse keeper"`
    Set(SetArgs),
}

#[derive(Subcommand)]
enum CredentialCommand {
    /// Validate and save an API key
    Set(CredentialArgs),
    /// Validate the saved API key
    Check,
}

#[derive(Subcommand)]
enum ChapterCommand {
    /// Rewrite one generated chapter without moving the cursor
    Regenerate(ChapterArgs),
    /// Print one generated chapter
    Show(ChapterArgs),
}

#[derive(Args)]
struct SetArgs {
    key: String,
    value: String,
}

#[derive(Args)]
struct CredentialArgs {
    key: String,
}

#[derive(Args)]
struct ChaptersArgs {
    /// Keep writing until every chapter is done
    #[arg(long, conflicts_with = "single")]
    auto: bool,
    /// Write only the next chapter
    #[arg(long)]
    single: bool,
}

#[derive(Args)]
struct ChapterArgs {
    /// Chapter number, starting at 1
    #[arg(long, value_name = "N")]
    number: usize,
}

#[derive(Args)]
struct CoverArgs {
    /// Where to write the image
    #[arg(long, value_name = "FILE", default_value = "cover.png")]
    out: PathBuf,
}
