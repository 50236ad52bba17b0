use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;

use crate::config::{ConfigError, Settings};
use crate::state::PipelineState;

pub const PROJECT_FILE_NAME: &str = "project.json";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const CREDENTIAL_FILE_NAME: &str = "credential";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to prepare data directory `{path}`: {source}")]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("failed to read `{path}`: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to write `{path}`: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("failed to decode project `{path}`: {source}")]
    Decode {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to encode project: {0}")]
    Encode(serde_json::Error),
    #[error(transparent)]
    Settings(#[from] ConfigError),
}

/// Durable storage for the project, settings and the API key.
///
/// Saving identical data twice must be harmless.
pub trait PersistenceGateway: Send + Sync {
    fn save_project(&self, state: &PipelineState) -> Result<(), PersistenceError>;

    fn load_last_project(&self) -> Result<Option<PipelineState>, PersistenceError>;

    fn save_credential(&self, secret: &str) -> Result<(), PersistenceError>;

    fn load_credential(&self) -> Result<Option<String>, PersistenceError>;

    fn save_settings(&self, settings: &Settings) -> Result<(), PersistenceError>;

    fn load_settings(&self) -> Result<Settings, PersistenceError>;
}

/// JSON files under one data directory.
#[derive(Clone, Debug)]
pub struct FileGateway {
    dir: PathBuf,
}

impl FileGateway {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn ensure_dir(&self) -> Result<(), PersistenceError> {
        fs::create_dir_all(&self.dir).map_err(|source| PersistenceError::CreateDir {
            path: self.dir.clone(),
            source,
        })
    }

    fn write(&self, name: &str, contents: &str) -> Result<(), PersistenceError> {
        self.ensure_dir()?;
        let path = self.dir.join(name);
        fs::write(&path, contents).map_err(|source| PersistenceError::Write { path, source })
    }

    fn read_optional(&self, name: &str) -> Result<Option<String>, PersistenceError> {
        let path = self.dir.join(name);
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(PersistenceError::Read { path, source }),
        }
    }
}

impl PersistenceGateway for FileGateway {
    fn save_project(&self, state: &PipelineState) -> Result<(), PersistenceError> {
        let encoded = serde_json::to_string_pretty(state).map_err(PersistenceError::Encode)?;
        self.write(PROJECT_FILE_NAME, &encoded)
    }

    fn load_last_project(&self) -> Result<Option<PipelineState>, PersistenceError> {
        let Some(contents) = self.read_optional(PROJECT_FILE_NAME)? else {
            return Ok(None);
        };
        if contents.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|source| PersistenceError::Decode {
                path: self.dir.join(PROJECT_FILE_NAME),
                source,
            })
    }

    fn save_credential(&self, secret: &str) -> Result<(), PersistenceError> {
        self.write(CREDENTIAL_FILE_NAME, secret.trim())
    }

    fn load_credential(&self) -> Result<Option<String>, PersistenceError> {
        Ok(self
            .read_optional(CREDENTIAL_FILE_NAME)?
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty()))
    }

    fn save_settings(&self, settings: &Settings) -> Result<(), PersistenceError> {
        self.ensure_dir()?;
        Ok(settings.to_path(&self.dir.join(SETTINGS_FILE_NAME))?)
    }

    fn load_settings(&self) -> Result<Settings, PersistenceError> {
        match self.read_optional(SETTINGS_FILE_NAME)? {
            Some(contents) => Ok(Settings::from_json_str(&contents)?),
            None => Ok(Settings::default()),
        }
    }
}

/// In-process gateway; counts project saves so callers can observe checkpoints.
#[derive(Debug, Default)]
pub struct MemoryGateway {
    project: Mutex<Option<PipelineState>>,
    credential: Mutex<Option<String>>,
    settings: Mutex<Option<Settings>>,
    project_saves: Mutex<usize>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(secret: impl Into<String>) -> Self {
        let gateway = Self::default();
        if let Ok(mut guard) = gateway.credential.lock() {
            *guard = Some(secret.into());
        }
        gateway
    }

    pub fn project_saves(&self) -> usize {
        self.project_saves.lock().map(|guard| *guard).unwrap_or_default()
    }
}

impl PersistenceGateway for MemoryGateway {
    fn save_project(&self, state: &PipelineState) -> Result<(), PersistenceError> {
        if let Ok(mut guard) = self.project.lock() {
            *guard = Some(state.clone());
        }
        if let Ok(mut guard) = self.project_saves.lock() {
            *guard += 1;
        }
        Ok(())
    }

    fn load_last_project(&self) -> Result<Option<PipelineState>, PersistenceError> {
        Ok(self.project.lock().ok().and_then(|guard| guard.clone()))
    }

    fn save_credential(&self, secret: &str) -> Result<(), PersistenceError> {
        if let Ok(mut guard) = self.credential.lock() {
            *guard = Some(secret.trim().to_string());
        }
        Ok(())
    }

    fn load_credential(&self) -> Result<Option<String>, PersistenceError> {
        Ok(self.credential.lock().ok().and_then(|guard| guard.clone()))
    }

    fn save_settings(&self, settings: &Settings) -> Result<(), PersistenceError> {
        if let Ok(mut guard) = self.settings.lock() {
            *guard = Some(settings.clone());
        }
        Ok(())
    }

    fn load_settings(&self) -> Result<Settings, PersistenceError> {
        Ok(self
            .settings
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outline::OutlineChapter;
    use crate::state::ChapterRecord;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn sample_state() -> PipelineState {
        let mut state = PipelineState::new();
        state.concept = Some("{\"title\":\"Salt\"}".into());
        state.outline = Some("Chapter 1: Shore\nChapter 2: Deep\nChapter 3: Return".into());
        state.outline_chapters = Some(vec![OutlineChapter {
            number: 1,
            title: "Shore".into(),
            description: "arrival".into(),
        }]);
        state.chapters = ["Shore", "Deep", "Return"]
            .into_iter()
            .map(ChapterRecord::placeholder)
            .collect();
        state.chapters[0].complete(
            "Waves broke.".into(),
            Utc.with_ymd_and_hms(2024, 3, 3, 9, 0, 0).unwrap(),
        );
        state.chapters[1].complete(
            "Down they went.".into(),
            Utc.with_ymd_and_hms(2024, 3, 3, 9, 5, 0).unwrap(),
        );
        state.cursor = 2;
        state
    }

    #[test]
    fn file_gateway_round_trips_project() {
        let temp = tempdir().unwrap();
        let gateway = FileGateway::new(temp.path().join("data"));
        assert!(gateway.load_last_project().unwrap().is_none());

        let state = sample_state();
        gateway.save_project(&state).unwrap();
        gateway.save_project(&state).unwrap();

        let restored = gateway.load_last_project().unwrap().expect("saved project");
        assert_eq!(restored, state);
        let titles: Vec<&str> = restored.chapters.iter().map(|c| c.title.as_str()).collect();
        assert_eq!(titles, vec!["Shore", "Deep", "Return"]);
    }

    #[test]
    fn file_gateway_stores_trimmed_credential() {
        let temp = tempdir().unwrap();
        let gateway = FileGateway::new(temp.path());
        assert_eq!(gateway.load_credential().unwrap(), None);
        gateway.save_credential("  sk-test \n").unwrap();
        assert_eq!(gateway.load_credential().unwrap().as_deref(), Some("sk-test"));
    }

    #[test]
    fn file_gateway_settings_default_when_missing() {
        let temp = tempdir().unwrap();
        let gateway = FileGateway::new(temp.path());
        assert_eq!(gateway.load_settings().unwrap(), Settings::default());

        let mut settings = Settings::default();
        settings.model = "o3-mini".into();
        gateway.save_settings(&settings).unwrap();
        assert_eq!(gateway.load_settings().unwrap().model, "o3-mini");
    }

    #[test]
    fn corrupt_project_is_reported() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join(PROJECT_FILE_NAME), "{not json").unwrap();
        let gateway = FileGateway::new(temp.path());
        assert!(matches!(
            gateway.load_last_project(),
            Err(PersistenceError::Decode { .. })
        ));
    }

    #[test]
    fn memory_gateway_counts_saves() {
        let gateway = MemoryGateway::with_credential("key");
        gateway.save_project(&sample_state()).unwrap();
        gateway.save_project(&sample_state()).unwrap();
        assert_eq!(gateway.project_saves(), 2);
        assert_eq!(gateway.load_last_project().unwrap(), Some(sample_state()));
        assert_eq!(gateway.load_credential().unwrap().as_deref(), Some("key"));
    }
}
