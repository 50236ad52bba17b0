use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::Settings;

const BUILT_IN_PROMPTS: &str = include_str!("../../prompts/default.toml");

/// Template keys the generation pipeline renders.
pub mod keys {
    pub const CONCEPT_SYSTEM: &str = "concept_system";
    pub const CONCEPT: &str = "concept";
    pub const OUTLINE_SYSTEM: &str = "outline_system";
    pub const OUTLINE: &str = "outline";
    pub const CHAPTER_SYSTEM: &str = "chapter_system";
    pub const CHAPTER: &str = "chapter";
    pub const COVER_IMAGE: &str = "cover_image";

    pub const ALL: [&str; 7] = [
        CONCEPT_SYSTEM,
        CONCEPT,
        OUTLINE_SYSTEM,
        OUTLINE,
        CHAPTER_SYSTEM,
        CHAPTER,
        COVER_IMAGE,
    ];
}

pub type PromptArguments = HashMap<String, String>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PromptSource {
    BuiltIn,
    File(PathBuf),
}

impl PromptSource {
    pub fn is_builtin(&self) -> bool {
        matches!(self, Self::BuiltIn)
    }
}

#[derive(Clone, Debug)]
pub struct PromptTemplate {
    key: String,
    description: Option<String>,
    source: PromptSource,
    segments: Vec<Segment>,
    required: BTreeSet<String>,
}

impl PromptTemplate {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn source(&self) -> &PromptSource {
        &self.source
    }

    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Placeholder(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Substitute `{name}` placeholders. Required placeholders must be
    /// supplied; optional ones render empty when absent.
    pub fn render(&self, arguments: &PromptArguments) -> Result<String, PromptError> {
        if let Some(missing) = self.required.iter().find(|name| !arguments.contains_key(*name)) {
            return Err(PromptError::MissingArgument {
                key: self.key.clone(),
                argument: missing.clone(),
            });
        }

        let mut output = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => output.push_str(text),
                Segment::Placeholder(name) => {
                    if let Some(value) = arguments.get(name) {
                        output.push_str(value);
                    }
                }
            }
        }
        Ok(output)
    }

    fn compile(key: String, raw: RawPrompt, source: PromptSource) -> Result<Self, PromptError> {
        let segments = split_template(&raw.template);
        let placeholders: BTreeSet<String> = segments
            .iter()
            .filter_map(|segment| match segment {
                Segment::Placeholder(name) => Some(name.clone()),
                Segment::Literal(_) => None,
            })
            .collect();

        let required = match raw.required {
            None => placeholders,
            Some(declared) => {
                let mut required = BTreeSet::new();
                for argument in declared {
                    let argument = argument.trim().to_string();
                    if !placeholders.contains(&argument) {
                        return Err(PromptError::InvalidRequired { key, argument });
                    }
                    required.insert(argument);
                }
                required
            }
        };

        Ok(Self {
            key,
            description: raw.description,
            source,
            segments,
            required,
        })
    }
}

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("prompt `{0}` not found")]
    NotFound(String),
    #[error("missing argument `{argument}` when rendering prompt `{key}`")]
    MissingArgument { key: String, argument: String },
    #[error("failed to read prompt file `{path}`: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse built-in prompt definitions: {0}")]
    ParseBuiltIn(toml::de::Error),
    #[error("failed to parse prompt file `{path}` as TOML: {source}")]
    ParseToml {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to parse prompt file `{path}` as YAML: {source}")]
    ParseYaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("prompt `{key}` declares required argument `{argument}` that never appears in its template")]
    InvalidRequired { key: String, argument: String },
}

/// Built-in templates, overridden key by key from custom directories.
///
/// Directories are applied in order and files within a directory in name
/// order, so later definitions win.
#[derive(Debug)]
pub struct PromptRegistry {
    prompts: BTreeMap<String, PromptTemplate>,
    directories: Vec<PathBuf>,
}

impl PromptRegistry {
    pub fn new() -> Result<Self, PromptError> {
        Self::with_custom_directories::<PathBuf>(&[])
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, PromptError> {
        Self::with_custom_directories(&settings.prompt_directories)
    }

    pub fn with_custom_directories<P: AsRef<Path>>(directories: &[P]) -> Result<Self, PromptError> {
        let mut registry = Self {
            prompts: BTreeMap::new(),
            directories: directories
                .iter()
                .map(|dir| dir.as_ref().to_path_buf())
                .collect(),
        };
        registry.reload()?;
        Ok(registry)
    }

    pub fn custom_directories(&self) -> &[PathBuf] {
        &self.directories
    }

    pub fn reload(&mut self) -> Result<(), PromptError> {
        let mut prompts = BTreeMap::new();
        let built_in: PromptDocument =
            toml::from_str(BUILT_IN_PROMPTS).map_err(PromptError::ParseBuiltIn)?;
        insert_document(&mut prompts, built_in, &PromptSource::BuiltIn)?;
        for dir in &self.directories {
            load_directory(dir, &mut prompts)?;
        }
        self.prompts = prompts;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&PromptTemplate> {
        self.prompts.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.prompts.keys().map(String::as_str)
    }

    pub fn format(&self, key: &str, args: &PromptArguments) -> Result<String, PromptError> {
        self.get(key)
            .ok_or_else(|| PromptError::NotFound(key.to_string()))?
            .render(args)
    }

    pub fn format_with<I, K, V>(&self, key: &str, arguments: I) -> Result<String, PromptError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let args: PromptArguments = arguments
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.format(key, &args)
    }

    /// Fails on the first pipeline key that no layer defines.
    pub fn ensure_pipeline_keys(&self) -> Result<(), PromptError> {
        match keys::ALL.iter().find(|key| !self.prompts.contains_key(**key)) {
            Some(key) => Err(PromptError::NotFound((*key).to_string())),
            None => Ok(()),
        }
    }
}

fn insert_document(
    prompts: &mut BTreeMap<String, PromptTemplate>,
    document: PromptDocument,
    source: &PromptSource,
) -> Result<(), PromptError> {
    for (key, raw) in document.prompts {
        let template = PromptTemplate::compile(key.clone(), raw, source.clone())?;
        prompts.insert(key, template);
    }
    Ok(())
}

fn load_directory(
    dir: &Path,
    prompts: &mut BTreeMap<String, PromptTemplate>,
) -> Result<(), PromptError> {
    if !dir.is_dir() {
        return Ok(());
    }

    let io_error = |path: &Path| {
        let path = path.to_path_buf();
        move |source| PromptError::Io { path, source }
    };

    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_error(dir))? {
        let path = entry.map_err(io_error(dir))?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();

    for path in files {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        let document: PromptDocument = match extension.as_deref() {
            Some("toml") => {
                let contents = fs::read_to_string(&path).map_err(io_error(&path))?;
                toml::from_str(&contents).map_err(|source| PromptError::ParseToml {
                    path: path.clone(),
                    source,
                })?
            }
            Some("yaml") | Some("yml") => {
                let contents = fs::read_to_string(&path).map_err(io_error(&path))?;
                serde_yaml::from_str(&contents).map_err(|source| PromptError::ParseYaml {
                    path: path.clone(),
                    source,
                })?
            }
            _ => continue,
        };
        insert_document(prompts, document, &PromptSource::File(path.clone()))?;
    }

    Ok(())
}

#[derive(Debug, Deserialize)]
struct PromptDocument {
    #[serde(default)]
    prompts: BTreeMap<String, RawPrompt>,
}

#[derive(Debug, Deserialize)]
struct RawPrompt {
    #[serde(alias = "text")]
    template: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    required: Option<Vec<String>>,
}

#[derive(Clone, Debug)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

/// `{{` and `}}` escape braces; an unterminated `{` is kept literally.
fn split_template(template: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut rest = template;

    while let Some(idx) = rest.find(['{', '}']) {
        literal.push_str(&rest[..idx]);
        let tail = &rest[idx..];

        if tail.starts_with("{{") || tail.starts_with("}}") {
            literal.push_str(&tail[..1]);
            rest = &tail[2..];
            continue;
        }
        if tail.starts_with('}') {
            literal.push('}');
            rest = &tail[1..];
            continue;
        }

        match tail[1..].find('}') {
            Some(close) => {
                let name = tail[1..=close].trim();
                if name.is_empty() {
                    literal.push_str("{}");
                } else {
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Placeholder(name.to_string()));
                }
                rest = &tail[close + 2..];
            }
            None => {
                literal.push_str(tail);
                rest = "";
            }
        }
    }
    literal.push_str(rest);
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn chapter_args() -> PromptArguments {
        PromptArguments::from([
            ("concept".into(), "A lighthouse keeper finds a map.".into()),
            ("outline".into(), "Chapter 1: Storm\nChapter 2: Calm".into()),
            ("chapter_number".into(), "2".into()),
            ("chapter_total".into(), "2".into()),
            ("chapter_title".into(), "Calm".into()),
            ("chapter_description".into(), "".into()),
            ("previous_context".into(), "Storm: Rain fell...".into()),
            ("word_target".into(), "1500".into()),
        ])
    }

    #[test]
    fn built_in_document_defines_every_pipeline_key() {
        let registry = PromptRegistry::new().expect("registry");
        registry.ensure_pipeline_keys().expect("all keys present");
        assert!(registry.get(keys::CONCEPT).unwrap().source().is_builtin());
    }

    #[test]
    fn renders_chapter_prompt_with_context() {
        let registry = PromptRegistry::new().unwrap();
        let output = registry.format(keys::CHAPTER, &chapter_args()).unwrap();
        assert!(output.contains("Calm"));
        assert!(output.contains("Storm: Rain fell..."));
        assert!(output.contains("1500"));
    }

    #[test]
    fn missing_argument_fails() {
        let registry = PromptRegistry::new().unwrap();
        let mut args = chapter_args();
        args.remove("chapter_title");
        match registry.format(keys::CHAPTER, &args) {
            Err(PromptError::MissingArgument { argument, .. }) => {
                assert_eq!(argument, "chapter_title")
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn custom_directory_overrides_and_reloads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(&path, "[prompts.concept]\ntemplate = \"Pitch {topic}\"\n").unwrap();

        let mut registry = PromptRegistry::with_custom_directories(&[dir.path()]).unwrap();
        assert_eq!(
            registry.format_with(keys::CONCEPT, [("topic", "tides")]).unwrap(),
            "Pitch tides"
        );
        assert!(!registry.get(keys::CONCEPT).unwrap().source().is_builtin());

        fs::write(&path, "[prompts.concept]\ntemplate = \"Sell {topic}\"\n").unwrap();
        registry.reload().unwrap();
        assert_eq!(
            registry.format_with(keys::CONCEPT, [("topic", "tides")]).unwrap(),
            "Sell tides"
        );
    }

    #[test]
    fn yaml_files_and_optional_arguments() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("extra.yaml"),
            "prompts:\n  blurb:\n    template: \"{title} {subtitle}\"\n    required: [title]\n",
        )
        .unwrap();
        let registry = PromptRegistry::with_custom_directories(&[dir.path()]).unwrap();
        assert_eq!(registry.format_with("blurb", [("title", "Salt")]).unwrap(), "Salt ");
    }

    #[test]
    fn undeclared_required_argument_is_rejected() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("bad.toml"),
            "[prompts.x]\ntemplate = \"{a}\"\nrequired = [\"b\"]\n",
        )
        .unwrap();
        let err = PromptRegistry::with_custom_directories(&[dir.path()]).unwrap_err();
        assert!(matches!(err, PromptError::InvalidRequired { .. }));
    }

    #[test]
    fn braces_can_be_escaped() {
        let segments = split_template("{{\"title\": \"{name}\"}} {unterminated");
        let rendered: String = segments
            .iter()
            .map(|segment| match segment {
                Segment::Literal(text) => text.clone(),
                Segment::Placeholder(name) => format!("<{name}>"),
            })
            .collect();
        assert_eq!(rendered, "{\"title\": \"<name>\"} {unterminated");
    }
}
