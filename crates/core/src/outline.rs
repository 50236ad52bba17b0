use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::structured::lenient;

static CHAPTER_MARKER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^chapter\s*\d*\s*[:.]\s*").unwrap());

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutlineChapter {
    #[serde(
        default,
        alias = "chapter_number",
        alias = "chapter",
        deserialize_with = "lenient::number"
    )]
    pub number: u32,
    #[serde(default, alias = "chapter_title", alias = "name", deserialize_with = "lenient::text")]
    pub title: String,
    #[serde(default, alias = "summary", deserialize_with = "lenient::text")]
    pub description: String,
}

/// Chapter titles from a free-text outline.
///
/// Every non-empty line that is not a comment yields one title, with a
/// leading `Chapter N:` marker and a trailing ` - description` removed.
pub fn extract_chapter_titles(outline: &str) -> Vec<String> {
    outline
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !is_comment(line))
        .map(strip_title)
        .filter(|title| !title.is_empty())
        .collect()
}

/// Titles from a structured chapter list, in list order, blanks dropped.
pub fn titles_from_structured(chapters: &[OutlineChapter]) -> Vec<String> {
    chapters
        .iter()
        .map(|chapter| chapter.title.trim().to_string())
        .filter(|title| !title.is_empty())
        .collect()
}

fn is_comment(line: &str) -> bool {
    line.starts_with('#') || line.starts_with("//")
}

fn strip_title(line: &str) -> String {
    let without_marker = CHAPTER_MARKER_RE.replace(line, "");
    let title = match without_marker.find(" - ") {
        Some(idx) => &without_marker[..idx],
        None => without_marker.as_ref(),
    };
    title.trim().to_string()
}
