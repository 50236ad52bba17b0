//! Best-effort decoding of JSON-shaped model output.
//!
//! The ladder is: strict parse of the whole text, then the outermost `{...}`
//! found by bracket matching, then a caller-supplied synthetic value.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::outline::OutlineChapter;

/// Parsed book concept, used for rendering and editing.
///
/// Fields decode leniently: numbers become text, a comma-separated string
/// stands in for a list, and character entries may be bare names.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BookConcept {
    #[serde(default, deserialize_with = "lenient::text")]
    pub title: String,
    #[serde(default, deserialize_with = "lenient::text")]
    pub genre: String,
    #[serde(default, alias = "tagline", deserialize_with = "lenient::text")]
    pub logline: String,
    #[serde(default, alias = "summary", deserialize_with = "lenient::text")]
    pub synopsis: String,
    #[serde(default, deserialize_with = "lenient::text")]
    pub setting: String,
    #[serde(default, deserialize_with = "lenient::text")]
    pub tone: String,
    #[serde(default, deserialize_with = "lenient::text_list")]
    pub themes: Vec<String>,
    #[serde(default, deserialize_with = "lenient::characters")]
    pub characters: Vec<CharacterSketch>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CharacterSketch {
    #[serde(default, deserialize_with = "lenient::text")]
    pub name: String,
    #[serde(default, deserialize_with = "lenient::text")]
    pub role: String,
    #[serde(default, deserialize_with = "lenient::text")]
    pub description: String,
}

impl BookConcept {
    pub const UNTITLED: &'static str = "Untitled";

    /// Stand-in used when the response could not be decoded at all.
    pub fn synthetic(raw: &str) -> Self {
        Self {
            title: Self::UNTITLED.to_string(),
            synopsis: raw.trim().to_string(),
            ..Self::default()
        }
    }

    pub fn display_title(&self) -> &str {
        if self.title.trim().is_empty() {
            Self::UNTITLED
        } else {
            self.title.trim()
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OutlineDocument {
    #[serde(default, alias = "outline", deserialize_with = "lenient::chapters")]
    pub chapters: Vec<OutlineChapter>,
}

/// Locate a JSON object in `text`: the whole text first, then the outermost
/// balanced braces.
pub fn extract_json_object(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    let candidate = outermost_object(trimmed)?;
    match serde_json::from_str::<Value>(candidate) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

pub fn decode_structured<T: DeserializeOwned>(text: &str) -> Option<T> {
    extract_json_object(text).and_then(|value| serde_json::from_value(value).ok())
}

pub fn decode_or_else<T, F>(text: &str, fallback: F) -> T
where
    T: DeserializeOwned,
    F: FnOnce(&str) -> T,
{
    decode_structured(text).unwrap_or_else(|| fallback(text))
}

/// Field decoders that accept the shape drift models produce: quoted
/// numbers, scalars where a list was asked for, bare strings for objects.
pub(crate) mod lenient {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    use super::CharacterSketch;
    use crate::outline::OutlineChapter;

    pub fn text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        Ok(scalar_text(&Value::deserialize(deserializer)?).unwrap_or_default())
    }

    pub fn text_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
        let items: Vec<String> = match Value::deserialize(deserializer)? {
            Value::Array(items) => items.iter().filter_map(scalar_text).collect(),
            Value::String(joined) => joined.split(',').map(str::to_string).collect(),
            other => scalar_text(&other).into_iter().collect::<Vec<_>>(),
        };
        Ok(items
            .into_iter()
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect())
    }

    /// Chapter ordinal from an integer, a float or text such as `"3"` or
    /// `"Chapter 3"`. Anything else is 0, meaning "assign by position".
    pub fn number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
        Ok(match Value::deserialize(deserializer)? {
            Value::Number(number) => number
                .as_u64()
                .or_else(|| number.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(0),
            Value::String(text) => text
                .chars()
                .skip_while(|ch| !ch.is_ascii_digit())
                .take_while(char::is_ascii_digit)
                .collect::<String>()
                .parse()
                .unwrap_or(0),
            _ => 0,
        })
    }

    pub fn characters<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<CharacterSketch>, D::Error> {
        Ok(match Value::deserialize(deserializer)? {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Object(_) => serde_json::from_value(item).ok(),
                    other => scalar_text(&other).map(|name| CharacterSketch {
                        name,
                        ..CharacterSketch::default()
                    }),
                })
                .collect(),
            Value::Object(map) => map
                .into_iter()
                .map(|(name, detail)| CharacterSketch {
                    name,
                    description: scalar_text(&detail).unwrap_or_default(),
                    ..CharacterSketch::default()
                })
                .collect(),
            _ => Vec::new(),
        })
    }

    pub fn chapters<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<OutlineChapter>, D::Error> {
        let Value::Array(items) = Value::deserialize(deserializer)? else {
            return Ok(Vec::new());
        };
        Ok(items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(_) => serde_json::from_value(item).ok(),
                Value::String(title) => Some(OutlineChapter {
                    title,
                    ..OutlineChapter::default()
                }),
                _ => None,
            })
            .collect())
    }

    fn scalar_text(value: &Value) -> Option<String> {
        match value {
            Value::String(text) => Some(text.clone()),
            Value::Number(number) => Some(number.to_string()),
            Value::Bool(flag) => Some(flag.to_string()),
            _ => None,
        }
    }
}

fn outermost_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_json_parses_directly() {
        let concept: BookConcept =
            decode_structured(r#"{"title":"Tide","genre":"Fantasy","themes":["loss"]}"#)
                .expect("parsed");
        assert_eq!(concept.title, "Tide");
        assert_eq!(concept.themes, vec!["loss"]);
    }

    #[test]
    fn json_wrapped_in_prose_and_fences_is_recovered() {
        let text = "Here is your concept:\n```json\n{\"title\": \"The {Braced} Door\", \"synopsis\": \"She said \\\"}\\\" once.\"}\n```\nEnjoy!";
        let concept: BookConcept = decode_structured(text).expect("bracket matched");
        assert_eq!(concept.title, "The {Braced} Door");
        assert_eq!(concept.synopsis, "She said \"}\" once.");
    }

    #[test]
    fn unparseable_text_falls_back_to_synthetic_value() {
        let concept = decode_or_else("A story about a lighthouse keeper.", BookConcept::synthetic);
        assert_eq!(concept.title, BookConcept::UNTITLED);
        assert_eq!(concept.synopsis, "A story about a lighthouse keeper.");
    }

    #[test]
    fn arrays_and_scalars_are_not_objects() {
        assert!(extract_json_object("[1, 2, 3]").is_none());
        assert!(extract_json_object("42").is_none());
        assert!(extract_json_object("{ unbalanced").is_none());
    }

    #[test]
    fn concept_tolerates_shape_drift() {
        let concept: BookConcept = decode_structured(
            r#"{"title": 1984, "themes": "memory, loss ,", "characters": ["Ana", {"name": "Bo", "role": "guide"}]}"#,
        )
        .expect("lenient decode");
        assert_eq!(concept.title, "1984");
        assert_eq!(concept.themes, vec!["memory", "loss"]);
        assert_eq!(concept.characters.len(), 2);
        assert_eq!(concept.characters[0].name, "Ana");
        assert_eq!(concept.characters[1].role, "guide");

        let keyed: BookConcept =
            decode_structured(r#"{"characters": {"Ana": "a keeper"}, "themes": null}"#).unwrap();
        assert_eq!(keyed.characters[0].description, "a keeper");
        assert!(keyed.themes.is_empty());
    }

    #[test]
    fn outline_document_tolerates_quoted_numbers_and_bare_titles() {
        let outline: OutlineDocument = decode_structured(
            "{\n  \"chapters\": [\n    {\"number\": \"1\", \"title\": \"Intro\"},\n    {\"number\": \"Chapter 2\", \"title\": \"Rising Action\"},\n    \"Coda\",\n    7\n  ]\n}",
        )
        .expect("lenient decode");
        let numbers: Vec<u32> = outline.chapters.iter().map(|c| c.number).collect();
        let titles: Vec<&str> = outline.chapters.iter().map(|c| c.title.as_str()).collect();
        assert_eq!(numbers, vec![1, 2, 0]);
        assert_eq!(titles, vec!["Intro", "Rising Action", "Coda"]);
    }

    #[test]
    fn outline_document_accepts_aliases() {
        let outline: OutlineDocument = decode_structured(
            r#"{"outline":[{"chapter_number":1,"title":"Intro","summary":"opening"}]}"#,
        )
        .unwrap();
        assert_eq!(outline.chapters.len(), 1);
        assert_eq!(outline.chapters[0].number, 1);
        assert_eq!(outline.chapters[0].description, "opening");
    }
}
