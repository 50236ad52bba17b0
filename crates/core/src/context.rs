use crate::state::ChapterRecord;

/// Characters of each earlier chapter carried into the next chapter prompt.
pub const CONTEXT_PREVIEW_CHARS: usize = 200;

pub const FIRST_CHAPTER_CONTEXT: &str = "This is the first chapter.";

/// Bounded digest of the chapters strictly before `up_to`.
///
/// Each generated chapter contributes `title: preview`, with `...` appended
/// when the content was cut. Entries are separated by a blank line. Placeholders that have no content yet are
/// skipped.
pub fn build_context(chapters: &[ChapterRecord], up_to: usize) -> String {
    let end = up_to.min(chapters.len());
    let entries: Vec<String> = chapters[..end]
        .iter()
        .filter(|chapter| chapter.is_generated())
        .map(|chapter| {
            let content = chapter.content.trim();
            let preview = truncate_chars(content, CONTEXT_PREVIEW_CHARS);
            if preview.len() < content.len() {
                format!("{}: {}...", chapter.title, preview)
            } else {
                format!("{}: {}", chapter.title, preview)
            }
        })
        .collect();

    if entries.is_empty() {
        FIRST_CHAPTER_CONTEXT.to_string()
    } else {
        entries.join("\n\n")
    }
}

pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
