//! "Ensure a heading" heuristic applied to each document before merging.
//!
//! Merged books are navigated by their headings, so every document should
//! open with one. A document counts as titled when one of its first few
//! non-blank lines is a Markdown heading or reads like a chapter marker
//! ("Chapter 12", "Глава 3", "Prologue", …). Otherwise a heading is
//! synthesized from the file name the user uploaded.

use super::normalize::is_atx_heading;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;

static RE_NUMBERED_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(?:chapter|part|глава|часть)\s{0,4}\d{1,4}").unwrap());

static RE_NAMED_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^(?:prologue|epilogue|foreword|afterword|preface|annotation|description|пролог|эпилог|описание|аннотация|предисловие от автора|предисловие|послесловие)[.!\s]*$",
    )
    .unwrap()
});

static RE_COPY_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*\(\d+\)$").unwrap());

static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// `true` when one of the first `window` non-blank lines is a heading or a
/// title-like marker.
pub fn has_heading(markdown: &str, window: usize) -> bool {
    markdown
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .take(window)
        .any(|line| is_atx_heading(line) || is_title_marker(line))
}

fn is_title_marker(line: &str) -> bool {
    let plain: String = line.chars().filter(|c| !matches!(c, '*' | '_')).collect();
    let plain = plain.trim();
    RE_NUMBERED_MARKER.is_match(plain) || RE_NAMED_MARKER.is_match(plain)
}

/// Human title derived from an uploaded file name:
/// `"my_book-part (2).docx"` → `"my book part"`.
pub fn title_from_name(origin_name: &str) -> String {
    let stem = Path::new(origin_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(origin_name);
    let stem = RE_COPY_SUFFIX.replace(stem, "");
    let spaced = stem.replace(['_', '-'], " ");
    RE_WS.replace_all(spaced.trim(), " ").into_owned()
}

/// Prefix `markdown` with `# <title>` unless it already opens with a heading.
///
/// `doc_num` (1-based) names the document when the file name yields no title.
pub fn ensure_heading(markdown: &str, origin_name: &str, doc_num: usize, window: usize) -> String {
    if has_heading(markdown, window) {
        return markdown.to_string();
    }
    let mut title = title_from_name(origin_name);
    if title.is_empty() {
        title = format!("Document {}", doc_num);
    }
    format!("# {}\n\n{}", title, markdown.trim_start_matches('\n'))
}
