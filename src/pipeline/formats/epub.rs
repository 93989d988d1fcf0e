//! EPUB converter.
//!
//! Chapters are read in spine order: `META-INF/container.xml` names the OPF
//! package, whose manifest maps spine `idref`s to XHTML files. Packages with a
//! broken or missing OPF fall back to every `.xhtml`/`.html`/`.htm` entry in
//! archive-name order, which is the reading order most generators produce.

use super::markup::{self, attr, Token, Tokenizer};
use super::text::decode_text;
use super::{
    BoundedArchive, ConvertError, DocumentConverter, DocumentFormat, MarkdownWriter, Run,
    DEFAULT_UNPACK_LIMIT,
};
use std::collections::HashMap;
use tracing::debug;

pub struct EpubConverter {
    unpack_limit: u64,
}

impl EpubConverter {
    /// `unpack_limit` caps the total decompressed size of every entry read.
    pub fn new(unpack_limit: u64) -> Self {
        Self { unpack_limit }
    }
}

impl Default for EpubConverter {
    fn default() -> Self {
        Self::new(DEFAULT_UNPACK_LIMIT)
    }
}

impl DocumentConverter for EpubConverter {
    fn format(&self) -> DocumentFormat {
        DocumentFormat::Epub
    }

    fn convert(&self, bytes: &[u8]) -> Result<String, ConvertError> {
        let mut archive = BoundedArchive::new(bytes, self.unpack_limit)?;

        let chapters = match spine_documents(&mut archive) {
            Ok(chapters) if !chapters.is_empty() => chapters,
            Err(e @ ConvertError::TooLarge { .. }) => return Err(e),
            other => {
                if let Err(e) = other {
                    debug!("EPUB spine unavailable ({}), using archive order", e);
                }
                let mut names: Vec<String> = archive
                    .file_names()
                    .filter(|n| {
                        let n = n.to_ascii_lowercase();
                        n.ends_with(".xhtml") || n.ends_with(".html") || n.ends_with(".htm")
                    })
                    .map(str::to_string)
                    .collect();
                names.sort();
                names
            }
        };
        if chapters.is_empty() {
            return Err(ConvertError::MissingPart("XHTML content documents".into()));
        }

        let mut out = MarkdownWriter::new();
        for name in &chapters {
            // A spine entry missing from the archive is skipped, not fatal.
            match archive.read(name) {
                Ok(bytes) => html_to_markdown(&decode_text(&bytes), &mut out),
                Err(e @ ConvertError::TooLarge { .. }) => return Err(e),
                Err(e) => debug!(chapter = %name, "Skipping chapter: {}", e),
            }
        }
        Ok(out.finish())
    }
}

/// Archive paths of the spine's content documents, in reading order.
fn spine_documents(archive: &mut BoundedArchive<'_>) -> Result<Vec<String>, ConvertError> {
    let container = archive.read("META-INF/container.xml")?;
    let container = decode_text(&container);
    let opf_path = Tokenizer::new(&container)
        .find_map(|t| match t {
            Token::Start { name, attrs, .. } if markup::local_name(name) == "rootfile" => {
                attr(attrs, "full-path")
            }
            _ => None,
        })
        .ok_or_else(|| ConvertError::Malformed("container.xml names no rootfile".into()))?;

    let opf = archive.read(&opf_path)?;
    let opf = decode_text(&opf);
    let base = match opf_path.rfind('/') {
        Some(i) => &opf_path[..=i],
        None => "",
    };

    let mut manifest: HashMap<String, String> = HashMap::new();
    let mut spine: Vec<String> = Vec::new();
    for token in Tokenizer::new(&opf) {
        let Token::Start { name, attrs, .. } = token else {
            continue;
        };
        match markup::local_name(name).as_str() {
            "item" => {
                if let (Some(id), Some(href)) = (attr(attrs, "id"), attr(attrs, "href")) {
                    manifest.insert(id, href);
                }
            }
            "itemref" => {
                if let Some(idref) = attr(attrs, "idref") {
                    spine.push(idref);
                }
            }
            _ => {}
        }
    }

    Ok(spine
        .iter()
        .filter_map(|id| manifest.get(id))
        .map(|href| resolve_href(base, href))
        .collect())
}

/// Join `href` onto the OPF directory, dropping fragments and `..` segments.
fn resolve_href(base: &str, href: &str) -> String {
    let href = href.split('#').next().unwrap_or(href);
    let href = percent_decode(href);
    let mut parts: Vec<&str> = base.split('/').filter(|p| !p.is_empty()).collect();
    for seg in href.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    parts.join("/")
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(v) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(v);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Append the Markdown rendering of one XHTML chapter to `out`.
fn html_to_markdown(html: &str, out: &mut MarkdownWriter) {
    let mut walker = HtmlWalker {
        out,
        skip_depth: 0,
        bold: 0,
        italic: 0,
        heading: None,
        runs: Vec::new(),
    };
    for token in Tokenizer::new(html) {
        walker.feed(token);
    }
    walker.flush();
}

struct HtmlWalker<'w> {
    out: &'w mut MarkdownWriter,
    skip_depth: usize,
    bold: usize,
    italic: usize,
    heading: Option<usize>,
    runs: Vec<Run>,
}

impl HtmlWalker<'_> {
    fn feed(&mut self, token: Token<'_>) {
        match token {
            Token::Start {
                name, self_closing, ..
            } => {
                let name = markup::local_name(name);
                if is_skipped(&name) {
                    if !self_closing {
                        self.skip_depth += 1;
                    }
                    return;
                }
                if self.skip_depth > 0 {
                    return;
                }
                if let Some(level) = heading_level(&name) {
                    self.flush();
                    if !self_closing {
                        self.heading = Some(level.min(4));
                    }
                } else if is_block(&name) {
                    self.flush();
                } else if !self_closing {
                    match name.as_str() {
                        "b" | "strong" => self.bold += 1,
                        "i" | "em" => self.italic += 1,
                        _ => {}
                    }
                }
            }
            Token::End { name } => {
                let name = markup::local_name(name);
                if is_skipped(&name) {
                    self.skip_depth = self.skip_depth.saturating_sub(1);
                    return;
                }
                if self.skip_depth > 0 {
                    return;
                }
                if heading_level(&name).is_some() {
                    self.flush();
                    self.heading = None;
                } else if is_block(&name) {
                    self.flush();
                } else {
                    match name.as_str() {
                        "b" | "strong" => self.bold = self.bold.saturating_sub(1),
                        "i" | "em" => self.italic = self.italic.saturating_sub(1),
                        _ => {}
                    }
                }
            }
            Token::Text(text) => {
                if self.skip_depth == 0 {
                    self.runs
                        .push(Run::new(text, self.bold > 0, self.italic > 0));
                }
            }
        }
    }

    fn flush(&mut self) {
        let runs = std::mem::take(&mut self.runs);
        match self.heading {
            Some(level) => self.out.heading(level, &super::runs_text(&runs)),
            None => self.out.paragraph(&runs),
        }
    }
}

fn is_skipped(name: &str) -> bool {
    matches!(name, "head" | "script" | "style" | "svg")
}

fn is_block(name: &str) -> bool {
    matches!(
        name,
        "p" | "div"
            | "br"
            | "li"
            | "ul"
            | "ol"
            | "dd"
            | "dt"
            | "blockquote"
            | "pre"
            | "section"
            | "article"
            | "body"
            | "table"
            | "tr"
            | "hr"
    )
}

fn heading_level(name: &str) -> Option<usize> {
    let digit = name.strip_prefix('h')?;
    match digit {
        "1" | "2" | "3" | "4" | "5" | "6" => digit.parse().ok(),
        _ => None,
    }
}
