//! Source formats and their converters to canonical Markdown.
//!
//! Each [`DocumentConverter`] is a synchronous, CPU-bound function from source
//! bytes to Markdown text. The conversion stage runs converters on the
//! blocking pool and owns all storage I/O, so converters never see a
//! [`crate::store::FileStore`].
//!
//! A converter must not panic on malformed input. It reports failure with a
//! [`ConvertError`], and [`DocumentConverter::convert_lossy`] turns that into
//! a small Markdown document carrying an explicit error paragraph.

pub mod docx;
pub mod epub;
pub mod fb2;
pub mod markup;
pub mod text;

use crate::config::{MIB, UNPACK_RATIO};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use zip::ZipArchive;

/// Decompression budget of archive converters built without a config.
pub const DEFAULT_UNPACK_LIMIT: u64 = 15 * MIB * UNPACK_RATIO;

/// Supported source formats, detected by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentFormat {
    /// Canonical format, passed through unchanged.
    Markdown,
    Text,
    Fb2,
    Epub,
    Docx,
}

impl DocumentFormat {
    /// Detect the format from a file name (case-insensitive extension).
    pub fn from_file_name(name: &str) -> Option<Self> {
        let ext = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "md" | "markdown" => Some(Self::Markdown),
            "txt" => Some(Self::Text),
            "fb2" => Some(Self::Fb2),
            "epub" => Some(Self::Epub),
            "docx" => Some(Self::Docx),
            _ => None,
        }
    }

    pub fn is_canonical(self) -> bool {
        self == Self::Markdown
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Markdown => "md",
            Self::Text => "txt",
            Self::Fb2 => "fb2",
            Self::Epub => "epub",
            Self::Docx => "docx",
        }
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Why a single source could not be converted.
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("not a valid archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("missing part '{0}'")]
    MissingPart(String),

    #[error("malformed document: {0}")]
    Malformed(String),

    #[error("archive expands beyond {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("read error: {0}")]
    Io(#[from] std::io::Error),
}

/// Converts one source format to canonical Markdown.
pub trait DocumentConverter: Send + Sync {
    fn format(&self) -> DocumentFormat;

    fn convert(&self, bytes: &[u8]) -> Result<String, ConvertError>;

    /// Like [`convert`](Self::convert), but malformed input yields a document
    /// with an error paragraph instead of an error.
    fn convert_lossy(&self, origin_name: &str, bytes: &[u8]) -> String {
        match self.convert(bytes) {
            Ok(md) => md,
            Err(e) => {
                tracing::warn!(file = origin_name, format = %self.format(), "Conversion failed: {}", e);
                error_document(origin_name, &e.to_string())
            }
        }
    }
}

/// Zip reader that stops once the entries read so far decompress to more
/// than `limit` bytes in total.
///
/// Declared entry sizes are never trusted: every read goes through
/// [`Read::take`] with the remaining budget.
pub struct BoundedArchive<'a> {
    archive: ZipArchive<Cursor<&'a [u8]>>,
    limit: u64,
    remaining: u64,
}

impl<'a> BoundedArchive<'a> {
    pub fn new(bytes: &'a [u8], limit: u64) -> Result<Self, ConvertError> {
        Ok(Self {
            archive: ZipArchive::new(Cursor::new(bytes))?,
            limit,
            remaining: limit,
        })
    }

    pub fn file_names(&self) -> impl Iterator<Item = &str> {
        self.archive.file_names()
    }

    /// Read one entry, charging its decompressed size to the budget.
    pub fn read(&mut self, name: &str) -> Result<Vec<u8>, ConvertError> {
        let file = self.archive.by_name(name).map_err(|e| match e {
            zip::result::ZipError::FileNotFound => ConvertError::MissingPart(name.to_string()),
            other => ConvertError::Archive(other),
        })?;
        let mut buf = Vec::new();
        file.take(self.remaining.saturating_add(1))
            .read_to_end(&mut buf)?;
        let read = buf.len() as u64;
        if read > self.remaining {
            return Err(ConvertError::TooLarge { limit: self.limit });
        }
        self.remaining -= read;
        Ok(buf)
    }
}

/// Markdown body standing in for a document that could not be read.
pub fn error_document(origin_name: &str, reason: &str) -> String {
    format!(
        "> **Error:** could not convert '{}': {}\n",
        origin_name,
        reason.replace('\n', " ")
    )
}

/// `.md` sources only need decoding.
pub struct MarkdownPassthrough;

impl DocumentConverter for MarkdownPassthrough {
    fn format(&self) -> DocumentFormat {
        DocumentFormat::Markdown
    }

    fn convert(&self, bytes: &[u8]) -> Result<String, ConvertError> {
        Ok(text::decode_text(bytes).into_owned())
    }
}

/// Lookup table from format to converter.
#[derive(Clone)]
pub struct ConverterRegistry {
    converters: HashMap<DocumentFormat, Arc<dyn DocumentConverter>>,
}

impl ConverterRegistry {
    /// Every built-in converter, with archive formats allowed to decompress
    /// to at most `unpack_limit` bytes per document.
    pub fn with_unpack_limit(unpack_limit: u64) -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(MarkdownPassthrough));
        registry.register(Arc::new(text::TextConverter));
        registry.register(Arc::new(fb2::Fb2Converter));
        registry.register(Arc::new(epub::EpubConverter::new(unpack_limit)));
        registry.register(Arc::new(docx::DocxConverter::new(unpack_limit)));
        registry
    }

    /// A registry with no converters.
    pub fn empty() -> Self {
        Self {
            converters: HashMap::new(),
        }
    }

    /// Register (or replace) the converter for its format.
    pub fn register(&mut self, converter: Arc<dyn DocumentConverter>) {
        self.converters.insert(converter.format(), converter);
    }

    pub fn get(&self, format: DocumentFormat) -> Option<Arc<dyn DocumentConverter>> {
        self.converters.get(&format).cloned()
    }
}

impl Default for ConverterRegistry {
    fn default() -> Self {
        Self::with_unpack_limit(DEFAULT_UNPACK_LIMIT)
    }
}

// ── Markdown output ──────────────────────────────────────────────────────

/// A piece of inline text with its emphasis.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Run {
    pub text: String,
    pub bold: bool,
    pub italic: bool,
}

impl Run {
    pub fn new(text: impl Into<String>, bold: bool, italic: bool) -> Self {
        Self {
            text: text.into(),
            bold,
            italic,
        }
    }
}

/// Accumulates Markdown blocks separated by blank lines.
#[derive(Debug, Default)]
pub struct MarkdownWriter {
    blocks: Vec<String>,
}

impl MarkdownWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// `# text` with `level` clamped to 1..=6. Blank headings are dropped.
    pub fn heading(&mut self, level: usize, text: &str) {
        let text = markup::collapse_whitespace(text);
        let text = text.trim();
        if !text.is_empty() {
            self.blocks
                .push(format!("{} {}", "#".repeat(level.clamp(1, 6)), text));
        }
    }

    pub fn plain_paragraph(&mut self, text: &str) {
        let text = text.trim();
        if !text.is_empty() {
            self.blocks.push(text.to_string());
        }
    }

    /// A paragraph built from emphasis runs. Whitespace inside the paragraph
    /// is collapsed; blank paragraphs are dropped.
    pub fn paragraph(&mut self, runs: &[Run]) {
        let rendered = render_runs(runs);
        self.plain_paragraph(&rendered);
    }

    /// One paragraph whose lines are joined by hard breaks (`\` at line end).
    pub fn paragraph_lines(&mut self, lines: &[Vec<Run>]) {
        let rendered: Vec<String> = lines
            .iter()
            .map(|l| render_runs(l))
            .filter(|l| !l.is_empty())
            .collect();
        self.plain_paragraph(&rendered.join("\\\n"));
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn finish(self) -> String {
        if self.blocks.is_empty() {
            return String::new();
        }
        let mut out = self.blocks.join("\n\n");
        out.push('\n');
        out
    }
}

/// Plain text of a run sequence, emphasis dropped.
pub fn runs_text(runs: &[Run]) -> String {
    let joined: String = runs.iter().map(|r| r.text.as_str()).collect();
    markup::collapse_whitespace(&joined).trim().to_string()
}

fn render_runs(runs: &[Run]) -> String {
    // Merge neighbours with equal emphasis so "**a****b**" never appears.
    let mut merged: Vec<Run> = Vec::with_capacity(runs.len());
    for run in runs {
        let text = markup::collapse_whitespace(&run.text);
        if text.is_empty() {
            continue;
        }
        match merged.last_mut() {
            Some(last) if last.bold == run.bold && last.italic == run.italic => {
                last.text.push_str(&text);
            }
            _ => merged.push(Run::new(text, run.bold, run.italic)),
        }
    }

    let mut out = String::new();
    for run in &merged {
        let marker = match (run.bold, run.italic) {
            (true, true) => "***",
            (true, false) => "**",
            (false, true) => "*",
            (false, false) => "",
        };
        let core = run.text.trim();
        if marker.is_empty() || core.is_empty() {
            out.push_str(&run.text);
            continue;
        }
        // Markers hug the words; surrounding spaces stay outside.
        if run.text.starts_with(' ') {
            out.push(' ');
        }
        out.push_str(marker);
        out.push_str(core);
        out.push_str(marker);
        if run.text.ends_with(' ') {
            out.push(' ');
        }
    }
    markup::collapse_whitespace(&out).trim().to_string()
}
