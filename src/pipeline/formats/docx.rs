//! Word (`.docx`) converter.
//!
//! Only `word/document.xml` is read. Paragraph styles named `Title` or
//! `Heading N` (English and Russian built-in names) map to headings; run
//! properties `<w:b/>` and `<w:i/>` map to emphasis.

use super::markup::{attr, Token, Tokenizer};
use super::{
    runs_text, BoundedArchive, ConvertError, DocumentConverter, DocumentFormat, MarkdownWriter,
    Run, DEFAULT_UNPACK_LIMIT,
};
use once_cell::sync::Lazy;
use regex::Regex;

const DOCUMENT_PART: &str = "word/document.xml";

pub struct DocxConverter {
    unpack_limit: u64,
}

impl DocxConverter {
    /// `unpack_limit` caps the decompressed size of `word/document.xml`.
    pub fn new(unpack_limit: u64) -> Self {
        Self { unpack_limit }
    }
}

impl Default for DocxConverter {
    fn default() -> Self {
        Self::new(DEFAULT_UNPACK_LIMIT)
    }
}

impl DocumentConverter for DocxConverter {
    fn format(&self) -> DocumentFormat {
        DocumentFormat::Docx
    }

    fn convert(&self, bytes: &[u8]) -> Result<String, ConvertError> {
        let mut archive = BoundedArchive::new(bytes, self.unpack_limit)?;
        let xml = String::from_utf8(archive.read(DOCUMENT_PART)?)
            .map_err(|_| ConvertError::Malformed(format!("{DOCUMENT_PART} is not UTF-8")))?;

        let mut out = MarkdownWriter::new();
        let mut para: Option<Paragraph> = None;
        let mut run: Option<RunProps> = None;
        let mut in_text = false;

        for token in Tokenizer::new(&xml) {
            match token {
                Token::Start {
                    name,
                    attrs,
                    self_closing,
                } => match name {
                    "w:p" => {
                        if let Some(p) = para.take() {
                            p.write(&mut out);
                        }
                        para = (!self_closing).then(Paragraph::default);
                    }
                    "w:pStyle" => {
                        if let Some(p) = para.as_mut() {
                            p.style = attr(attrs, "w:val");
                        }
                    }
                    "w:r" if !self_closing => run = Some(RunProps::default()),
                    "w:b" => {
                        if let Some(r) = run.as_mut() {
                            r.bold = toggle_on(attrs);
                        }
                    }
                    "w:i" => {
                        if let Some(r) = run.as_mut() {
                            r.italic = toggle_on(attrs);
                        }
                    }
                    "w:t" => in_text = !self_closing,
                    "w:tab" => push_text(&mut para, run.as_ref(), "\t"),
                    "w:br" | "w:cr" => {
                        if let Some(p) = para.as_mut() {
                            p.line_break();
                        }
                    }
                    _ => {}
                },
                Token::End { name } => match name {
                    "w:p" => {
                        if let Some(p) = para.take() {
                            p.write(&mut out);
                        }
                    }
                    "w:r" => run = None,
                    "w:t" => in_text = false,
                    _ => {}
                },
                Token::Text(text) if in_text => push_text(&mut para, run.as_ref(), &text),
                Token::Text(_) => {}
            }
        }
        if let Some(p) = para.take() {
            p.write(&mut out);
        }
        Ok(out.finish())
    }
}

#[derive(Default)]
struct Paragraph {
    style: Option<String>,
    /// Lines closed by `<w:br/>`.
    lines: Vec<Vec<Run>>,
    runs: Vec<Run>,
}

impl Paragraph {
    fn line_break(&mut self) {
        self.lines.push(std::mem::take(&mut self.runs));
    }

    fn write(mut self, out: &mut MarkdownWriter) {
        self.line_break();
        match self.style.as_deref().and_then(heading_level) {
            Some(level) => {
                let text: Vec<String> = self.lines.iter().map(|l| runs_text(l)).collect();
                out.heading(level, &text.join(" "));
            }
            None => out.paragraph_lines(&self.lines),
        }
    }
}

#[derive(Default, Clone, Copy)]
struct RunProps {
    bold: bool,
    italic: bool,
}

fn push_text(para: &mut Option<Paragraph>, run: Option<&RunProps>, text: &str) {
    let props = run.copied().unwrap_or_default();
    if let Some(p) = para.as_mut() {
        p.runs.push(Run::new(text, props.bold, props.italic));
    }
}

/// `<w:b/>` is on unless `w:val` says `0`, `false` or `off`.
fn toggle_on(attrs: &str) -> bool {
    !matches!(
        attr(attrs, "w:val").as_deref(),
        Some("0") | Some("false") | Some("off")
    )
}

static RE_HEADING_STYLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(?:heading|заголовок)\s*(\d)$").unwrap());

fn heading_level(style: &str) -> Option<usize> {
    if style.eq_ignore_ascii_case("title") {
        return Some(1);
    }
    let caps = RE_HEADING_STYLE.captures(style.trim())?;
    let level: usize = caps[1].parse().ok()?;
    Some(level.clamp(1, 4))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use zip::write::FileOptions;
    use zip::ZipWriter;

    fn build_docx(document_xml: &str) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        zip.start_file("[Content_Types].xml", FileOptions::default())
            .unwrap();
        zip.write_all(b"<Types/>").unwrap();
        zip.start_file(DOCUMENT_PART, FileOptions::default()).unwrap();
        zip.write_all(document_xml.as_bytes()).unwrap();
        zip.finish().unwrap().into_inner()
    }

    #[test]
    fn converts_headings_and_runs() {
        let xml = r#"<w:document><w:body>
<w:p><w:pPr><w:pStyle w:val="Heading2"/></w:pPr><w:r><w:t>Chapter 3</w:t></w:r></w:p>
<w:p><w:r><w:t xml:space="preserve">Plain </w:t></w:r><w:r><w:rPr><w:b/></w:rPr><w:t>bold</w:t></w:r><w:r><w:rPr><w:b w:val="0"/><w:i/></w:rPr><w:t xml:space="preserve"> italic</w:t></w:r></w:p>
<w:p/>
<w:p><w:r><w:t>Tab</w:t><w:tab/><w:t>bed &amp; done</w:t></w:r></w:p>
</w:body></w:document>"#;
        let md = DocxConverter::default().convert(&build_docx(xml)).unwrap();
        assert_eq!(md, "## Chapter 3\n\nPlain **bold** *italic*\n\nTab bed & done\n");
    }

    #[test]
    fn line_breaks_survive_whitespace_collapsing() {
        let xml = r#"<w:document><w:body>
<w:p><w:r><w:t>Roses are red,</w:t><w:br/><w:t>violets are</w:t></w:r><w:r><w:rPr><w:b/></w:rPr><w:t xml:space="preserve"> blue</w:t></w:r></w:p>
<w:p><w:pPr><w:pStyle w:val="Title"/></w:pPr><w:r><w:t>Two</w:t><w:br/><w:t>lines</w:t></w:r></w:p>
</w:body></w:document>"#;
        let md = DocxConverter::default().convert(&build_docx(xml)).unwrap();
        assert_eq!(md, "Roses are red,\\\nviolets are **blue**\n\n# Two lines\n");
    }

    #[test]
    fn oversized_document_part_is_rejected() {
        let body = format!(
            "<w:document><w:body><w:p><w:r><w:t>{}</w:t></w:r></w:p></w:body></w:document>",
            "a".repeat(4096)
        );
        let bytes = build_docx(&body);
        assert!(matches!(
            DocxConverter::new(1024).convert(&bytes),
            Err(ConvertError::TooLarge { limit: 1024 })
        ));
        assert!(DocxConverter::new(8192).convert(&bytes).is_ok());
    }

    #[test]
    fn style_names() {
        assert_eq!(heading_level("Title"), Some(1));
        assert_eq!(heading_level("heading 1"), Some(1));
        assert_eq!(heading_level("Heading9"), Some(4));
        assert_eq!(heading_level("Заголовок2"), Some(2));
        assert_eq!(heading_level("Normal"), None);
    }

    #[test]
    fn missing_document_part() {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        zip.start_file("other.xml", FileOptions::default()).unwrap();
        zip.write_all(b"<x/>").unwrap();
        let bytes = zip.finish().unwrap().into_inner();
        assert!(matches!(
            DocxConverter::default().convert(&bytes),
            Err(ConvertError::MissingPart(_))
        ));
    }
}
