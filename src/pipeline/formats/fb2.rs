//! FictionBook 2 (`.fb2`) converter.
//!
//! Walks every `<body>`; `<section>` nesting decides heading levels, `<strong>`
//! and `<emphasis>` become emphasis runs, and epigraphs, citations and author
//! lines are rendered in italics. Embedded `<binary>` images and the
//! `<description>` metadata block are skipped.

use super::markup::{Token, Tokenizer};
use super::text::decode_text;
use super::{runs_text, ConvertError, DocumentConverter, DocumentFormat, MarkdownWriter, Run};

pub struct Fb2Converter;

impl DocumentConverter for Fb2Converter {
    fn format(&self) -> DocumentFormat {
        DocumentFormat::Fb2
    }

    fn convert(&self, bytes: &[u8]) -> Result<String, ConvertError> {
        let xml = decode_text(bytes);
        let mut walker = Walker::default();
        for token in Tokenizer::new(&xml) {
            walker.feed(token);
        }
        if !walker.saw_body {
            return Err(ConvertError::Malformed("no <body> element".into()));
        }
        walker.flush_para();
        Ok(walker.out.finish())
    }
}

#[derive(Default)]
struct Walker {
    out: MarkdownWriter,
    saw_body: bool,
    body_depth: usize,
    skip_depth: usize,
    section_depth: usize,
    /// Inside `<epigraph>`, `<cite>` or similar blocks rendered in italics.
    italic_blocks: usize,
    bold: usize,
    italic: usize,
    /// `Some` while inside `<title>`: the title's paragraphs so far.
    title: Option<Vec<String>>,
    /// `Some` while inside a paragraph-like element.
    para: Option<Vec<Run>>,
    subtitle: bool,
}

impl Walker {
    fn feed(&mut self, token: Token<'_>) {
        match token {
            Token::Start {
                name, self_closing, ..
            } => {
                let name = super::markup::local_name(name);
                if self_closing {
                    return;
                }
                self.start(&name);
            }
            Token::End { name } => self.end(&super::markup::local_name(name)),
            Token::Text(text) => {
                if self.skip_depth > 0 || self.body_depth == 0 {
                    return;
                }
                if let Some(runs) = self.para.as_mut() {
                    runs.push(Run::new(
                        text,
                        self.bold > 0,
                        self.italic > 0 || self.italic_blocks > 0,
                    ));
                } else if self.title.is_none() && !text.trim().is_empty() {
                    // Stray text directly inside a section.
                    self.out.plain_paragraph(&text);
                }
            }
        }
    }

    fn start(&mut self, name: &str) {
        if matches!(name, "description" | "binary") || self.skip_depth > 0 {
            if matches!(name, "description" | "binary") {
                self.skip_depth += 1;
            }
            return;
        }
        match name {
            "body" => {
                self.body_depth += 1;
                self.saw_body = true;
            }
            _ if self.body_depth == 0 => {}
            "section" => self.section_depth += 1,
            "title" => self.title = Some(Vec::new()),
            "epigraph" | "cite" | "annotation" | "poem" => self.italic_blocks += 1,
            "strong" => self.bold += 1,
            "emphasis" => self.italic += 1,
            "subtitle" => {
                self.flush_para();
                self.subtitle = true;
                self.para = Some(Vec::new());
            }
            "p" | "v" | "text-author" => {
                if self.subtitle {
                    return;
                }
                self.flush_para();
                if name == "text-author" {
                    self.italic_blocks += 1;
                }
                self.para = Some(Vec::new());
            }
            _ => {}
        }
    }

    fn end(&mut self, name: &str) {
        if matches!(name, "description" | "binary") {
            self.skip_depth = self.skip_depth.saturating_sub(1);
            return;
        }
        if self.skip_depth > 0 || self.body_depth == 0 {
            return;
        }
        match name {
            "body" => self.body_depth -= 1,
            "section" => self.section_depth = self.section_depth.saturating_sub(1),
            "title" => {
                if let Some(lines) = self.title.take() {
                    let level = self.section_depth.clamp(1, 4);
                    self.out.heading(level, &lines.join(" "));
                }
            }
            "epigraph" | "cite" | "annotation" | "poem" => {
                self.italic_blocks = self.italic_blocks.saturating_sub(1)
            }
            "strong" => self.bold = self.bold.saturating_sub(1),
            "emphasis" => self.italic = self.italic.saturating_sub(1),
            "subtitle" => {
                if let Some(runs) = self.para.take() {
                    let level = (self.section_depth + 1).clamp(2, 6);
                    self.out.heading(level, &runs_text(&runs));
                }
                self.subtitle = false;
            }
            "p" | "v" | "text-author" => {
                // <p> inside <subtitle> is not standard; the subtitle keeps its runs.
                if self.subtitle {
                    return;
                }
                self.flush_para();
                if name == "text-author" {
                    self.italic_blocks = self.italic_blocks.saturating_sub(1);
                }
            }
            _ => {}
        }
    }

    /// Emit the open paragraph, into the title when inside one.
    fn flush_para(&mut self) {
        let Some(runs) = self.para.take() else {
            return;
        };
        if let Some(title) = self.title.as_mut() {
            title.push(runs_text(&runs));
        } else {
            self.out.paragraph(&runs);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<FictionBook xmlns="http://www.gribuser.ru/xml/fictionbook/2.0">
  <description><title-info><book-title>Meta Title</book-title></title-info></description>
  <body>
    <title><p>The Book</p></title>
    <section>
      <title><p>Chapter 1</p><p>Arrival</p></title>
      <epigraph><p>Quote here</p><text-author>Someone</text-author></epigraph>
      <p>It was a <strong>dark</strong> and <emphasis>stormy</emphasis> night.</p>
      <section>
        <title><p>Part A</p></title>
        <subtitle>Interlude</subtitle>
        <p>Deep&#160;text &amp; more</p>
      </section>
    </section>
  </body>
  <binary id="cover.jpg" content-type="image/jpeg">AAAA</binary>
</FictionBook>"#;

    #[test]
    fn converts_structure_and_emphasis() {
        let md = Fb2Converter.convert(SAMPLE.as_bytes()).unwrap();
        let expected = "# The Book\n\n\
                        # Chapter 1 Arrival\n\n\
                        *Quote here*\n\n\
                        *Someone*\n\n\
                        It was a **dark** and *stormy* night.\n\n\
                        ## Part A\n\n\
                        ### Interlude\n\n\
                        Deep text & more\n";
        assert_eq!(md, expected);
    }

    #[test]
    fn metadata_and_binaries_are_skipped() {
        let md = Fb2Converter.convert(SAMPLE.as_bytes()).unwrap();
        assert!(!md.contains("Meta Title"));
        assert!(!md.contains("AAAA"));
    }

    #[test]
    fn missing_body_is_an_error() {
        let err = Fb2Converter
            .convert(b"<FictionBook><description/></FictionBook>")
            .unwrap_err();
        assert!(err.to_string().contains("body"));
    }

    #[test]
    fn unclosed_tags_do_not_fail() {
        let md = Fb2Converter
            .convert(b"<FictionBook><body><section><p>one<p>two")
            .unwrap();
        assert!(md.contains("one"));
    }
}
