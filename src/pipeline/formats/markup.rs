//! Forgiving XML/XHTML tokenizer.
//!
//! FB2, EPUB chapters and DOCX `document.xml` are all XML dialects, but files
//! found in the wild are frequently not well-formed: unclosed `<p>`s, stray
//! `&` characters, HTML entities in XML. A strict parser would reject them
//! outright. [`Tokenizer`] instead yields a flat stream of start tags, end tags
//! and decoded text and never fails; the per-format walkers keep their own
//! nesting counters and simply ignore anything they do not understand.

use once_cell::sync::Lazy;
use regex::Regex;
use std::borrow::Cow;

/// One lexical item of the markup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token<'a> {
    /// `<name attrs>` or `<name attrs/>`.
    Start {
        name: &'a str,
        attrs: &'a str,
        self_closing: bool,
    },
    /// `</name>`.
    End { name: &'a str },
    /// Character data with entities decoded.
    Text(Cow<'a, str>),
}

impl Token<'_> {
    /// Lower-cased tag name with any namespace prefix removed (`w:p` → `p`).
    pub fn local_name(&self) -> Option<String> {
        match self {
            Token::Start { name, .. } | Token::End { name } => Some(local_name(name)),
            Token::Text(_) => None,
        }
    }
}

pub fn local_name(name: &str) -> String {
    name.rsplit(':').next().unwrap_or(name).to_ascii_lowercase()
}

/// Streaming tokenizer over a markup string.
pub struct Tokenizer<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Tokenizer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    /// Skip past `terminator` (or to the end of input when it never appears).
    fn skip_until(&mut self, terminator: &str) {
        match self.src[self.pos..].find(terminator) {
            Some(off) => self.pos += off + terminator.len(),
            None => self.pos = self.src.len(),
        }
    }
}

impl<'a> Iterator for Tokenizer<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Token<'a>> {
        loop {
            let rest = &self.src[self.pos..];
            if rest.is_empty() {
                return None;
            }

            if !rest.starts_with('<') {
                let end = rest.find('<').unwrap_or(rest.len());
                self.pos += end;
                return Some(Token::Text(decode_entities(&rest[..end])));
            }

            if rest.starts_with("<!--") {
                self.skip_until("-->");
                continue;
            }
            if let Some(body) = rest.strip_prefix("<![CDATA[") {
                let end = body.find("]]>").unwrap_or(body.len());
                let text = &body[..end];
                self.pos += "<![CDATA[".len() + end;
                self.skip_until("]]>");
                return Some(Token::Text(Cow::Borrowed(text)));
            }
            if rest.starts_with("<?") || rest.starts_with("<!") {
                self.skip_until(">");
                continue;
            }

            // A lone '<' that cannot open a tag is plain text.
            let opens_tag = rest[1..]
                .chars()
                .next()
                .is_some_and(|c| c == '/' || c.is_alphabetic() || c == '_');
            let Some(close) = rest.find('>').filter(|_| opens_tag) else {
                self.pos += 1;
                return Some(Token::Text(Cow::Borrowed("<")));
            };

            let inner = &rest[1..close];
            self.pos += close + 1;

            if let Some(name) = inner.strip_prefix('/') {
                return Some(Token::End { name: name.trim() });
            }

            let (inner, self_closing) = match inner.strip_suffix('/') {
                Some(stripped) => (stripped, true),
                None => (inner, false),
            };
            let name_end = inner
                .find(|c: char| c.is_whitespace())
                .unwrap_or(inner.len());
            return Some(Token::Start {
                name: &inner[..name_end],
                attrs: inner[name_end..].trim(),
                self_closing,
            });
        }
    }
}

static RE_ATTR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([A-Za-z_][-A-Za-z0-9_:.]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap()
});

/// Value of attribute `key` (exact, prefix included) in a raw attribute string.
pub fn attr(attrs: &str, key: &str) -> Option<String> {
    RE_ATTR.captures_iter(attrs).find_map(|caps| {
        if &caps[1] != key {
            return None;
        }
        let raw = caps.get(2).or_else(|| caps.get(3))?.as_str();
        Some(decode_entities(raw).into_owned())
    })
}

static RE_ENTITY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"&(#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|[A-Za-z]{2,8});").unwrap());

/// Decode XML and the common HTML character entities. Unknown entities are
/// left as they are.
pub fn decode_entities(text: &str) -> Cow<'_, str> {
    if !text.contains('&') {
        return Cow::Borrowed(text);
    }
    RE_ENTITY.replace_all(text, |caps: &regex::Captures<'_>| {
        let body = &caps[1];
        let decoded = if let Some(hex) = body.strip_prefix("#x").or_else(|| body.strip_prefix("#X")) {
            u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
        } else if let Some(dec) = body.strip_prefix('#') {
            dec.parse::<u32>().ok().and_then(char::from_u32)
        } else {
            named_entity(body)
        };
        match decoded {
            Some(c) => c.to_string(),
            None => caps[0].to_string(),
        }
    })
}

fn named_entity(name: &str) -> Option<char> {
    Some(match name {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => '\u{00A0}',
        "laquo" => '«',
        "raquo" => '»',
        "mdash" => '—',
        "ndash" => '–',
        "hellip" => '…',
        "lsquo" => '‘',
        "rsquo" => '’',
        "ldquo" => '“',
        "rdquo" => '”',
        "bdquo" => '„',
        "copy" => '©',
        "shy" => '\u{00AD}',
        _ => return None,
    })
}

static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Replace every whitespace run (non-breaking spaces included) with one space.
pub fn collapse_whitespace(text: &str) -> String {
    RE_WS.replace_all(text, " ").into_owned()
}
