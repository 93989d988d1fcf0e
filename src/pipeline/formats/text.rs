//! Plain-text sources and byte decoding shared by the XML converters.

use super::{ConvertError, DocumentConverter, DocumentFormat, MarkdownWriter};
use std::borrow::Cow;

/// Decode bytes as UTF-8 (BOM stripped), falling back to Windows-1251.
///
/// Cyrillic e-books are still commonly distributed in cp1251; any byte
/// sequence is valid in it, so decoding never fails.
pub fn decode_text(bytes: &[u8]) -> Cow<'_, str> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(s) => Cow::Borrowed(s),
        Err(_) => Cow::Owned(bytes.iter().map(|&b| cp1251_char(b)).collect()),
    }
}

fn cp1251_char(b: u8) -> char {
    match b {
        0x00..=0x7F => b as char,
        0xC0..=0xFF => char::from_u32(0x0410 + u32::from(b - 0xC0)).unwrap_or('\u{FFFD}'),
        _ => CP1251_HIGH[usize::from(b - 0x80)],
    }
}

// 0x80..=0xBF
const CP1251_HIGH: [char; 64] = [
    'Ђ', 'Ѓ', '‚', 'ѓ', '„', '…', '†', '‡', '€', '‰', 'Љ', '‹', 'Њ', 'Ќ', 'Ћ', 'Џ', //
    'ђ', '‘', '’', '“', '”', '•', '–', '—', '\u{FFFD}', '™', 'љ', '›', 'њ', 'ќ', 'ћ', 'џ', //
    '\u{00A0}', 'Ў', 'ў', 'Ј', '¤', 'Ґ', '¦', '§', 'Ё', '©', 'Є', '«', '¬', '\u{00AD}', '®', 'Ї', //
    '°', '±', 'І', 'і', 'ґ', 'µ', '¶', '·', 'ё', '№', 'є', '»', 'ј', 'Ѕ', 'ѕ', 'ї',
];

/// `.txt`: every non-empty line becomes a paragraph.
pub struct TextConverter;

impl DocumentConverter for TextConverter {
    fn format(&self) -> DocumentFormat {
        DocumentFormat::Text
    }

    fn convert(&self, bytes: &[u8]) -> Result<String, ConvertError> {
        let text = decode_text(bytes);
        let mut out = MarkdownWriter::new();
        for line in text.lines() {
            let line = line.trim();
            if !line.is_empty() {
                out.plain_paragraph(line);
            }
        }
        Ok(out.finish())
    }
}
