//! Text normalization
//!
//! Captured text is canonicalized before hashing and indexing so that NFC
//! and NFD spellings of the same grapheme, Windows line endings and pasted
//! no-break spaces all collapse to one identity:
//!
//! - Unicode NFC composition
//! - `\r\n` and bare `\r` become `\n`
//! - BOM removed, NBSP becomes a regular space
//! - leading/trailing whitespace trimmed

use unicode_normalization::UnicodeNormalization;

const BOM: char = '\u{FEFF}';
const NBSP: char = '\u{00A0}';

pub fn normalize_text(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                out.push('\n');
            }
            BOM => {}
            NBSP => out.push(' '),
            other => out.push(other),
        }
    }

    out.nfc().collect::<String>().trim().to_string()
}
