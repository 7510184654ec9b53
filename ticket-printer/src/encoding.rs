//! Text encoding and layout utilities for thermal printers
//!
//! This module provides utilities for:
//! - Converting UTF-8 text into the printer's byte encoding
//! - Calculating text widths in printer columns
//! - Greedy word wrapping

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Character encoding used for text sent to the printer
///
/// `Utf8` passes the bytes through untouched, which is what printers with
/// native UTF-8 firmware expect. The legacy pages cover printers that only
/// speak a single-byte Cyrillic table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Codepage {
    #[default]
    Utf8,
    /// DOS Cyrillic (ESC/POS table 17)
    Cp866,
    /// Windows Cyrillic (ESC/POS table 46)
    Windows1251,
}

impl Codepage {
    /// ESC t n table number, `None` when no table selection is needed
    pub fn escpos_table(self) -> Option<u8> {
        match self {
            Codepage::Utf8 => None,
            Codepage::Cp866 => Some(17),
            Codepage::Windows1251 => Some(46),
        }
    }

    fn legacy(self) -> Option<&'static encoding_rs::Encoding> {
        match self {
            Codepage::Utf8 => None,
            Codepage::Cp866 => Some(encoding_rs::IBM866),
            Codepage::Windows1251 => Some(encoding_rs::WINDOWS_1251),
        }
    }
}

impl std::str::FromStr for Codepage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(Codepage::Utf8),
            "cp866" | "ibm866" => Ok(Codepage::Cp866),
            "cp1251" | "windows-1251" | "windows1251" => Ok(Codepage::Windows1251),
            other => Err(format!("Unknown codepage: {}", other)),
        }
    }
}

/// Encode text for the printer
///
/// Characters a legacy page cannot represent are replaced by numeric
/// character references (the encoder's behavior) and logged, never dropped.
pub fn encode_text(s: &str, codepage: Codepage) -> Vec<u8> {
    match codepage.legacy() {
        None => s.as_bytes().to_vec(),
        Some(encoding) => {
            let (bytes, _, had_errors) = encoding.encode(s);
            if had_errors {
                warn!(
                    codepage = ?codepage,
                    text = s,
                    "text contains characters outside the printer codepage"
                );
            }
            bytes.into_owned()
        }
    }
}

/// Width of a string in printer columns
///
/// Every character occupies one column on the receipt fonts we target.
pub fn text_width(s: &str) -> usize {
    s.chars().count()
}

/// Greedy word wrap
///
/// Words are packed onto a line while `line + 1 + word` still fits in
/// `width` columns. A word wider than `width` gets a line of its own and is
/// never split. Whitespace runs collapse to a single space.
///
/// # Panics
///
/// Panics if `width` is zero.
pub fn wrap_words(text: &str, width: usize) -> Vec<String> {
    assert!(width >= 1, "wrap width must be at least 1 column");

    let mut lines = Vec::new();
    let mut current = String::new();
    let mut current_width = 0;

    for word in text.split_whitespace() {
        let word_width = text_width(word);
        if current.is_empty() {
            current.push_str(word);
            current_width = word_width;
        } else if current_width + 1 + word_width <= width {
            current.push(' ');
            current.push_str(word);
            current_width += 1 + word_width;
        } else {
            lines.push(std::mem::take(&mut current));
            current.push_str(word);
            current_width = word_width;
        }
    }

    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_width() {
        assert_eq!(text_width("hello"), 5);
        assert_eq!(text_width("Привет"), 6);
        assert_eq!(text_width("AB Щи CD"), 8);
    }

    #[test]
    fn test_utf8_passthrough() {
        let text = "Пицца Маргарита";
        assert_eq!(encode_text(text, Codepage::Utf8), text.as_bytes());
    }

    #[test]
    fn test_cp866_encoding() {
        // 'П' = 0x8F, 'р' = 0xE0 in CP866
        assert_eq!(encode_text("Пр", Codepage::Cp866), vec![0x8F, 0xE0]);
        // ASCII is unchanged
        assert_eq!(encode_text("1x", Codepage::Cp866), b"1x".to_vec());
    }

    #[test]
    fn test_windows1251_encoding() {
        // 'П' = 0xCF, 'р' = 0xF0 in Windows-1251
        assert_eq!(encode_text("Пр", Codepage::Windows1251), vec![0xCF, 0xF0]);
    }

    #[test]
    fn test_codepage_from_str() {
        assert_eq!("CP866".parse::<Codepage>().unwrap(), Codepage::Cp866);
        assert_eq!("utf-8".parse::<Codepage>().unwrap(), Codepage::Utf8);
        assert!("latin9".parse::<Codepage>().is_err());
    }

    #[test]
    fn test_wrap_basic() {
        let lines = wrap_words("extra cheese, no onions, well done please", 16);
        assert_eq!(lines, vec!["extra cheese, no", "onions, well", "done please"]);
    }

    #[test]
    fn test_wrap_exact_fit() {
        // "aaa bbb" is exactly 7 columns
        assert_eq!(wrap_words("aaa bbb", 7), vec!["aaa bbb"]);
        assert_eq!(wrap_words("aaa bbb", 6), vec!["aaa", "bbb"]);
    }

    #[test]
    fn test_wrap_long_word_unsplit() {
        let lines = wrap_words("a supercalifragilistic b", 5);
        assert_eq!(lines, vec!["a", "supercalifragilistic", "b"]);
    }

    #[test]
    fn test_wrap_empty_and_whitespace() {
        assert!(wrap_words("", 10).is_empty());
        assert!(wrap_words("   \t\n ", 10).is_empty());
    }

    #[test]
    fn test_wrap_invariants() {
        let inputs = [
            "Соус чесночный, двойной сыр, без лука, халапеньо",
            "one two three four five six seven eight nine ten",
            "  spaced   out\twords\nacross  lines ",
            "x",
            "averyveryverylongwordthatexceedseverything and short",
        ];
        for input in inputs {
            let normalized = input.split_whitespace().collect::<Vec<_>>().join(" ");
            for width in 1..=30 {
                let lines = wrap_words(input, width);
                for line in &lines {
                    let single_word = !line.contains(' ');
                    assert!(
                        text_width(line) <= width || single_word,
                        "line {:?} exceeds width {}",
                        line,
                        width
                    );
                }
                assert_eq!(lines.join(" "), normalized);
            }
        }
    }

    #[test]
    #[should_panic]
    fn test_wrap_zero_width_panics() {
        wrap_words("anything", 0);
    }
}
