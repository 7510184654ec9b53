//! ESC/POS command builder
//!
//! Provides a fluent API for building ESC/POS print data. This is the
//! primitive layer under the ticket renderer; connectivity test pages and
//! other ad-hoc output are composed from the same calls.

use crate::encoding::{Codepage, encode_text, text_width};

const ESC: u8 = 0x1B;
const GS: u8 = 0x1D;

/// Horizontal text alignment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Align {
    Left,
    Center,
    Right,
}

/// Paper cut style used at the end of a ticket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CutMode {
    #[default]
    Full,
    Partial,
}

impl CutMode {
    /// Command bytes for this cut (GS V m)
    pub fn command(self) -> [u8; 3] {
        match self {
            CutMode::Full => [GS, 0x56, 0x00],
            CutMode::Partial => [GS, 0x56, 0x01],
        }
    }
}

/// ESC/POS command builder
///
/// Builds ESC/POS byte sequences for thermal printers.
/// Text is encoded with the builder's codepage as it is written.
pub struct EscPosBuilder {
    buf: Vec<u8>,
    width: usize,
    codepage: Codepage,
}

impl EscPosBuilder {
    /// Create a new builder with the specified paper width in characters
    ///
    /// Common widths:
    /// - 58mm paper: 32 characters
    /// - 80mm paper: 48 characters
    pub fn new(width: usize) -> Self {
        Self::with_codepage(width, Codepage::Utf8)
    }

    /// Create a builder that encodes text with a specific codepage
    ///
    /// Emits the initialize command (ESC @) and, for legacy codepages, the
    /// character table selection.
    pub fn with_codepage(width: usize, codepage: Codepage) -> Self {
        let mut buf = Vec::with_capacity(4096);
        // Initialize printer (ESC @)
        buf.extend_from_slice(&[ESC, 0x40]);
        if let Some(table) = codepage.escpos_table() {
            // ESC t n - Select character code table
            buf.extend_from_slice(&[ESC, 0x74, table]);
        }
        Self {
            buf,
            width,
            codepage,
        }
    }

    /// Get the configured paper width
    pub fn width(&self) -> usize {
        self.width
    }

    // === Text Output ===

    /// Write raw text
    pub fn text(&mut self, s: &str) -> &mut Self {
        let bytes = encode_text(s, self.codepage);
        self.buf.extend_from_slice(&bytes);
        self
    }

    /// Write text followed by newline
    pub fn line(&mut self, s: &str) -> &mut Self {
        self.text(s);
        self.buf.push(b'\n');
        self
    }

    /// Write empty line
    pub fn newline(&mut self) -> &mut Self {
        self.buf.push(b'\n');
        self
    }

    /// Print and feed n lines
    pub fn feed(&mut self, lines: u8) -> &mut Self {
        // ESC d n
        self.buf.extend_from_slice(&[ESC, 0x64, lines]);
        self
    }

    // === Alignment ===

    pub fn align(&mut self, align: Align) -> &mut Self {
        let n = match align {
            Align::Left => 0x00,
            Align::Center => 0x01,
            Align::Right => 0x02,
        };
        self.buf.extend_from_slice(&[ESC, 0x61, n]);
        self
    }

    /// Align text to center
    pub fn center(&mut self) -> &mut Self {
        self.align(Align::Center)
    }

    /// Align text to left (default)
    pub fn left(&mut self) -> &mut Self {
        self.align(Align::Left)
    }

    /// Align text to right
    pub fn right(&mut self) -> &mut Self {
        self.align(Align::Right)
    }

    // === Text Style ===

    /// Toggle emphasized (bold) text
    pub fn bold(&mut self, on: bool) -> &mut Self {
        self.buf.extend_from_slice(&[ESC, 0x45, u8::from(on)]);
        self
    }

    /// Character size multipliers, each clamped to 1..=8
    pub fn size(&mut self, width: u8, height: u8) -> &mut Self {
        let w = width.clamp(1, 8) - 1;
        let h = height.clamp(1, 8) - 1;
        // GS ! n
        self.buf.extend_from_slice(&[GS, 0x21, (w << 4) | h]);
        self
    }

    /// Double width and height
    pub fn double_size(&mut self) -> &mut Self {
        self.size(2, 2)
    }

    /// Double height only
    pub fn double_height(&mut self) -> &mut Self {
        self.size(1, 2)
    }

    /// Reset to normal size
    pub fn reset_size(&mut self) -> &mut Self {
        self.size(1, 1)
    }

    // === Separators ===

    /// Print a line of '=' characters
    pub fn sep_double(&mut self) -> &mut Self {
        self.line(&"=".repeat(self.width))
    }

    /// Print a line of '-' characters
    pub fn sep_single(&mut self) -> &mut Self {
        self.line(&"-".repeat(self.width))
    }

    // === Layout Helpers ===

    /// Print left and right text on the same line
    ///
    /// Left text is left-aligned, right text is right-aligned,
    /// with spaces filling the gap.
    pub fn line_lr(&mut self, left: &str, right: &str) -> &mut Self {
        let lw = text_width(left);
        let rw = text_width(right);

        if lw + rw >= self.width {
            // Too long, just print with space
            self.text(left);
            self.text(" ");
            self.line(right);
        } else {
            let spaces = self.width - lw - rw;
            self.text(left);
            self.text(&" ".repeat(spaces));
            self.line(right);
        }
        self
    }

    // === Paper Control ===

    /// Cut paper (full cut)
    pub fn cut(&mut self) -> &mut Self {
        self.cut_with(CutMode::Full)
    }

    /// Partial cut (leave a small connection)
    pub fn cut_partial(&mut self) -> &mut Self {
        self.cut_with(CutMode::Partial)
    }

    pub fn cut_with(&mut self, mode: CutMode) -> &mut Self {
        self.buf.extend_from_slice(&mode.command());
        self
    }

    // === Raw Commands ===

    /// Write raw bytes directly
    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Reset printer to default state
    pub fn reset(&mut self) -> &mut Self {
        self.buf.extend_from_slice(&[ESC, 0x40]);
        self
    }

    // === Build ===

    /// Finish and return the byte buffer
    pub fn build(self) -> Vec<u8> {
        self.buf
    }
}

impl Default for EscPosBuilder {
    fn default() -> Self {
        Self::new(48)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    #[test]
    fn test_builder_basic() {
        let mut b = EscPosBuilder::new(32);
        b.center()
            .double_size()
            .line("Заголовок")
            .reset_size()
            .left()
            .line("Content");

        let data = b.build();
        assert_eq!(&data[..2], &[0x1B, 0x40]);
        assert!(contains(&data, "Заголовок".as_bytes()));
        assert!(contains(&data, &[0x1D, 0x21, 0x11]));
        assert!(contains(&data, &[0x1B, 0x61, 0x01]));
    }

    #[test]
    fn test_line_lr() {
        let mut b = EscPosBuilder::new(20);
        b.line_lr("Cola", "3.00");

        let data = b.build();
        let s = String::from_utf8_lossy(&data);
        assert!(s.contains(&format!("Cola{}3.00\n", " ".repeat(12))));
    }

    #[test]
    fn test_line_lr_overflow() {
        let mut b = EscPosBuilder::new(8);
        b.line_lr("Pepperoni", "12.00");

        let s = String::from_utf8_lossy(&b.build()).to_string();
        assert!(s.contains("Pepperoni 12.00\n"));
    }

    #[test]
    fn test_separators() {
        let mut b = EscPosBuilder::new(10);
        b.sep_double();

        let data = b.build();
        let s = String::from_utf8_lossy(&data);
        assert!(s.contains("=========="));
    }

    #[test]
    fn test_size_and_bold_primitives() {
        let mut b = EscPosBuilder::new(48);
        b.size(3, 1).bold(true).bold(false).size(0, 9);

        let data = b.build();
        assert!(contains(&data, &[0x1D, 0x21, 0x20]));
        assert!(contains(&data, &[0x1B, 0x45, 0x01]));
        assert!(contains(&data, &[0x1B, 0x45, 0x00]));
        // Clamped to 1x8
        assert!(contains(&data, &[0x1D, 0x21, 0x07]));
    }

    #[test]
    fn test_feed_and_cut() {
        let mut b = EscPosBuilder::new(48);
        b.feed(3).cut();

        let data = b.build();
        assert!(data.ends_with(&[0x1B, 0x64, 0x03, 0x1D, 0x56, 0x00]));
    }

    #[test]
    fn test_codepage_selection() {
        let mut b = EscPosBuilder::with_codepage(48, Codepage::Cp866);
        b.text("П");

        let data = b.build();
        assert_eq!(data, vec![0x1B, 0x40, 0x1B, 0x74, 17, 0x8F]);
    }
}
