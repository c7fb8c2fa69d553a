//! Escape-sequence stripping for classifier input.

use vte::{Parser, Perform};

/// Collects printable output, dropping every control and escape sequence.
#[derive(Default)]
struct PlainText {
    text: String,
}

impl Perform for PlainText {
    fn print(&mut self, c: char) {
        self.text.push(c);
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            b'\n' | b'\r' => self.text.push('\n'),
            b'\t' => self.text.push('\t'),
            _ => {}
        }
    }
}

/// Streaming ANSI stripper.
///
/// Parser state survives between calls, so an escape sequence or multi-byte character
/// split across two PTY reads is still recognised.
pub struct AnsiStripper {
    parser: Parser,
    sink: PlainText,
}

impl Default for AnsiStripper {
    fn default() -> Self {
        Self::new()
    }
}

impl AnsiStripper {
    pub fn new() -> Self {
        Self {
            parser: Parser::new(),
            sink: PlainText::default(),
        }
    }

    /// Feed one chunk and return the plain text it produced.
    pub fn feed(&mut self, chunk: &[u8]) -> String {
        for byte in chunk {
            self.parser.advance(&mut self.sink, *byte);
        }
        std::mem::take(&mut self.sink.text)
    }
}

/// One-shot stripping for input that is known to be complete.
pub fn strip_ansi(data: &[u8]) -> String {
    AnsiStripper::new().feed(data)
}
