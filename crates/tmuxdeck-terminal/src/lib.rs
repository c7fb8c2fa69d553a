//! tmuxdeck-terminal: terminal stream analysis
//!
//! This crate provides:
//! - `classify` / `Classifier`: heuristic assistant status detection from raw PTY output
//! - `AnsiStripper`: removes escape sequences so glyph matching sees plain text
//! - `Utf8Carry`: keeps PTY reads aligned on UTF-8 character boundaries
//!
//! # Usage
//!
//! ```rust
//! use std::time::Duration;
//! use tmuxdeck_terminal::{Classifier, Status, Verdict};
//!
//! let mut classifier = Classifier::new(Duration::from_millis(400));
//! let verdict = classifier.observe("✻ Pondering… (esc to interrupt)".as_bytes());
//! assert_eq!(verdict, Verdict::Emit(Status::Working));
//! ```

mod status;
mod strip;
mod utf8;

pub use status::{classify, Classifier, Patterns, Status, Verdict};
pub use strip::{strip_ansi, AnsiStripper};
pub use utf8::{find_utf8_boundary, Utf8Carry};
