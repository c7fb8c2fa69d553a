//! Heuristic status detection for an assistant running inside a terminal.
//!
//! Classification works on plain text (escape sequences already stripped) and never
//! tracks cursor position. Each chunk yields at most one [`Verdict`]; a chunk that matches
//! nothing yields [`Verdict::None`] and is otherwise untouched. Misclassification is
//! tolerated: status is advisory and never drives process control.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::strip::AnsiStripper;

/// Advisory state of the wrapped assistant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Idle,
    Running,
    Working,
    Ready,
    Completed,
    Errored,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Idle => "idle",
            Status::Running => "running",
            Status::Working => "working",
            Status::Ready => "ready",
            Status::Completed => "completed",
            Status::Errored => "errored",
        }
    }

    /// Completed and errored are only reached through process exit.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Errored)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of classifying one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// No transition.
    None,
    /// Transition immediately.
    Emit(Status),
    /// Completion marker without a prompt redraw: transition to ready after the
    /// configured delay unless superseded. Replaces any previously scheduled ready.
    ScheduleReady,
    /// Thinking output that does not change status but still supersedes a scheduled ready.
    CancelPending,
}

/// Glyph and text sets the classifier matches against.
///
/// Defaults target the Claude Code TUI. Every set is plain substring matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Patterns {
    /// "Turn complete" markers.
    pub completion_markers: Vec<String>,
    /// Prompt box border glyphs.
    pub prompt_borders: Vec<String>,
    /// Prompt caret glyphs.
    pub prompt_carets: Vec<String>,
    /// Footer text shown only while the prompt is waiting for input.
    pub ready_hints: Vec<String>,
    /// Thinking/spinner glyphs.
    pub spinners: Vec<String>,
    /// Text shown only while a turn is in progress.
    pub working_hints: Vec<String>,
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for Patterns {
    fn default() -> Self {
        Self {
            completion_markers: owned(&["⏺", "●"]),
            prompt_borders: owned(&["╭", "╰"]),
            prompt_carets: owned(&["│ >", "│ ❯", "❯"]),
            ready_hints: owned(&["? for shortcuts", "for shortcuts"]),
            spinners: owned(&[
                "✻", "✽", "✶", "✳", "✢", "⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏",
            ]),
            working_hints: owned(&["esc to interrupt"]),
        }
    }
}

fn contains_any(text: &str, needles: &[String]) -> bool {
    needles
        .iter()
        .any(|needle| !needle.is_empty() && text.contains(needle.as_str()))
}

impl Patterns {
    pub fn has_completion_marker(&self, text: &str) -> bool {
        contains_any(text, &self.completion_markers)
    }

    /// Prompt box border and caret both present.
    pub fn has_prompt(&self, text: &str) -> bool {
        contains_any(text, &self.prompt_borders) && contains_any(text, &self.prompt_carets)
    }

    pub fn has_ready_hint(&self, text: &str) -> bool {
        contains_any(text, &self.ready_hints)
    }

    pub fn is_thinking(&self, text: &str) -> bool {
        contains_any(text, &self.spinners) || contains_any(text, &self.working_hints)
    }
}

/// Classify one chunk of plain text.
///
/// `elapsed` is the time since the last transition (`None` if there has been none).
/// Heuristic transitions closer together than `flap_window` are suppressed, except the
/// marker-plus-prompt case which is unambiguous and always immediate.
///
/// Precedence:
/// 1. completion marker + prompt border + caret: `ready` now
/// 2. completion marker alone: schedule `ready`
/// 3. thinking glyphs: `working` now (or cancel the scheduled ready)
/// 4. prompt border + caret + ready hint: `ready` now
/// 5. anything else: no transition
pub fn classify(
    patterns: &Patterns,
    prior: Status,
    text: &str,
    elapsed: Option<Duration>,
    flap_window: Duration,
) -> Verdict {
    if text.is_empty() {
        return Verdict::None;
    }

    let has_marker = patterns.has_completion_marker(text);
    let has_prompt = patterns.has_prompt(text);

    if has_marker && has_prompt {
        return if prior == Status::Ready {
            Verdict::None
        } else {
            Verdict::Emit(Status::Ready)
        };
    }

    if has_marker {
        return if prior == Status::Ready {
            Verdict::None
        } else {
            Verdict::ScheduleReady
        };
    }

    let settled = elapsed.map_or(true, |e| e >= flap_window);

    if patterns.is_thinking(text) {
        return if prior == Status::Working || !settled {
            Verdict::CancelPending
        } else {
            Verdict::Emit(Status::Working)
        };
    }

    if has_prompt && patterns.has_ready_hint(text) && prior != Status::Ready && settled {
        return Verdict::Emit(Status::Ready);
    }

    Verdict::None
}

/// Stateful wrapper around [`classify`] for a single session.
///
/// Owns an [`AnsiStripper`] so escape sequences split across chunks never reach the
/// matcher. Timers live with the caller: a [`Verdict::ScheduleReady`] marks a pending ready
/// which the caller later resolves with [`Classifier::fire_pending_at`] or drops with
/// [`Classifier::cancel_pending`].
#[derive(Default)]
pub struct Classifier {
    patterns: Patterns,
    flap_window: Duration,
    status: Status,
    last_transition: Option<Instant>,
    pending_ready: bool,
    stripper: AnsiStripper,
}

impl Classifier {
    pub fn new(flap_window: Duration) -> Self {
        Self::with_patterns(Patterns::default(), flap_window)
    }

    pub fn with_patterns(patterns: Patterns, flap_window: Duration) -> Self {
        Self {
            patterns,
            flap_window,
            ..Default::default()
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn has_pending(&self) -> bool {
        self.pending_ready
    }

    /// Force a lifecycle-driven status (spawn, exit). Clears any pending ready.
    /// Returns the previous status if it changed.
    pub fn set_status_at(&mut self, status: Status, now: Instant) -> Option<Status> {
        self.pending_ready = false;
        if self.status == status {
            return None;
        }
        let previous = self.status;
        self.status = status;
        self.last_transition = Some(now);
        Some(previous)
    }

    pub fn observe(&mut self, chunk: &[u8]) -> Verdict {
        self.observe_at(chunk, Instant::now())
    }

    pub fn observe_at(&mut self, chunk: &[u8], now: Instant) -> Verdict {
        if self.status.is_terminal() {
            return Verdict::None;
        }

        let text = self.stripper.feed(chunk);
        let elapsed = self
            .last_transition
            .map(|at| now.saturating_duration_since(at));
        let verdict = classify(
            &self.patterns,
            self.status,
            &text,
            elapsed,
            self.flap_window,
        );

        match verdict {
            Verdict::Emit(status) => {
                self.status = status;
                self.last_transition = Some(now);
                self.pending_ready = false;
            }
            Verdict::ScheduleReady => self.pending_ready = true,
            Verdict::CancelPending => self.pending_ready = false,
            Verdict::None => {}
        }

        verdict
    }

    /// Resolve a scheduled ready. Returns `Some(Ready)` if a transition happened.
    pub fn fire_pending_at(&mut self, now: Instant) -> Option<Status> {
        if !std::mem::take(&mut self.pending_ready) {
            return None;
        }
        if self.status == Status::Ready || self.status.is_terminal() {
            return None;
        }
        self.status = Status::Ready;
        self.last_transition = Some(now);
        Some(Status::Ready)
    }

    pub fn cancel_pending(&mut self) {
        self.pending_ready = false;
    }
}
