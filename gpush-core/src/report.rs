//! User-visible output, kept separate from the `log` facade.
//!
//! Reports are what the tool *says*; logs are what it *did*. Components
//! return `Report` values instead of printing so the binary decides where
//! they go and quiet mode can drop the chatty ones.

use crate::types::Change;

/// Width used when flowing report text. Fixed rather than probed from the
/// terminal: output is frequently piped.
pub const FLOW_WIDTH: usize = 76;

/// One unit of user-visible output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Report {
    /// Prose; re-wrapped to `FLOW_WIDTH` when rendered.
    Flowed(String),
    /// Preformatted text emitted verbatim (tables, command output).
    Fixed(String),
    /// A reference to one Change, rendered on a single indented line.
    ChangeRef {
        key: u64,
        id: String,
        src: String,
        line: String,
    },
}

impl Report {
    /// Builds a `ChangeRef` for a Change with a trailing annotation.
    pub fn change(ch: &Change, line: impl Into<String>) -> Self {
        Report::ChangeRef {
            key: ch.key,
            id: ch.id.clone(),
            src: ch.src.clone(),
            line: line.into(),
        }
    }

    /// Renders the report to its final textual form (no trailing newline).
    pub fn render(&self) -> String {
        match self {
            Report::Flowed(text) => wrap(text, FLOW_WIDTH),
            Report::Fixed(text) => text.clone(),
            Report::ChangeRef { id, src, line, .. } => {
                format!("  {} ({}) {}", id, src, line)
            }
        }
    }
}

/// Greedy word-wrap. Words longer than `width` are emitted on their own
/// line rather than split.
pub fn wrap(text: &str, width: usize) -> String {
    let mut out = String::new();
    for (i, paragraph) in text.split('\n').enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let mut col = 0;
        for word in paragraph.split_whitespace() {
            if col > 0 && col + 1 + word.len() > width {
                out.push('\n');
                col = 0;
            } else if col > 0 {
                out.push(' ');
                col += 1;
            }
            out.push_str(word);
            col += word.len();
        }
    }
    out
}
