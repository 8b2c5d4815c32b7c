//! Streamed output classification for assistant CLI sessions.
//!
//! The CLI is expected to emit one JSON object per line, but occasionally
//! prints free-form human-readable text: progress messages, or an
//! interactive prompt awaiting a keypress. [`StreamClassifier`] turns the
//! raw PTY byte stream into discrete [`Classified`] events:
//!
//! - complete lines that parse as JSON become structured events, in input
//!   order;
//! - lines that don't parse accumulate in a separate buffer which is flushed
//!   through the prompt detector — either when the driver's debounce timer
//!   fires, or immediately when a structured line arrives (proof the CLI is
//!   back on its line-oriented protocol, so buffered text is stale and must
//!   not be awaited further, nor delay the structured event);
//! - at process exit a trailing partial line gets one final JSON parse, the
//!   buffer is flushed, and the session id learned so far is reported.
//!
//! The classifier itself is timer-free so it can be tested without time; the
//! driver task in [`crate::assistant`] owns the single-slot debounce
//! deadline and calls [`StreamClassifier::flush_pending`] when it fires.

use serde_json::Value;

use super::prompt::{detect_prompt, strip_ansi, DetectedPrompt};

/// A classified piece of assistant output.
#[derive(Debug)]
pub enum Classified {
    /// A line that parsed as JSON — the CLI's structured protocol.
    Structured(Value),
    /// Buffered free text recognized as an interactive prompt.
    Prompt {
        prompt: DetectedPrompt,
        /// ANSI-stripped, trimmed text the prompt was detected in.
        raw_text: String,
    },
    /// Buffered free text with no prompt in it (raw, unstripped).
    Stderr(String),
}

/// Result of feeding one chunk into the classifier.
#[derive(Debug, Default)]
pub struct FeedOutcome {
    /// Events to emit, in order.
    pub events: Vec<Classified>,
    /// True when this chunk buffered new free text — the driver must (re)arm
    /// its debounce timer.
    pub rearm_debounce: bool,
}

impl FeedOutcome {
    fn push(&mut self, event: Classified) {
        self.events.push(event);
    }
}

/// Line-splitting, JSON-or-text classification state for one CLI process.
pub struct StreamClassifier {
    /// Incomplete trailing line of the byte stream.
    line_buf: String,
    /// Accumulated non-JSON lines awaiting flush.
    text_buf: String,
    /// Resumable session id adopted from the stream, if any.
    session_id: Option<String>,
}

impl StreamClassifier {
    pub fn new(initial_session_id: Option<String>) -> Self {
        Self {
            line_buf: String::new(),
            text_buf: String::new(),
            session_id: initial_session_id,
        }
    }

    /// The session id learned so far (either inherited or adopted from a
    /// structured event's `sessionId`/`session_id` field).
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Whether free text is buffered awaiting a flush.
    pub fn has_pending(&self) -> bool {
        !self.text_buf.trim().is_empty()
    }

    /// Consume a chunk of terminal output.
    pub fn feed(&mut self, chunk: &str) -> FeedOutcome {
        let mut outcome = FeedOutcome::default();

        self.line_buf.push_str(chunk);
        if !self.line_buf.contains('\n') {
            return outcome;
        }

        let buf = std::mem::take(&mut self.line_buf);
        let mut lines: Vec<&str> = buf.split('\n').collect();
        // The final element is the (possibly empty) unterminated remainder.
        self.line_buf = lines.pop().unwrap_or_default().to_string();

        for line in lines {
            self.classify_line(line, &mut outcome);
        }
        outcome
    }

    fn classify_line(&mut self, line: &str, outcome: &mut FeedOutcome) {
        let trimmed = line.trim_end_matches('\r').trim();
        if trimmed.is_empty() {
            return;
        }

        match serde_json::from_str::<Value>(trimmed) {
            Ok(event) => {
                // Structured events take priority: flush stale free text now
                // rather than letting it ride the debounce any further.
                if self.has_pending() {
                    if let Some(flushed) = self.flush_pending() {
                        outcome.push(flushed);
                    }
                }
                self.adopt_session_id(&event);
                outcome.push(Classified::Structured(event));
            }
            Err(_) => {
                self.text_buf.push_str(line);
                self.text_buf.push('\n');
                outcome.rearm_debounce = true;
            }
        }
    }

    /// Flush the free-text buffer through the prompt detector.
    ///
    /// Whitespace-only buffers are discarded silently. Text with no
    /// detectable prompt becomes a [`Classified::Stderr`] event carrying the
    /// raw (unstripped) text — but only when the ANSI-stripped form is
    /// non-empty.
    pub fn flush_pending(&mut self) -> Option<Classified> {
        let text = std::mem::take(&mut self.text_buf);
        if text.trim().is_empty() {
            return None;
        }

        let clean = strip_ansi(&text);
        let clean = clean.trim();
        if let Some(prompt) = detect_prompt(clean) {
            return Some(Classified::Prompt {
                prompt,
                raw_text: clean.to_string(),
            });
        }
        if clean.is_empty() {
            return None;
        }
        Some(Classified::Stderr(text))
    }

    /// Process-exit handling: one final JSON parse of the trailing partial
    /// line (a session id arriving only here is still adopted), then flush
    /// whatever free text remains.
    pub fn finish(&mut self) -> Vec<Classified> {
        let mut events = Vec::new();

        let rest = std::mem::take(&mut self.line_buf);
        let trimmed = rest.trim_end_matches('\r').trim();
        if !trimmed.is_empty() {
            match serde_json::from_str::<Value>(trimmed) {
                Ok(event) => {
                    self.adopt_session_id(&event);
                    events.push(Classified::Structured(event));
                }
                Err(_) => self.text_buf.push_str(&rest),
            }
        }

        if let Some(flushed) = self.flush_pending() {
            events.push(flushed);
        }
        events
    }

    /// Both key spellings are accepted; the CLI has used each.
    fn adopt_session_id(&mut self, event: &Value) {
        let id = event
            .get("sessionId")
            .or_else(|| event.get("session_id"))
            .and_then(Value::as_str);
        if let Some(id) = id {
            self.session_id = Some(id.to_string());
        }
    }
}
