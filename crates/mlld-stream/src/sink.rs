// SPDX-License-Identifier: MIT OR Apache-2.0
//! Built-in stream sinks.

use std::io::{IsTerminal, Write};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::{Envelope, StreamEvent};

/// Consumer of stream envelopes.
///
/// `accept` must not block: sinks run on the pump task and a slow sink
/// would stall its own subscription, not the producer.
pub trait StreamSink: Send + Sync {
    /// Deliver one envelope.
    fn accept(&self, envelope: &Envelope);

    /// Human-readable name for diagnostics.
    fn name(&self) -> &str;
}

// ── TerminalSink ────────────────────────────────────────────────────────

/// Writes chunks to stdout and diagnostics to stderr.
///
/// When stderr is not a TTY, stage/retry noise is suppressed and only
/// errors get through.
#[derive(Debug)]
pub struct TerminalSink {
    tty: bool,
}

impl TerminalSink {
    /// Sink that auto-detects whether stderr is a terminal.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tty: std::io::stderr().is_terminal(),
        }
    }

    /// Sink with an explicit TTY setting (tests).
    #[must_use]
    pub fn with_tty(tty: bool) -> Self {
        Self { tty }
    }
}

impl Default for TerminalSink {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamSink for TerminalSink {
    fn accept(&self, envelope: &Envelope) {
        match &envelope.event {
            StreamEvent::Chunk { content, .. } => {
                let mut out = std::io::stdout().lock();
                let _ = out.write_all(content.as_bytes());
                let _ = out.flush();
            }
            StreamEvent::Effect { kind, content } => {
                if kind == "stderr" || kind == "both" {
                    let _ = std::io::stderr().lock().write_all(content.as_bytes());
                }
                if kind == "stdout" || kind == "both" {
                    let _ = std::io::stdout().lock().write_all(content.as_bytes());
                }
            }
            StreamEvent::Stage { index, name, attempt } if self.tty => {
                let _ = writeln!(
                    std::io::stderr().lock(),
                    "· stage {index} {name} (try {attempt})"
                );
            }
            StreamEvent::Retry { stage, attempt, .. } if self.tty => {
                let _ = writeln!(
                    std::io::stderr().lock(),
                    "↻ stage {stage} retrying (try {attempt})"
                );
            }
            StreamEvent::Error { code, message } => {
                let _ = writeln!(std::io::stderr().lock(), "{code} {message}");
            }
            _ => {}
        }
    }

    fn name(&self) -> &str {
        "terminal"
    }
}

// ── ProgressSink ────────────────────────────────────────────────────────

/// Keeps a one-line status on stderr; never writes program output.
#[derive(Debug, Default)]
pub struct ProgressSink {
    last: Mutex<String>,
}

impl ProgressSink {
    /// New progress sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recent status line (tests).
    #[must_use]
    pub fn status(&self) -> String {
        self.last.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn update(&self, line: String) {
        let _ = write!(std::io::stderr().lock(), "\r{line}");
        if let Ok(mut last) = self.last.lock() {
            *last = line;
        }
    }
}

impl StreamSink for ProgressSink {
    fn accept(&self, envelope: &Envelope) {
        match &envelope.event {
            StreamEvent::Start { run_id } => self.update(format!("run {run_id} started")),
            StreamEvent::Stage { index, name, attempt } => {
                self.update(format!("stage {index} {name} (try {attempt})"));
            }
            StreamEvent::Retry { stage, attempt, .. } => {
                self.update(format!("stage {stage} retry -> try {attempt}"));
            }
            StreamEvent::Stop { duration_ms, .. } => {
                self.update(format!("done in {duration_ms} ms"));
                let _ = writeln!(std::io::stderr().lock());
            }
            StreamEvent::Error { code, .. } => {
                self.update(format!("failed ({code})"));
                let _ = writeln!(std::io::stderr().lock());
            }
            StreamEvent::Chunk { .. } | StreamEvent::Effect { .. } => {}
        }
    }

    fn name(&self) -> &str {
        "progress"
    }
}

// ── CollectorSink ───────────────────────────────────────────────────────

/// Everything a programmatic consumer needs after a streamed run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamingResult {
    /// Chunk contents in arrival order.
    pub chunks: Vec<String>,
    /// Every envelope seen, in arrival order.
    pub events: Vec<Envelope>,
    /// Concatenation of all chunks.
    pub final_output: String,
}

/// Buffers the whole stream into a [`StreamingResult`].
#[derive(Debug, Default)]
pub struct CollectorSink {
    result: Mutex<StreamingResult>,
}

impl CollectorSink {
    /// Empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the collected result.
    #[must_use]
    pub fn result(&self) -> StreamingResult {
        self.result.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl StreamSink for CollectorSink {
    fn accept(&self, envelope: &Envelope) {
        if let Ok(mut result) = self.result.lock() {
            if let StreamEvent::Chunk { content, .. } = &envelope.event {
                result.chunks.push(content.clone());
                result.final_output.push_str(content);
            }
            result.events.push(envelope.clone());
        }
    }

    fn name(&self) -> &str {
        "collector"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn collector_accumulates_chunks_and_final_output() {
        let sink = CollectorSink::new();
        for part in ["a", "b", "c"] {
            sink.accept(&Envelope::new(StreamEvent::Chunk {
                content: part.into(),
                stage: None,
            }));
        }
        let result = sink.result();
        assert_eq!(result.chunks, vec!["a", "b", "c"]);
        assert_eq!(result.final_output, "abc");
    }

    #[test]
    fn progress_sink_tracks_stage_and_stop() {
        let sink = ProgressSink::new();
        sink.accept(&Envelope::new(StreamEvent::Stage {
            index: 1,
            name: "validate".into(),
            attempt: 2,
        }));
        assert_eq!(sink.status(), "stage 1 validate (try 2)");
        sink.accept(&Envelope::new(StreamEvent::Stop {
            run_id: Uuid::nil(),
            duration_ms: 12,
        }));
        assert_eq!(sink.status(), "done in 12 ms");
    }

    #[test]
    fn terminal_sink_ignores_stage_noise_without_tty() {
        // Just exercising the non-TTY path for panics; output goes nowhere
        // useful under test.
        let sink = TerminalSink::with_tty(false);
        sink.accept(&Envelope::new(StreamEvent::Stage {
            index: 0,
            name: "s".into(),
            attempt: 1,
        }));
    }
}
