// SPDX-License-Identifier: MIT OR Apache-2.0
//! Effect routing.
//!
//! `show`, `log`, and `output` do not write to stdout directly; they emit an
//! [`Effect`] through the environment's [`EffectHandler`]. Handlers exist
//! for the terminal, for test capture, and for discarding output entirely;
//! the interpreter adds a bus-forwarding handler when streaming is enabled.

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;

// ── Effect ──────────────────────────────────────────────────────────────

/// Where an effect's content goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectKind {
    /// Program output.
    Stdout,
    /// Diagnostics channel.
    Stderr,
    /// Both channels at once.
    Both,
    /// Write to a file (append by default, replace when `truncate` is set).
    File,
}

/// A single emitted effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Effect {
    /// Destination.
    pub kind: EffectKind,
    /// Content, already rendered.
    pub content: String,
    /// Target path for [`EffectKind::File`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// For file effects: replace the file instead of appending (`output`
    /// semantics; `append` leaves this false).
    #[serde(default)]
    pub truncate: bool,
    /// Originating directive or stage, for diagnostics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl Effect {
    /// A stdout effect.
    #[must_use]
    pub fn stdout(content: impl Into<String>) -> Self {
        Self {
            kind: EffectKind::Stdout,
            content: content.into(),
            path: None,
            truncate: false,
            source: None,
        }
    }

    /// A stderr effect.
    #[must_use]
    pub fn stderr(content: impl Into<String>) -> Self {
        Self {
            kind: EffectKind::Stderr,
            content: content.into(),
            path: None,
            truncate: false,
            source: None,
        }
    }

    /// A file-append effect.
    #[must_use]
    pub fn file(path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        Self {
            kind: EffectKind::File,
            content: content.into(),
            path: Some(path.into()),
            truncate: false,
            source: None,
        }
    }

    /// A file-replace effect (`output to <path>` semantics).
    #[must_use]
    pub fn file_replace(path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        Self {
            truncate: true,
            ..Self::file(path, content)
        }
    }

    /// Record the originating directive or stage (builder).
    #[must_use]
    pub fn from_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

// ── EffectHandler ───────────────────────────────────────────────────────

/// Sink for effects emitted during evaluation.
pub trait EffectHandler: Send + Sync {
    /// Deliver one effect. Implementations must not block on slow consumers.
    fn emit(&self, effect: Effect);

    /// Human-readable name for diagnostics.
    fn name(&self) -> &str;
}

// ── TerminalEffects ─────────────────────────────────────────────────────

/// Writes stdout effects to stdout and stderr effects to stderr.
///
/// File effects append, creating the file if needed; failures are logged
/// rather than propagated so one broken sink cannot abort the program.
#[derive(Debug, Default)]
pub struct TerminalEffects;

impl EffectHandler for TerminalEffects {
    fn emit(&self, effect: Effect) {
        match effect.kind {
            EffectKind::Stdout => {
                let mut out = std::io::stdout().lock();
                let _ = out.write_all(effect.content.as_bytes());
                let _ = out.flush();
            }
            EffectKind::Stderr => {
                let mut err = std::io::stderr().lock();
                let _ = err.write_all(effect.content.as_bytes());
                let _ = err.flush();
            }
            EffectKind::Both => {
                self.emit(Effect {
                    kind: EffectKind::Stdout,
                    ..effect.clone()
                });
                self.emit(Effect {
                    kind: EffectKind::Stderr,
                    ..effect
                });
            }
            EffectKind::File => {
                let Some(path) = &effect.path else {
                    warn!(target: "mlld.env", "file effect without a path");
                    return;
                };
                let mut open = std::fs::OpenOptions::new();
                open.create(true);
                if effect.truncate {
                    open.write(true).truncate(true);
                } else {
                    open.append(true);
                }
                let result = open
                    .open(path)
                    .and_then(|mut f| f.write_all(effect.content.as_bytes()));
                if let Err(err) = result {
                    warn!(target: "mlld.env", path = %path.display(), %err, "file effect failed");
                }
            }
        }
    }

    fn name(&self) -> &str {
        "terminal"
    }
}

// ── BufferedEffects ─────────────────────────────────────────────────────

/// Captures effects in memory; the test suite asserts against the buffer.
#[derive(Debug, Default)]
pub struct BufferedEffects {
    buffer: Mutex<Vec<Effect>>,
}

impl BufferedEffects {
    /// Empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything emitted so far, in order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Effect> {
        self.buffer.lock().map(|b| b.clone()).unwrap_or_default()
    }

    /// Concatenated stdout content.
    #[must_use]
    pub fn stdout(&self) -> String {
        self.snapshot()
            .iter()
            .filter(|e| matches!(e.kind, EffectKind::Stdout | EffectKind::Both))
            .map(|e| e.content.as_str())
            .collect()
    }

    /// Concatenated stderr content.
    #[must_use]
    pub fn stderr(&self) -> String {
        self.snapshot()
            .iter()
            .filter(|e| matches!(e.kind, EffectKind::Stderr | EffectKind::Both))
            .map(|e| e.content.as_str())
            .collect()
    }
}

impl EffectHandler for BufferedEffects {
    fn emit(&self, effect: Effect) {
        if let Ok(mut buffer) = self.buffer.lock() {
            buffer.push(effect);
        }
    }

    fn name(&self) -> &str {
        "buffered"
    }
}

// ── NullEffects ─────────────────────────────────────────────────────────

/// Discards everything. Used by `validate` runs.
#[derive(Debug, Default)]
pub struct NullEffects;

impl EffectHandler for NullEffects {
    fn emit(&self, _effect: Effect) {}

    fn name(&self) -> &str {
        "null"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffered_handler_captures_in_order() {
        let buf = BufferedEffects::new();
        buf.emit(Effect::stdout("a\n"));
        buf.emit(Effect::stderr("warn\n"));
        buf.emit(Effect::stdout("b\n"));
        assert_eq!(buf.stdout(), "a\nb\n");
        assert_eq!(buf.stderr(), "warn\n");
        assert_eq!(buf.snapshot().len(), 3);
    }

    #[test]
    fn both_kind_lands_in_both_views() {
        let buf = BufferedEffects::new();
        buf.emit(Effect {
            kind: EffectKind::Both,
            content: "x".into(),
            path: None,
            truncate: false,
            source: None,
        });
        assert_eq!(buf.stdout(), "x");
        assert_eq!(buf.stderr(), "x");
    }

    #[test]
    fn file_effect_carries_path() {
        let e = Effect::file("/tmp/out.md", "content").from_source("output");
        assert_eq!(e.kind, EffectKind::File);
        assert_eq!(e.path.as_deref(), Some(std::path::Path::new("/tmp/out.md")));
        assert_eq!(e.source.as_deref(), Some("output"));
    }
}
