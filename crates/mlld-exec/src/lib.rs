// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! mlld-exec
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Node and python adapters.
pub mod code;
/// Heredoc tag selection and parameter delivery.
pub mod delivery;
/// Low-level process spawning shared by all adapters.
pub mod process;
/// Shell adapter.
pub mod shell;

use async_trait::async_trait;
use mlld_core::MlldError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

pub use code::{NodeRunner, PythonRunner};
pub use delivery::{heredoc_tag, wrap_heredoc, ParamDelivery, INLINE_LIMIT};
pub use shell::ShellRunner;

// ── Language ────────────────────────────────────────────────────────────

/// Language tags the executor recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    /// POSIX shell (`sh { … }` bodies and `cmd { … }` commands).
    Shell,
    /// JavaScript via the `node` binary (`js { … }` / `node { … }`).
    Node,
    /// Python via `python3`.
    Python,
}

impl Language {
    /// Parse a source-level language tag.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "sh" | "bash" | "shell" | "cmd" => Some(Self::Shell),
            "js" | "node" | "javascript" => Some(Self::Node),
            "python" | "py" | "python3" => Some(Self::Python),
            _ => None,
        }
    }

    /// The interpreter binary for this language.
    #[must_use]
    pub fn binary(&self) -> &'static str {
        match self {
            Self::Shell => "sh",
            Self::Node => "node",
            Self::Python => "python3",
        }
    }
}

// ── Request / outcome ───────────────────────────────────────────────────

/// A parameter bound for an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    /// Formal parameter name.
    pub name: String,
    /// Textual value as delivered to the callee.
    pub value: String,
    /// JSON payload, when the binding carries typed data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<serde_json::Value>,
}

impl Param {
    /// Text-only parameter.
    #[must_use]
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            json: None,
        }
    }
}

/// Per-call execution settings.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    /// Working directory; inherits the process cwd when absent.
    pub cwd: Option<PathBuf>,
    /// Per-call deadline; no deadline when absent.
    pub timeout: Option<Duration>,
    /// Operation name for provenance and diagnostics (`echo`, `validate`).
    pub operation: String,
}

impl ExecutionContext {
    /// Context with only an operation name.
    #[must_use]
    pub fn named(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Self::default()
        }
    }

    /// Set a deadline (builder).
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// What an adapter is asked to run.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    /// The code body or command line.
    pub code: String,
    /// Bound parameters, in declaration order.
    pub params: Vec<Param>,
    /// Explicit stdin content, when the caller provides one.
    pub stdin: Option<String>,
    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
    /// Execution settings.
    pub ctx: ExecutionContext,
}

/// What came back: the full §4.8 contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecOutcome {
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr; never collapsed into stdout.
    pub stderr: String,
    /// Exit code; `-1` when the process died without one.
    pub exit_code: i32,
    /// Whether the deadline expired and the process was terminated.
    pub timed_out: bool,
}

impl ExecOutcome {
    /// Returns `true` on a clean zero exit without timeout.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// Convert a timeout into the taxonomy error; pass other outcomes through.
    ///
    /// # Errors
    ///
    /// Returns [`MlldError::Timeout`] when the deadline expired.
    pub fn into_result(self, operation: &str, timeout: Option<Duration>) -> Result<Self, MlldError> {
        if self.timed_out {
            return Err(MlldError::Timeout {
                operation: operation.to_string(),
                seconds: timeout.map_or(0, |t| t.as_secs()),
            });
        }
        Ok(self)
    }
}

// ── Runner ──────────────────────────────────────────────────────────────

/// One language adapter.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Execute the request and capture the outcome.
    ///
    /// # Errors
    ///
    /// Fails when the runtime binary cannot be spawned or an I/O channel
    /// breaks; a non-zero exit is *not* an error at this layer.
    async fn execute(&self, request: ExecRequest) -> Result<ExecOutcome, MlldError>;

    /// The language this adapter serves.
    fn language(&self) -> Language;
}

/// The full set of adapters, selected by language.
pub struct RunnerSet {
    shell: ShellRunner,
    node: NodeRunner,
    python: PythonRunner,
}

impl RunnerSet {
    /// Adapters with default binaries (`sh`, `node`, `python3`).
    #[must_use]
    pub fn new() -> Self {
        Self {
            shell: ShellRunner::new(),
            node: NodeRunner::new(),
            python: PythonRunner::new(),
        }
    }

    /// The adapter for `language`.
    #[must_use]
    pub fn for_language(&self, language: Language) -> &dyn Runner {
        match language {
            Language::Shell => &self.shell,
            Language::Node => &self.node,
            Language::Python => &self.python,
        }
    }
}

impl Default for RunnerSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_tags_resolve() {
        assert_eq!(Language::from_tag("js"), Some(Language::Node));
        assert_eq!(Language::from_tag("node"), Some(Language::Node));
        assert_eq!(Language::from_tag("python"), Some(Language::Python));
        assert_eq!(Language::from_tag("sh"), Some(Language::Shell));
        assert_eq!(Language::from_tag("rust"), None);
    }

    #[test]
    fn outcome_timeout_maps_to_taxonomy_error() {
        let outcome = ExecOutcome {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: -1,
            timed_out: true,
        };
        let err = outcome
            .into_result("sleep", Some(Duration::from_secs(3)))
            .unwrap_err();
        assert!(matches!(err, MlldError::Timeout { seconds: 3, .. }));
    }

    #[test]
    fn nonzero_exit_is_not_an_adapter_error() {
        let outcome = ExecOutcome {
            stdout: String::new(),
            stderr: "boom".into(),
            exit_code: 2,
            timed_out: false,
        };
        assert!(outcome.clone().into_result("x", None).is_ok());
        assert!(!outcome.is_success());
    }
}
