// SPDX-License-Identifier: MIT OR Apache-2.0
//! Error catalog for the mlld runtime.
//!
//! Every error code follows the pattern `MLD-X###` where `X` is the category
//! letter and `###` is a three-digit number:
//!
//! - **V** — Validation errors
//! - **R** — Resolution errors
//! - **E** — Execution errors
//! - **L** — Policy (label-flow) errors
//! - **P** — Pipeline and protocol errors
//! - **S** — System errors

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ── SourceLocation ──────────────────────────────────────────────────────

/// A position in a source file, carried by AST nodes and surfaced in errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
pub struct SourceLocation {
    /// 1-based line.
    pub line: u32,
    /// 1-based column.
    pub column: u32,
}

impl SourceLocation {
    /// Construct a location.
    #[must_use]
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

// ── ErrorCode ───────────────────────────────────────────────────────────

/// Enumeration of all mlld error codes, organized by category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // ── Validation (V) ────────────────────────────────────────────────
    /// A required directive slot is missing or empty.
    MissingSlot,
    /// `export *` at publish time.
    WildcardExport,
    /// A shell operator or pipe inside a `cmd { … }` body.
    ShellPipeInCmd,
    /// `var` used inside a block body.
    VarInsideBlock,
    /// `let` used at module scope.
    LetAtModuleScope,
    /// A user executable redefines a reserved builtin name.
    ReservedStageName,
    /// `when any:` / `when all:` over an empty branch list.
    EmptyWhenModifier,
    /// Bare text inside a block body.
    BareTextInBlock,
    /// The parser emitted an error node.
    ParseError,

    // ── Resolution (R) ────────────────────────────────────────────────
    /// An undefined variable in strict mode.
    UndefinedVariable,
    /// Field access out of bounds (recoverable; yields empty text).
    FieldOutOfBounds,
    /// An import target could not be resolved.
    ModuleNotFound,
    /// Import resolution found a cycle.
    CircularImport,

    // ── Execution (E) ─────────────────────────────────────────────────
    /// External process exited non-zero outside a pipeline.
    NonZeroExit,
    /// The requested language runtime is not available.
    RuntimeUnavailable,
    /// External process exceeded its deadline.
    Timeout,

    // ── Policy (L) ────────────────────────────────────────────────────
    /// A label-flow rule denied the operation.
    PolicyDenied,
    /// A guard returned `deny`.
    GuardDenied,
    /// An after-guard would apply while streaming is enabled.
    StreamingAfterGuard,

    // ── Pipeline / protocol (P) ───────────────────────────────────────
    /// `retry` used outside a pipeline context.
    RetryOutsidePipeline,
    /// A pipeline stage exhausted its retry cap.
    MaxRetriesExceeded,
    /// A live-RPC frame could not be decoded.
    InvalidFrame,
    /// A live-RPC request kind is not recognized.
    UnknownRequest,

    // ── System (S) ────────────────────────────────────────────────────
    /// An I/O operation failed.
    IoError,
    /// JSON serialization or deserialization failed.
    SerializationError,
    /// The run was cancelled.
    Cancelled,
    /// An unexpected internal error.
    InternalError,
}

impl ErrorCode {
    /// Machine-readable code string (e.g. `"MLD-V001"`).
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            // Validation
            Self::MissingSlot => "MLD-V001",
            Self::WildcardExport => "MLD-V002",
            Self::ShellPipeInCmd => "MLD-V003",
            Self::VarInsideBlock => "MLD-V004",
            Self::LetAtModuleScope => "MLD-V005",
            Self::ReservedStageName => "MLD-V006",
            Self::EmptyWhenModifier => "MLD-V007",
            Self::BareTextInBlock => "MLD-V008",
            Self::ParseError => "MLD-V009",

            // Resolution
            Self::UndefinedVariable => "MLD-R001",
            Self::FieldOutOfBounds => "MLD-R002",
            Self::ModuleNotFound => "MLD-R003",
            Self::CircularImport => "MLD-R004",

            // Execution
            Self::NonZeroExit => "MLD-E001",
            Self::RuntimeUnavailable => "MLD-E002",
            Self::Timeout => "MLD-E003",

            // Policy
            Self::PolicyDenied => "MLD-L001",
            Self::GuardDenied => "MLD-L002",
            Self::StreamingAfterGuard => "MLD-L003",

            // Pipeline / protocol
            Self::RetryOutsidePipeline => "MLD-P001",
            Self::MaxRetriesExceeded => "MLD-P002",
            Self::InvalidFrame => "MLD-P003",
            Self::UnknownRequest => "MLD-P004",

            // System
            Self::IoError => "MLD-S001",
            Self::SerializationError => "MLD-S002",
            Self::Cancelled => "MLD-S003",
            Self::InternalError => "MLD-S004",
        }
    }

    /// Category letter for this code.
    #[must_use]
    pub fn category(&self) -> char {
        self.code().as_bytes()[4] as char
    }

    /// A remediation hint for well-known causes, when one exists.
    #[must_use]
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::ShellPipeInCmd => {
                Some("cmd bodies take a single command; use sh { … } for pipes and operators")
            }
            Self::VarInsideBlock => Some("use let for block-scoped bindings"),
            Self::LetAtModuleScope => Some("use var for module-level bindings"),
            Self::RetryOutsidePipeline => {
                Some("retry is only meaningful inside a pipeline stage or guard")
            }
            Self::StreamingAfterGuard => {
                Some("disable streaming for this invocation with `with { stream: false }`")
            }
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

// ── MlldError ───────────────────────────────────────────────────────────

/// The runtime error type.
///
/// Variants map one-to-one onto the spec's taxonomy; each carries enough
/// context to print exactly one diagnostic per root cause.
#[derive(Debug, Error)]
pub enum MlldError {
    /// Parser-level error; fatal.
    #[error("syntax error: {message}")]
    Syntax {
        /// What went wrong.
        message: String,
        /// Where.
        location: Option<SourceLocation>,
    },

    /// Structural error caught before execution; fatal.
    #[error("{message}")]
    Validation {
        /// Specific code within the V category.
        code: ErrorCode,
        /// What went wrong.
        message: String,
        /// Where.
        location: Option<SourceLocation>,
    },

    /// Name or field lookup failure.
    #[error("{message}")]
    Resolution {
        /// Specific code within the R category.
        code: ErrorCode,
        /// What went wrong.
        message: String,
        /// Where.
        location: Option<SourceLocation>,
    },

    /// External execution failure outside a pipeline.
    #[error("{message}")]
    Execution {
        /// What went wrong.
        message: String,
        /// Exit code, when the process ran at all.
        exit_code: Option<i32>,
        /// Where.
        location: Option<SourceLocation>,
    },

    /// A label-flow rule or guard denied the operation; fatal.
    #[error("policy denied: value labeled '{label}' may not flow to '{operation}' (rule: {rule})")]
    Policy {
        /// The offending label.
        label: String,
        /// The operation that was attempted.
        operation: String,
        /// The rule pattern that matched.
        rule: String,
        /// Where.
        location: Option<SourceLocation>,
    },

    /// External process exceeded its deadline; fatal.
    #[error("'{operation}' timed out after {seconds}s")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The deadline that expired.
        seconds: u64,
    },

    /// Import resolution found a cycle; fatal.
    #[error("circular import: {}", .chain.join(" -> "))]
    CircularImport {
        /// The module chain forming the cycle.
        chain: Vec<String>,
    },

    /// A pipeline stage exhausted its retry cap; fatal.
    #[error("stage {stage} exhausted its retry limit after {tries} attempts")]
    MaxRetriesExceeded {
        /// Zero-based stage index.
        stage: usize,
        /// Attempts made.
        tries: u32,
    },

    /// `retry` used outside a pipeline context.
    #[error("retry is not valid outside a pipeline")]
    RetryOutsidePipeline,

    /// After-guards cannot run once output has streamed.
    #[error("guard '{guard}' runs after execution and cannot apply to streamed output")]
    StreamingAfterGuard {
        /// The guard that would apply.
        guard: String,
    },

    /// The run was cancelled.
    #[error("run cancelled")]
    Cancelled,

    /// An I/O operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failed.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Anything unexpected.
    #[error("internal error: {message}")]
    Internal {
        /// What went wrong.
        message: String,
    },
}

impl MlldError {
    /// Convenience constructor for validation errors.
    #[must_use]
    pub fn validation(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Validation {
            code,
            message: message.into(),
            location: None,
        }
    }

    /// Convenience constructor for resolution errors.
    #[must_use]
    pub fn resolution(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Resolution {
            code,
            message: message.into(),
            location: None,
        }
    }

    /// Convenience constructor for execution errors.
    #[must_use]
    pub fn execution(message: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self::Execution {
            message: message.into(),
            exit_code,
            location: None,
        }
    }

    /// Convenience constructor for internal errors.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// The catalog code for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Syntax { .. } => ErrorCode::ParseError,
            Self::Validation { code, .. } | Self::Resolution { code, .. } => *code,
            Self::Execution { .. } => ErrorCode::NonZeroExit,
            Self::Policy { .. } => ErrorCode::PolicyDenied,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::CircularImport { .. } => ErrorCode::CircularImport,
            Self::MaxRetriesExceeded { .. } => ErrorCode::MaxRetriesExceeded,
            Self::RetryOutsidePipeline => ErrorCode::RetryOutsidePipeline,
            Self::StreamingAfterGuard { .. } => ErrorCode::StreamingAfterGuard,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::Io(_) => ErrorCode::IoError,
            Self::Json(_) => ErrorCode::SerializationError,
            Self::Internal { .. } => ErrorCode::InternalError,
        }
    }

    /// Process exit code per the CLI contract: 2 for syntax/validation,
    /// 3 for policy denials, 1 for everything else.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Syntax { .. } | Self::Validation { .. } => 2,
            Self::Policy { .. } | Self::StreamingAfterGuard { .. } => 3,
            Self::Resolution {
                code: ErrorCode::GuardDenied,
                ..
            } => 3,
            _ => 1,
        }
    }

    /// The source location, when one is attached.
    #[must_use]
    pub fn location(&self) -> Option<SourceLocation> {
        match self {
            Self::Syntax { location, .. }
            | Self::Validation { location, .. }
            | Self::Resolution { location, .. }
            | Self::Execution { location, .. }
            | Self::Policy { location, .. } => *location,
            _ => None,
        }
    }

    /// Attach a location to location-bearing variants; no-op otherwise.
    /// An already-present location wins.
    #[must_use]
    pub fn at(mut self, loc: SourceLocation) -> Self {
        match &mut self {
            Self::Syntax { location, .. }
            | Self::Validation { location, .. }
            | Self::Resolution { location, .. }
            | Self::Execution { location, .. }
            | Self::Policy { location, .. } => {
                location.get_or_insert(loc);
            }
            _ => {}
        }
        self
    }

    /// Prefix evaluation context (directive kind, stage, attempt) onto the
    /// message of message-bearing variants.
    #[must_use]
    pub fn in_context(mut self, context: &str) -> Self {
        match &mut self {
            Self::Syntax { message, .. }
            | Self::Validation { message, .. }
            | Self::Resolution { message, .. }
            | Self::Execution { message, .. }
            | Self::Internal { message } => {
                *message = format!("{context}: {message}");
            }
            _ => {}
        }
        self
    }

    /// Render the single-line diagnostic: `code [location] message (hint)`.
    #[must_use]
    pub fn render(&self) -> String {
        let code = self.code();
        let mut out = format!("{code} ", code = code.code());
        if let Some(loc) = self.location() {
            out.push_str(&format!("[{loc}] "));
        }
        out.push_str(&self.to_string());
        if let Some(hint) = code.hint() {
            out.push_str(&format!(" ({hint})"));
        }
        out
    }
}
