// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! mlld-core
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// The AST shape consumed by the evaluator.
pub mod ast;
/// Error taxonomy and the `MLD-X###` code catalog.
pub mod error;
/// Data labels, taint sources, and security descriptors.
pub mod security;
/// Truthiness and loose equality rules.
pub mod truthy;
/// Variable bindings and quantifier views.
pub mod variable;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use error::{ErrorCode, MlldError, SourceLocation};
pub use security::{DataLabel, SecurityDescriptor, TaintSource};
pub use truthy::{is_truthy, loose_eq};
pub use variable::{Variable, VariableKind, VariableSource};

/// Rough token estimate divisor: one token per four characters of text.
const TOKEN_CHARS: usize = 4;

// ── ValueKind ───────────────────────────────────────────────────────────

/// Discriminant for [`StructuredValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ValueKind {
    /// Plain text.
    Text,
    /// A value parsed from JSON whose payload is not an array or object.
    Json,
    /// An array.
    Array,
    /// An object.
    Object,
    /// A number.
    Number,
    /// A boolean.
    Boolean,
    /// The null value.
    Null,
    /// First-parameter wrapper handed to a code stage inside a pipeline.
    PipelineInput,
    /// Result of a file load (`<path>` or `<glob*>`).
    LoadResult,
    /// Result of an external execution.
    ExecResult,
}

// ── ValueData ───────────────────────────────────────────────────────────

/// Typed payload of a [`StructuredValue`].
///
/// Arrays built from file loads or parallel iteration keep per-element
/// structure (`Items`) so element descriptors and metadata survive indexing;
/// everything else is carried as plain JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum ValueData {
    /// Elements that are themselves structured values.
    Items(Vec<StructuredValue>),
    /// A plain JSON payload.
    Json(serde_json::Value),
}

// ── ValueMetadata ───────────────────────────────────────────────────────

/// Free-form metadata bag attached to a [`StructuredValue`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ValueMetadata {
    /// Filename the value was loaded from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,

    /// URL the value was fetched from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Content type of the original payload, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    /// Wire format of the upstream pipeline stage (`text`, `json`, `lines`, …).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,

    /// Raw text as produced upstream, before any parsing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_text: Option<String>,

    /// Exit code, for exec results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    /// Captured stderr, for exec results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,

    /// Anything else (parsed-AST references, resolver notes, …).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

// ── ValueCtx ────────────────────────────────────────────────────────────

/// The user-facing `.ctx` view of a value, exposed to templates and guards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ValueCtx {
    /// Label spellings, sorted.
    pub labels: Vec<String>,
    /// Taint spellings (`src:*`), sorted.
    pub taint: Vec<String>,
    /// Ordered provenance trail.
    pub sources: Vec<String>,
    /// Estimated token count of the textual view.
    pub tokens: u64,
    /// Filename, when the value came from a file load.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

// ── StructuredValue ─────────────────────────────────────────────────────

/// The uniform wrapper around every runtime value.
///
/// `text` is the canonical textual rendering and is always derivable;
/// `data` carries the typed payload for non-text kinds. Wrapping is
/// idempotent: wrapping a `StructuredValue` returns it unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StructuredValue {
    /// Discriminant for the payload.
    pub kind: ValueKind,

    /// Canonical textual rendering, when eagerly computed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Typed payload for non-text kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ValueData>,

    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "is_default_metadata")]
    pub metadata: ValueMetadata,

    /// Authoritative security state.
    #[serde(default, skip_serializing_if = "SecurityDescriptor::is_empty")]
    pub security: SecurityDescriptor,
}

fn is_default_metadata(m: &ValueMetadata) -> bool {
    *m == ValueMetadata::default()
}

impl StructuredValue {
    /// Wrap anything convertible into a structured value.
    ///
    /// Idempotent: `wrap(wrap(x)) == wrap(x)`.
    #[must_use]
    pub fn wrap(value: impl Into<StructuredValue>) -> Self {
        value.into()
    }

    /// A plain text value.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::Text,
            text: Some(text.into()),
            data: None,
            metadata: ValueMetadata::default(),
            security: SecurityDescriptor::default(),
        }
    }

    /// The null value.
    #[must_use]
    pub fn null() -> Self {
        Self::from(serde_json::Value::Null)
    }

    /// An array whose elements keep their own structure.
    #[must_use]
    pub fn items(items: Vec<StructuredValue>) -> Self {
        let security = SecurityDescriptor::merge_all(items.iter().map(|v| &v.security));
        Self {
            kind: ValueKind::Array,
            text: None,
            data: Some(ValueData::Items(items)),
            metadata: ValueMetadata::default(),
            security,
        }
    }

    /// Wrap the outcome of an external execution.
    ///
    /// `text` is the stdout; `data` is the JSON-parsed stdout when parsing
    /// succeeds. The descriptor gains `src:exec` taint and a provenance entry.
    #[must_use]
    pub fn exec_result(
        stdout: impl Into<String>,
        stderr: impl Into<String>,
        exit_code: i32,
        operation: impl Into<String>,
    ) -> Self {
        let stdout = stdout.into();
        let data = serde_json::from_str::<serde_json::Value>(stdout.trim())
            .ok()
            .map(ValueData::Json);
        let mut metadata = ValueMetadata::default();
        metadata.exit_code = Some(exit_code);
        let stderr = stderr.into();
        if !stderr.is_empty() {
            metadata.stderr = Some(stderr);
        }
        Self {
            kind: ValueKind::ExecResult,
            text: Some(stdout),
            data,
            metadata,
            security: SecurityDescriptor::tainted(
                TaintSource::Exec,
                format!("exec:{}", operation.into()),
            ),
        }
    }

    /// Wrap file content loaded from disk.
    #[must_use]
    pub fn load_result(content: impl Into<String>, filename: impl Into<String>) -> Self {
        let filename = filename.into();
        let mut metadata = ValueMetadata::default();
        metadata.filename = Some(filename.clone());
        Self {
            kind: ValueKind::LoadResult,
            text: Some(content.into()),
            data: None,
            metadata,
            security: SecurityDescriptor::tainted(TaintSource::File, format!("file:{filename}")),
        }
    }

    /// Wrap the value handed to the first parameter of a code stage.
    ///
    /// `format` reflects the upstream stage's output format; for `json` the
    /// payload is the parsed object while `raw_text` preserves the original.
    #[must_use]
    pub fn pipeline_input(upstream: &StructuredValue, format: impl Into<String>) -> Self {
        let format = format.into();
        let raw = upstream.as_text();
        let data = if format == "json" {
            upstream
                .as_json()
                .or_else(|| serde_json::from_str(raw.trim()).ok())
                .map(ValueData::Json)
        } else {
            Some(ValueData::Json(serde_json::Value::String(raw.clone())))
        };
        let mut metadata = ValueMetadata::default();
        metadata.format = Some(format);
        metadata.raw_text = Some(raw);
        Self {
            kind: ValueKind::PipelineInput,
            text: upstream.text.clone().or_else(|| Some(upstream.as_text())),
            data,
            metadata,
            security: upstream.security.clone(),
        }
    }

    /// The canonical textual view.
    ///
    /// Text-kind values return their text; arrays of items concatenate the
    /// elements' textual views; JSON payloads render compact except bare
    /// strings, which render unquoted.
    #[must_use]
    pub fn as_text(&self) -> String {
        if let Some(text) = &self.text {
            return text.clone();
        }
        match &self.data {
            Some(ValueData::Items(items)) => {
                items.iter().map(StructuredValue::as_text).collect::<Vec<_>>().join("")
            }
            Some(ValueData::Json(value)) => json_to_text(value),
            None => String::new(),
        }
    }

    /// The typed payload as plain JSON, flattening structured elements.
    #[must_use]
    pub fn as_json(&self) -> Option<serde_json::Value> {
        match &self.data {
            Some(ValueData::Json(value)) => Some(value.clone()),
            Some(ValueData::Items(items)) => Some(serde_json::Value::Array(
                items
                    .iter()
                    .map(|v| {
                        v.as_json()
                            .unwrap_or_else(|| serde_json::Value::String(v.as_text()))
                    })
                    .collect(),
            )),
            None => None,
        }
    }

    /// Structured elements, when the payload is an `Items` array.
    #[must_use]
    pub fn as_items(&self) -> Option<&[StructuredValue]> {
        match &self.data {
            Some(ValueData::Items(items)) => Some(items),
            _ => None,
        }
    }

    /// Estimated token count of the textual view.
    #[must_use]
    pub fn token_estimate(&self) -> u64 {
        (self.as_text().chars().count().div_ceil(TOKEN_CHARS)) as u64
    }

    /// The user-facing `.ctx` view.
    #[must_use]
    pub fn ctx(&self) -> ValueCtx {
        ValueCtx {
            labels: self.security.labels.iter().map(|l| l.as_str().to_string()).collect(),
            taint: self.security.taint.iter().map(ToString::to_string).collect(),
            sources: self.security.sources.clone(),
            tokens: self.token_estimate(),
            filename: self.metadata.filename.clone(),
        }
    }

    /// Returns a copy with `descriptor` merged into the security state.
    #[must_use]
    pub fn with_security(mut self, descriptor: &SecurityDescriptor) -> Self {
        self.security.absorb(descriptor);
        self
    }

    /// Returns a copy with the given upstream format recorded in metadata.
    #[must_use]
    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.metadata.format = Some(format.into());
        self
    }

    /// True when the value is truthy per the language rules.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        truthy::is_truthy(self)
    }
}

fn json_to_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn kind_for_json(value: &serde_json::Value) -> ValueKind {
    match value {
        serde_json::Value::Null => ValueKind::Null,
        serde_json::Value::Bool(_) => ValueKind::Boolean,
        serde_json::Value::Number(_) => ValueKind::Number,
        serde_json::Value::String(_) => ValueKind::Text,
        serde_json::Value::Array(_) => ValueKind::Array,
        serde_json::Value::Object(_) => ValueKind::Object,
    }
}

impl From<serde_json::Value> for StructuredValue {
    fn from(value: serde_json::Value) -> Self {
        let kind = kind_for_json(&value);
        if let serde_json::Value::String(s) = value {
            return Self::text(s);
        }
        Self {
            kind,
            text: None,
            data: Some(ValueData::Json(value)),
            metadata: ValueMetadata::default(),
            security: SecurityDescriptor::default(),
        }
    }
}

impl From<&str> for StructuredValue {
    fn from(s: &str) -> Self {
        Self::text(s)
    }
}

impl From<String> for StructuredValue {
    fn from(s: String) -> Self {
        Self::text(s)
    }
}

impl From<f64> for StructuredValue {
    fn from(n: f64) -> Self {
        Self::from(serde_json::json!(n))
    }
}

impl From<i64> for StructuredValue {
    fn from(n: i64) -> Self {
        Self::from(serde_json::json!(n))
    }
}

impl From<bool> for StructuredValue {
    fn from(b: bool) -> Self {
        Self::from(serde_json::Value::Bool(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_is_idempotent() {
        let once = StructuredValue::wrap("hello");
        let twice = StructuredValue::wrap(once.clone());
        assert_eq!(once, twice);
        assert_eq!(once.as_text(), twice.as_text());

        let json = StructuredValue::wrap(serde_json::json!({"a": 1}));
        assert_eq!(StructuredValue::wrap(json.clone()), json);
    }

    #[test]
    fn text_kind_textual_view_is_the_text() {
        let v = StructuredValue::text("plain");
        assert_eq!(v.kind, ValueKind::Text);
        assert_eq!(v.as_text(), "plain");
        assert!(v.data.is_none());
    }

    #[test]
    fn json_kinds_follow_payload() {
        assert_eq!(StructuredValue::from(serde_json::json!(3)).kind, ValueKind::Number);
        assert_eq!(StructuredValue::from(true).kind, ValueKind::Boolean);
        assert_eq!(StructuredValue::null().kind, ValueKind::Null);
        assert_eq!(
            StructuredValue::from(serde_json::json!([1, 2])).kind,
            ValueKind::Array
        );
        assert_eq!(
            StructuredValue::from(serde_json::json!({"k": "v"})).kind,
            ValueKind::Object
        );
    }

    #[test]
    fn exec_result_auto_parses_json_stdout() {
        let v = StructuredValue::exec_result(r#"{"ok": true}"#, "", 0, "echo");
        assert_eq!(v.kind, ValueKind::ExecResult);
        assert_eq!(v.as_json(), Some(serde_json::json!({"ok": true})));
        assert!(v.security.has_taint(&TaintSource::Exec));
        assert_eq!(v.security.sources, vec!["exec:echo"]);
    }

    #[test]
    fn exec_result_keeps_non_json_stdout_as_text() {
        let v = StructuredValue::exec_result("hello world", "warn", 0, "echo");
        assert_eq!(v.as_text(), "hello world");
        assert!(v.as_json().is_none());
        assert_eq!(v.metadata.stderr.as_deref(), Some("warn"));
    }

    #[test]
    fn load_result_records_filename_and_file_taint() {
        let v = StructuredValue::load_result("# doc", "notes.md");
        assert_eq!(v.ctx().filename.as_deref(), Some("notes.md"));
        assert!(v.security.has_taint(&TaintSource::File));
    }

    #[test]
    fn items_array_concatenates_and_merges_security() {
        let a = StructuredValue::load_result("alpha", "a.md");
        let b = StructuredValue::load_result("beta", "b.md");
        let arr = StructuredValue::items(vec![a, b]);
        assert_eq!(arr.as_text(), "alphabeta");
        assert_eq!(arr.security.sources, vec!["file:a.md", "file:b.md"]);
    }

    #[test]
    fn pipeline_input_preserves_raw_text_and_parses_json() {
        let upstream = StructuredValue::text(r#"{"n": 1}"#);
        let input = StructuredValue::pipeline_input(&upstream, "json");
        assert_eq!(input.kind, ValueKind::PipelineInput);
        assert_eq!(input.metadata.format.as_deref(), Some("json"));
        assert_eq!(input.metadata.raw_text.as_deref(), Some(r#"{"n": 1}"#));
        assert_eq!(input.as_json(), Some(serde_json::json!({"n": 1})));
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(StructuredValue::text("abcd").token_estimate(), 1);
        assert_eq!(StructuredValue::text("abcde").token_estimate(), 2);
        assert_eq!(StructuredValue::text("").token_estimate(), 0);
    }
}
