// SPDX-License-Identifier: MIT OR Apache-2.0
//! Variable bindings: a name, a structured value, and binding-time attributes.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::security::{DataLabel, SecurityDescriptor};
use crate::{StructuredValue, ValueCtx, ValueData};

// ── VariableKind ────────────────────────────────────────────────────────

/// What shape of binding a [`Variable`] holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum VariableKind {
    /// Plain text.
    Text,
    /// Typed JSON data.
    Data,
    /// A validated filesystem path.
    Path,
    /// An array.
    Array,
    /// An object.
    Object,
    /// A user-defined executable (`exe`).
    Executable,
    /// A bound command.
    Command,
    /// The injected first parameter of a pipeline stage.
    PipelineInput,
    /// A bare primitive (number, boolean, null).
    Primitive,
}

// ── VariableSource ──────────────────────────────────────────────────────

/// Origin descriptor recorded when a variable is declared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct VariableSource {
    /// Directive that created the binding (`var`, `let`, `exe`, …).
    pub directive: String,
    /// Surface syntax of the right-hand side (`quote`, `template`, `load`, …).
    pub syntax: String,
    /// Whether the right-hand side contained interpolation.
    pub has_interpolation: bool,
    /// Whether the right-hand side spanned multiple lines.
    pub is_multi_line: bool,
    /// File the declaration appeared in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

// ── Variable ────────────────────────────────────────────────────────────

/// A named binding in an environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Variable {
    /// Identifier, without the `@` sigil.
    pub name: String,
    /// The bound value.
    pub value: StructuredValue,
    /// Binding kind.
    pub kind: VariableKind,
    /// Origin of the declaration.
    pub source: VariableSource,
    /// Labels applied by the user at declaration time.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub labels: BTreeSet<DataLabel>,
    /// Whether the binding rejects re-assignment.
    #[serde(default)]
    pub is_readonly: bool,
    /// Whether the binding is a bound formal parameter.
    #[serde(default)]
    pub is_parameter: bool,
    /// Whether the binding is runtime-provided (`@mx`, `@ctx`, builtins).
    #[serde(default)]
    pub is_system: bool,
}

impl Variable {
    /// Create a plain binding with the given kind.
    #[must_use]
    pub fn new(name: impl Into<String>, value: StructuredValue, kind: VariableKind) -> Self {
        Self {
            name: name.into(),
            value,
            kind,
            source: VariableSource::default(),
            labels: BTreeSet::new(),
            is_readonly: false,
            is_parameter: false,
            is_system: false,
        }
    }

    /// Create a parameter binding, as produced by executable invocation.
    #[must_use]
    pub fn parameter(name: impl Into<String>, value: StructuredValue) -> Self {
        let mut v = Self::new(name, value, VariableKind::PipelineInput);
        v.is_parameter = true;
        v
    }

    /// Create a runtime-provided binding (`@mx`, builtins).
    #[must_use]
    pub fn system(name: impl Into<String>, value: StructuredValue) -> Self {
        let mut v = Self::new(name, value, VariableKind::Data);
        v.is_system = true;
        v.is_readonly = true;
        v
    }

    /// Apply declaration labels, folding them into the value's descriptor.
    #[must_use]
    pub fn with_labels(mut self, labels: impl IntoIterator<Item = DataLabel>) -> Self {
        for label in labels {
            self.labels.insert(label.clone());
            self.value.security.labels.insert(label);
        }
        self
    }

    /// The effective descriptor of the binding: declaration labels merged
    /// over the value's own descriptor.
    #[must_use]
    pub fn descriptor(&self) -> SecurityDescriptor {
        let mut d = self.value.security.clone();
        d.labels.extend(self.labels.iter().cloned());
        d
    }

    /// Sum of token estimates across elements, or the value's own estimate
    /// for non-array bindings.
    #[must_use]
    pub fn total_tokens(&self) -> u64 {
        match self.value.as_items() {
            Some(items) => items.iter().map(StructuredValue::token_estimate).sum(),
            None => self.value.token_estimate(),
        }
    }

    /// Largest per-element token estimate, or the value's own estimate for
    /// non-array bindings.
    #[must_use]
    pub fn max_tokens(&self) -> u64 {
        match self.value.as_items() {
            Some(items) => items
                .iter()
                .map(StructuredValue::token_estimate)
                .max()
                .unwrap_or(0),
            None => self.value.token_estimate(),
        }
    }

    /// Quantifier view over an array binding (`.any`, `.all`, `.none`).
    ///
    /// Returns `None` for non-array bindings. For arrays whose payload is
    /// plain JSON the element descriptors are all empty, so `any`/`all`
    /// reduce to the array's own descriptor.
    #[must_use]
    pub fn quantifier(&self, q: Quantifier) -> Option<ValueCtx> {
        let descriptors: Vec<SecurityDescriptor> = match &self.value.data {
            Some(ValueData::Items(items)) => {
                items.iter().map(|v| v.security.clone()).collect()
            }
            Some(ValueData::Json(serde_json::Value::Array(elems))) => {
                elems.iter().map(|_| SecurityDescriptor::default()).collect()
            }
            _ => return None,
        };
        Some(quantify(q, &descriptors))
    }
}

// ── Quantifier views ────────────────────────────────────────────────────

/// Set-operation selector for array quantifier views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Quantifier {
    /// Union across elements: a label is present if any element carries it.
    Any,
    /// Intersection across elements: present only if every element carries it.
    All,
    /// Complement: labels carried by no element (always empty label set,
    /// useful for asserting absence).
    None,
}

fn quantify(q: Quantifier, descriptors: &[SecurityDescriptor]) -> ValueCtx {
    let mut ctx = ValueCtx::default();
    match q {
        Quantifier::Any => {
            let merged = SecurityDescriptor::merge_all(descriptors.iter());
            ctx.labels = merged.labels.iter().map(|l| l.as_str().to_string()).collect();
            ctx.taint = merged.taint.iter().map(ToString::to_string).collect();
            ctx.sources = merged.sources;
        }
        Quantifier::All => {
            if let Some((first, rest)) = descriptors.split_first() {
                let mut labels = first.labels.clone();
                let mut taint = first.taint.clone();
                for d in rest {
                    labels.retain(|l| d.labels.contains(l));
                    taint.retain(|t| d.taint.contains(t));
                }
                ctx.labels = labels.iter().map(|l| l.as_str().to_string()).collect();
                ctx.taint = taint.iter().map(ToString::to_string).collect();
            }
        }
        Quantifier::None => {
            // Labels present on no element: the view exposes the empty set;
            // consumers test membership against it.
        }
    }
    ctx
}
