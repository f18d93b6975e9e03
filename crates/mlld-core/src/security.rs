// SPDX-License-Identifier: MIT OR Apache-2.0
//! Data labels, taint sources, and the security descriptor attached to every
//! runtime value.
//!
//! A descriptor is the triple `(labels, taint, sources)` plus an optional
//! echo of the policy context it was evaluated under. Descriptors form a
//! commutative monoid under [`SecurityDescriptor::merge`]: labels and taint
//! union, sources concatenate order-preserving with dedup, and the empty
//! descriptor is the identity.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

// ── DataLabel ───────────────────────────────────────────────────────────

/// A classifier applied to a value, either by the user at declaration time
/// (`var @key = "..." with { labels: ["secret"] }`) or by a guard transform.
///
/// Explicit labels are authoritative: automatic taint never downgrades them.
/// Ordering is lexical over the spelling so label sets iterate
/// deterministically.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DataLabel {
    /// Credential or other value that must not flow to untrusted sinks.
    Secret,
    /// Personally identifying information.
    Pii,
    /// Value whose content is attacker-controllable.
    Untrusted,
    /// Value whose producer may be re-invoked on `retry`.
    Retryable,
    /// User-defined label.
    Custom(String),
}

impl DataLabel {
    /// The canonical string spelling of this label.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Secret => "secret",
            Self::Pii => "pii",
            Self::Untrusted => "untrusted",
            Self::Retryable => "retryable",
            Self::Custom(name) => name,
        }
    }
}

impl fmt::Display for DataLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Ord for DataLabel {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.as_str().cmp(other.as_str())
    }
}

impl PartialOrd for DataLabel {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for DataLabel {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "secret" => Self::Secret,
            "pii" => Self::Pii,
            "untrusted" => Self::Untrusted,
            "retryable" => Self::Retryable,
            other => Self::Custom(other.to_string()),
        })
    }
}

impl From<&str> for DataLabel {
    fn from(s: &str) -> Self {
        s.parse().unwrap_or(Self::Custom(s.to_string()))
    }
}

impl Serialize for DataLabel {
    fn serialize<S: serde::Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DataLabel {
    fn deserialize<D: serde::Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        let s = String::deserialize(de)?;
        Ok(Self::from(s.as_str()))
    }
}

impl JsonSchema for DataLabel {
    fn schema_name() -> std::borrow::Cow<'static, str> {
        "DataLabel".into()
    }

    fn json_schema(generator: &mut schemars::SchemaGenerator) -> schemars::Schema {
        String::json_schema(generator)
    }
}

// ── TaintSource ─────────────────────────────────────────────────────────

/// A source classifier applied automatically by the runtime.
///
/// Taint is always spelled `src:<origin>` on the wire; ordering is lexical
/// over the origin.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaintSource {
    /// Value produced by an MCP tool call.
    Mcp,
    /// Value fetched over the network.
    Network,
    /// Value produced by an external process (shell or language runtime).
    Exec,
    /// Value loaded from the filesystem.
    File,
    /// Value provided interactively by the user.
    User,
    /// Any other origin, spelled `src:<name>`.
    Other(String),
}

impl TaintSource {
    /// The origin name without the `src:` prefix.
    #[must_use]
    pub fn origin(&self) -> &str {
        match self {
            Self::Mcp => "mcp",
            Self::Network => "network",
            Self::Exec => "exec",
            Self::File => "file",
            Self::User => "user",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for TaintSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "src:{}", self.origin())
    }
}

impl Ord for TaintSource {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.origin().cmp(other.origin())
    }
}

impl PartialOrd for TaintSource {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for TaintSource {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let origin = s.strip_prefix("src:").unwrap_or(s);
        Ok(match origin {
            "mcp" => Self::Mcp,
            "network" => Self::Network,
            "exec" => Self::Exec,
            "file" => Self::File,
            "user" => Self::User,
            other => Self::Other(other.to_string()),
        })
    }
}

impl Serialize for TaintSource {
    fn serialize<S: serde::Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TaintSource {
    fn deserialize<D: serde::Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        let s = String::deserialize(de)?;
        Ok(s.parse().expect("infallible"))
    }
}

impl JsonSchema for TaintSource {
    fn schema_name() -> std::borrow::Cow<'static, str> {
        "TaintSource".into()
    }

    fn json_schema(generator: &mut schemars::SchemaGenerator) -> schemars::Schema {
        String::json_schema(generator)
    }
}

// ── SecurityDescriptor ──────────────────────────────────────────────────

/// The authoritative security state of a value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SecurityDescriptor {
    /// Labels applied to the value (explicit or inherited through merges).
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub labels: BTreeSet<DataLabel>,

    /// Taint sources accumulated as the value flowed through the runtime.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub taint: BTreeSet<TaintSource>,

    /// Ordered provenance trail, e.g. `["file:/tmp/x", "exec:echo"]`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,

    /// Echo of the policy context the value was evaluated under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_context: Option<serde_json::Value>,
}

impl SecurityDescriptor {
    /// The empty descriptor, the identity element for [`merge`](Self::merge).
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Descriptor with a single label.
    #[must_use]
    pub fn labeled(label: DataLabel) -> Self {
        let mut d = Self::default();
        d.labels.insert(label);
        d
    }

    /// Descriptor with a single taint source and a provenance entry.
    #[must_use]
    pub fn tainted(taint: TaintSource, source: impl Into<String>) -> Self {
        let mut d = Self::default();
        d.taint.insert(taint);
        d.sources.push(source.into());
        d
    }

    /// Returns `true` if the descriptor carries no labels, taint, or sources.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty() && self.taint.is_empty() && self.sources.is_empty()
    }

    /// Returns `true` if the descriptor carries the given label.
    #[must_use]
    pub fn has_label(&self, label: &DataLabel) -> bool {
        self.labels.contains(label)
    }

    /// Returns `true` if the descriptor carries the given taint source.
    #[must_use]
    pub fn has_taint(&self, taint: &TaintSource) -> bool {
        self.taint.contains(taint)
    }

    /// Merge `other` into `self` in place.
    ///
    /// Labels and taint are set-unioned. Sources are concatenated in order,
    /// dropping entries already present. The policy context of `self` wins
    /// when both sides carry one.
    pub fn absorb(&mut self, other: &SecurityDescriptor) {
        self.labels.extend(other.labels.iter().cloned());
        self.taint.extend(other.taint.iter().cloned());
        for src in &other.sources {
            if !self.sources.contains(src) {
                self.sources.push(src.clone());
            }
        }
        if self.policy_context.is_none() {
            self.policy_context = other.policy_context.clone();
        }
    }

    /// The merge operator `⊕`: returns a new descriptor combining both sides.
    #[must_use]
    pub fn merge(&self, other: &SecurityDescriptor) -> Self {
        let mut out = self.clone();
        out.absorb(other);
        out
    }

    /// Merge an arbitrary number of descriptors left to right.
    #[must_use]
    pub fn merge_all<'a>(descriptors: impl IntoIterator<Item = &'a SecurityDescriptor>) -> Self {
        let mut out = Self::default();
        for d in descriptors {
            out.absorb(d);
        }
        out
    }

    /// Add a label, returning `self` for chaining.
    #[must_use]
    pub fn with_label(mut self, label: DataLabel) -> Self {
        self.labels.insert(label);
        self
    }

    /// Add a taint source, returning `self` for chaining.
    #[must_use]
    pub fn with_taint(mut self, taint: TaintSource) -> Self {
        self.taint.insert(taint);
        self
    }

    /// Append a provenance entry if not already present, returning `self`.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        let source = source.into();
        if !self.sources.contains(&source) {
            self.sources.push(source);
        }
        self
    }
}
