// SPDX-License-Identifier: MIT OR Apache-2.0
//! Guard declarations and the guard registry.
//!
//! Guards are user-declared rules that fire around operations
//! (`guard @name before|after op:<pattern>`) or whenever a labeled value
//! participates in an argument flow (`guard @name for <label>`). The guard
//! body is an ordinary executable body; evaluating it is the interpreter's
//! job, so this module only models declarations, selection, and verdicts.

use mlld_core::ast::Node;
use mlld_core::security::SecurityDescriptor;
use mlld_core::StructuredValue;
use serde::{Deserialize, Serialize};

use crate::rules::{OperationRef, RulePattern};

// ── GuardKind ───────────────────────────────────────────────────────────

/// When a guard fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GuardKind {
    /// Before every operation matching the pattern.
    Before {
        /// Operation pattern (`op:cmd:git:push`, `op:cmd:*`).
        op: RulePattern,
    },
    /// After every operation matching the pattern.
    After {
        /// Operation pattern.
        op: RulePattern,
    },
    /// Whenever a value carrying the label flows as an argument.
    ForLabel {
        /// Label spelling (or taint spelling such as `src:mcp`).
        label: String,
    },
}

// ── GuardDecl ───────────────────────────────────────────────────────────

/// A declared guard: a name, a firing condition, and an executable body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardDecl {
    /// Guard name, without the `@` sigil.
    pub name: String,
    /// Firing condition.
    pub kind: GuardKind,
    /// The guard body; evaluates to a verdict.
    pub body: Vec<Node>,
}

impl GuardDecl {
    /// Returns `true` if this guard fires before `op`.
    #[must_use]
    pub fn fires_before(&self, op: &OperationRef) -> bool {
        matches!(&self.kind, GuardKind::Before { op: pattern } if pattern.matches(op))
    }

    /// Returns `true` if this guard fires after `op`.
    #[must_use]
    pub fn fires_after(&self, op: &OperationRef) -> bool {
        matches!(&self.kind, GuardKind::After { op: pattern } if pattern.matches(op))
    }

    /// Returns `true` if this guard fires for a value with `descriptor`.
    #[must_use]
    pub fn fires_for(&self, descriptor: &SecurityDescriptor) -> bool {
        match &self.kind {
            GuardKind::ForLabel { label } => {
                descriptor.labels.iter().any(|l| l.as_str() == label)
                    || descriptor.taint.iter().any(|t| t.to_string() == *label)
            }
            _ => false,
        }
    }
}

// ── GuardVerdict ────────────────────────────────────────────────────────

/// What a guard body evaluated to.
///
/// `Retry` is an internal control signal: the pipeline machine consumes it
/// and re-runs the attempt; it never surfaces to the user as an error.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardVerdict {
    /// Let the original value through.
    Allow,
    /// Replace the value downstream. The transformed value's descriptor
    /// must still carry the original contribution.
    AllowTransformed(StructuredValue),
    /// Block the flow with a reason.
    Deny {
        /// The guard's reason string, surfaced verbatim.
        reason: String,
    },
    /// Re-run the attempt, optionally attaching a hint.
    Retry {
        /// Hint visible to the next attempt via `@mx.hint`.
        hint: Option<serde_json::Value>,
    },
}

impl GuardVerdict {
    /// Apply this verdict to `value`, producing the value that continues
    /// downstream for allow-like verdicts.
    ///
    /// Transformed values inherit the original descriptor merged with their
    /// own so the guard's contribution is never lost.
    #[must_use]
    pub fn resolve(self, value: StructuredValue) -> Option<StructuredValue> {
        match self {
            Self::Allow => Some(value),
            Self::AllowTransformed(replacement) => {
                let merged = replacement.with_security(&value.security);
                Some(merged)
            }
            Self::Deny { .. } | Self::Retry { .. } => None,
        }
    }
}

// ── GuardContext ────────────────────────────────────────────────────────

/// Per-guard retry state, exposed to guard bodies as `@mx.guard`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuardContext {
    /// 1-based attempt counter.
    #[serde(rename = "try")]
    pub try_count: u32,
    /// Hints from prior `retry <hint>` verdicts, oldest first.
    #[serde(rename = "hintHistory")]
    pub hint_history: Vec<serde_json::Value>,
}

// ── GuardRegistry ───────────────────────────────────────────────────────

/// Ordered collection of declared guards.
///
/// Guards fire in declaration order: first declared, first consulted.
#[derive(Debug, Clone, Default)]
pub struct GuardRegistry {
    guards: Vec<GuardDecl>,
}

impl GuardRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a guard. Re-declaring a name replaces the old guard.
    pub fn register(&mut self, guard: GuardDecl) {
        if let Some(existing) = self.guards.iter_mut().find(|g| g.name == guard.name) {
            *existing = guard;
        } else {
            self.guards.push(guard);
        }
    }

    /// Guards firing before `op`, in declaration order.
    #[must_use]
    pub fn before_for(&self, op: &OperationRef) -> Vec<&GuardDecl> {
        self.guards.iter().filter(|g| g.fires_before(op)).collect()
    }

    /// Guards firing after `op`, in declaration order.
    #[must_use]
    pub fn after_for(&self, op: &OperationRef) -> Vec<&GuardDecl> {
        self.guards.iter().filter(|g| g.fires_after(op)).collect()
    }

    /// Guards firing for a value with `descriptor`, in declaration order.
    #[must_use]
    pub fn for_descriptor(&self, descriptor: &SecurityDescriptor) -> Vec<&GuardDecl> {
        self.guards
            .iter()
            .filter(|g| g.fires_for(descriptor))
            .collect()
    }

    /// Returns `true` if any after-guard would apply to `op`; used to reject
    /// streaming execution up front.
    #[must_use]
    pub fn has_after_for(&self, op: &OperationRef) -> bool {
        self.guards.iter().any(|g| g.fires_after(op))
    }

    /// Number of registered guards.
    #[must_use]
    pub fn len(&self) -> usize {
        self.guards.len()
    }

    /// Returns `true` when no guards are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlld_core::security::{DataLabel, TaintSource};

    fn guard(name: &str, kind: GuardKind) -> GuardDecl {
        GuardDecl {
            name: name.into(),
            kind,
            body: vec![Node::text("allow")],
        }
    }

    #[test]
    fn before_guard_selects_by_operation_pattern() {
        let mut reg = GuardRegistry::new();
        reg.register(guard(
            "audit",
            GuardKind::Before {
                op: RulePattern::from("op:cmd:git"),
            },
        ));
        assert_eq!(reg.before_for(&OperationRef::command("git push")).len(), 1);
        assert!(reg.before_for(&OperationRef::command("ls")).is_empty());
        assert!(reg.after_for(&OperationRef::command("git push")).is_empty());
    }

    #[test]
    fn for_label_guard_matches_labels_and_taint() {
        let mut reg = GuardRegistry::new();
        reg.register(guard(
            "scrub",
            GuardKind::ForLabel {
                label: "pii".into(),
            },
        ));
        reg.register(guard(
            "quarantine",
            GuardKind::ForLabel {
                label: "src:mcp".into(),
            },
        ));

        let pii = SecurityDescriptor::labeled(DataLabel::Pii);
        assert_eq!(reg.for_descriptor(&pii).len(), 1);

        let mcp = SecurityDescriptor::tainted(TaintSource::Mcp, "mcp:x");
        let hits = reg.for_descriptor(&mcp);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "quarantine");
    }

    #[test]
    fn redeclaring_a_guard_replaces_it() {
        let mut reg = GuardRegistry::new();
        reg.register(guard(
            "g",
            GuardKind::ForLabel {
                label: "pii".into(),
            },
        ));
        reg.register(guard(
            "g",
            GuardKind::ForLabel {
                label: "secret".into(),
            },
        ));
        assert_eq!(reg.len(), 1);
        let secret = SecurityDescriptor::labeled(DataLabel::Secret);
        assert_eq!(reg.for_descriptor(&secret).len(), 1);
    }

    #[test]
    fn transformed_value_keeps_original_descriptor_contribution() {
        let original = StructuredValue::text("raw").with_security(
            &SecurityDescriptor::labeled(DataLabel::Pii).with_source("file:in.txt"),
        );
        let replacement = StructuredValue::text("[redacted]")
            .with_security(&SecurityDescriptor::labeled(DataLabel::from("scrubbed")));
        let out = GuardVerdict::AllowTransformed(replacement)
            .resolve(original)
            .unwrap();
        assert_eq!(out.as_text(), "[redacted]");
        assert!(out.security.has_label(&DataLabel::Pii));
        assert!(out.security.has_label(&DataLabel::from("scrubbed")));
        assert_eq!(out.security.sources, vec!["file:in.txt"]);
    }

    #[test]
    fn deny_and_retry_do_not_resolve() {
        let v = StructuredValue::text("x");
        assert!(GuardVerdict::Deny {
            reason: "no".into()
        }
        .resolve(v.clone())
        .is_none());
        assert!(GuardVerdict::Retry { hint: None }.resolve(v).is_none());
    }
}
