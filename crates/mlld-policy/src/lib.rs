// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! mlld-policy
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Audit trail for flow decisions.
pub mod audit;
/// Policy fragment union and summary construction.
pub mod compose;
/// Guard declarations, verdicts, and the guard registry.
pub mod guards;
/// Rule patterns and specificity resolution.
pub mod rules;

use mlld_core::security::{DataLabel, SecurityDescriptor};
use mlld_core::{ErrorCode, MlldError};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tracing::debug;

use audit::{AuditEntry, FlowRecord};
pub use compose::{union, PolicyFragment};
pub use guards::{GuardDecl, GuardKind, GuardRegistry, GuardVerdict};
pub use rules::{LabelResolution, LabelRule, OperationRef, PolicyRules, RulePattern};

// ── FlowChannel / FlowContext ───────────────────────────────────────────

/// Which interception point a check runs at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FlowChannel {
    /// Argument flow into an operation.
    Arg,
    /// The operation's own execution.
    Op,
}

impl FlowChannel {
    /// Wire spelling (`arg` / `op`).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Arg => "arg",
            Self::Op => "op",
        }
    }
}

/// Everything the enforcer needs to judge one flow.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FlowContext {
    /// Security state of the value flowing in.
    pub input: SecurityDescriptor,
    /// The operation being invoked.
    pub op: OperationRef,
    /// Labels of the enclosing executable, when the flow happens inside one.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub exe_labels: BTreeSet<DataLabel>,
    /// Interception point.
    pub channel: FlowChannel,
}

impl FlowContext {
    /// Context for an argument flow.
    #[must_use]
    pub fn arg(input: SecurityDescriptor, op: OperationRef) -> Self {
        Self {
            input,
            op,
            exe_labels: BTreeSet::new(),
            channel: FlowChannel::Arg,
        }
    }

    /// Context for an operation execution.
    #[must_use]
    pub fn op(input: SecurityDescriptor, op: OperationRef) -> Self {
        Self {
            input,
            op,
            exe_labels: BTreeSet::new(),
            channel: FlowChannel::Op,
        }
    }

    /// Rule keys contributed by the input: label spellings, taint spellings,
    /// and the `unlabeled` default when the input carries neither.
    #[must_use]
    pub fn input_keys(&self, defaults: &PolicyDefaults) -> Vec<String> {
        let mut keys: Vec<String> = self
            .input
            .labels
            .iter()
            .map(|l| l.as_str().to_string())
            .collect();
        keys.extend(self.input.taint.iter().map(ToString::to_string));
        if keys.is_empty() {
            keys.push(defaults.unlabeled.clone());
        }
        keys
    }

    /// The operation with executable labels folded in, so bare label
    /// patterns can match them.
    #[must_use]
    pub fn effective_op(&self) -> OperationRef {
        self.op.clone().with_labels(self.exe_labels.iter().cloned())
    }
}

// ── PolicyDefaults / PolicySummary ──────────────────────────────────────

/// Policy-wide defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PolicyDefaults {
    /// Label treated as present on unlabeled, untainted inputs.
    pub unlabeled: String,
}

impl Default for PolicyDefaults {
    fn default() -> Self {
        Self {
            unlabeled: "untrusted".to_string(),
        }
    }
}

/// Frozen snapshot of the active policy.
///
/// Immutable for the life of a module; a `policy` directive produces a new
/// summary rather than mutating the old one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PolicySummary {
    /// Policy-wide defaults.
    #[serde(default)]
    pub defaults: PolicyDefaults,
    /// Custom labels the policy declares.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    /// Authentication material passthrough (opaque to the enforcer).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<serde_json::Value>,
    /// The per-label rule table.
    #[serde(default)]
    pub rules: PolicyRules,
}

// ── FlowDecision ────────────────────────────────────────────────────────

/// Outcome of a flow check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowDecision {
    /// The flow may proceed.
    Allow,
    /// The flow is blocked.
    Deny {
        /// The input label whose rules decided.
        label: String,
        /// The winning rule pattern.
        rule: String,
    },
}

impl FlowDecision {
    /// Returns `true` for [`FlowDecision::Allow`].
    #[must_use]
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

// ── PolicyEnforcer ──────────────────────────────────────────────────────

/// Evaluates flow contexts against a frozen [`PolicySummary`] and records
/// every decision in an audit trail.
#[derive(Debug)]
pub struct PolicyEnforcer {
    summary: Arc<PolicySummary>,
    audit: Mutex<Vec<AuditEntry>>,
}

impl PolicyEnforcer {
    /// Enforcer over the given summary.
    #[must_use]
    pub fn new(summary: Arc<PolicySummary>) -> Self {
        Self {
            summary,
            audit: Mutex::new(Vec::new()),
        }
    }

    /// Enforcer over an empty (allow-everything) policy.
    #[must_use]
    pub fn permissive() -> Self {
        Self::new(Arc::new(PolicySummary::default()))
    }

    /// The active summary.
    #[must_use]
    pub fn summary(&self) -> &PolicySummary {
        &self.summary
    }

    /// Judge a flow. Per input label the most specific matching pattern
    /// decides; across labels any deny blocks.
    #[must_use]
    pub fn check(&self, ctx: &FlowContext) -> FlowDecision {
        let op = ctx.effective_op();
        let mut decision = FlowDecision::Allow;
        for key in ctx.input_keys(&self.summary.defaults) {
            let Some(rule) = self.summary.rules.for_label(&key) else {
                continue;
            };
            match rules::resolve_label(rule, &op) {
                LabelResolution::Denied(pattern) => {
                    decision = FlowDecision::Deny {
                        label: key,
                        rule: pattern.0,
                    };
                    break;
                }
                LabelResolution::Allowed(_) | LabelResolution::Abstained => {}
            }
        }
        debug!(
            target: "mlld.policy",
            channel = ctx.channel.as_str(),
            op = %op,
            allow = decision.is_allow(),
            "flow check"
        );
        self.record(ctx, &decision);
        decision
    }

    /// Judge a flow and convert a deny into a [`MlldError::Policy`].
    ///
    /// # Errors
    ///
    /// Returns the policy error carrying the offending label, the operation
    /// name, and the winning rule.
    pub fn enforce(&self, ctx: &FlowContext) -> Result<(), MlldError> {
        match self.check(ctx) {
            FlowDecision::Allow => Ok(()),
            FlowDecision::Deny { label, rule } => Err(MlldError::Policy {
                label,
                operation: ctx.op.name.clone(),
                rule,
                location: None,
            }),
        }
    }

    /// Snapshot of the audit trail, oldest first.
    #[must_use]
    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.audit.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Number of denied flows recorded so far.
    #[must_use]
    pub fn denied_count(&self) -> usize {
        self.audit_entries()
            .iter()
            .filter(|e| !e.decision.is_allow())
            .count()
    }

    fn record(&self, ctx: &FlowContext, decision: &FlowDecision) {
        if let Ok(mut log) = self.audit.lock() {
            log.push(AuditEntry::now(
                FlowRecord {
                    channel: ctx.channel,
                    operation: ctx.op.pattern_string(),
                    labels: ctx
                        .input
                        .labels
                        .iter()
                        .map(|l| l.as_str().to_string())
                        .chain(ctx.input.taint.iter().map(ToString::to_string))
                        .collect(),
                },
                decision.clone(),
            ));
        }
    }
}

/// Validation code used when a guard denies a flow.
#[must_use]
pub fn guard_denied(guard: &str, reason: &str) -> MlldError {
    MlldError::Resolution {
        code: ErrorCode::GuardDenied,
        message: format!("guard '{guard}' denied: {reason}"),
        location: None,
    }
}
