// SPDX-License-Identifier: MIT OR Apache-2.0
//! Policy fragment union.
//!
//! The `policy` directive binds a configuration built as `union(a, b, …)` of
//! fragments. Union merges rule tables per label (allow and deny lists
//! concatenate with dedup), unions declared labels, and lets later fragments
//! override defaults and auth. The result is a frozen [`PolicySummary`].

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::rules::PolicyRules;
use crate::{PolicyDefaults, PolicySummary};

/// One composable piece of a policy configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PolicyFragment {
    /// Override of the policy defaults, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defaults: Option<PolicyDefaults>,
    /// Custom labels this fragment declares.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    /// Authentication material (opaque).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<serde_json::Value>,
    /// Per-label rules contributed by this fragment.
    #[serde(default)]
    pub rules: PolicyRules,
}

/// Merge fragments left to right into a frozen summary.
///
/// Rule lists concatenate in fragment order with duplicates dropped, so a
/// later fragment can add a more specific pattern but never erase an earlier
/// one. Defaults and auth take the last fragment that sets them.
#[must_use]
pub fn union(fragments: impl IntoIterator<Item = PolicyFragment>) -> PolicySummary {
    let mut summary = PolicySummary::default();
    for fragment in fragments {
        if let Some(defaults) = fragment.defaults {
            summary.defaults = defaults;
        }
        for label in fragment.labels {
            if !summary.labels.contains(&label) {
                summary.labels.push(label);
            }
        }
        if fragment.auth.is_some() {
            summary.auth = fragment.auth;
        }
        for (label, rule) in fragment.rules.0 {
            let entry = summary.rules.0.entry(label).or_default();
            for p in rule.allow {
                if !entry.allow.contains(&p) {
                    entry.allow.push(p);
                }
            }
            for p in rule.deny {
                if !entry.deny.contains(&p) {
                    entry.deny.push(p);
                }
            }
        }
    }
    summary
}
