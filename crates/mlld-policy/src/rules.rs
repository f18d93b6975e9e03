// SPDX-License-Identifier: MIT OR Apache-2.0
//! Rule patterns, per-label rule tables, and specificity resolution.
//!
//! A rule pattern is either an operation pattern (`op:cmd:git:push`,
//! `op:cmd:git:*`) or a bare label pattern (`destructive`) matched against
//! the labels of the target executable. Specificity is the number of
//! concrete segments; the most specific matching pattern decides, and on a
//! specificity tie deny wins.

use globset::{Glob, GlobMatcher};
use mlld_core::security::DataLabel;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

// ── OperationRef ────────────────────────────────────────────────────────

/// The operation side of a flow check: what is about to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct OperationRef {
    /// Operation type: `cmd`, `sh`, `code`, `template`, `effect`, `import`, `mcp`.
    pub op_type: String,
    /// Operation name (`git push`, `deploy`, a function name).
    pub name: String,
    /// Labels declared on the target executable.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub labels: BTreeSet<DataLabel>,
}

impl OperationRef {
    /// Operation with no labels.
    #[must_use]
    pub fn new(op_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            op_type: op_type.into(),
            name: name.into(),
            labels: BTreeSet::new(),
        }
    }

    /// Operation for a literal command line; the name keeps the leading
    /// tokens (`git push --force` → `git push`).
    #[must_use]
    pub fn command(command_line: &str) -> Self {
        let name = command_line
            .split_whitespace()
            .take_while(|t| !t.starts_with('-'))
            .collect::<Vec<_>>()
            .join(" ");
        Self::new("cmd", name)
    }

    /// Add executable labels (builder).
    #[must_use]
    pub fn with_labels(mut self, labels: impl IntoIterator<Item = DataLabel>) -> Self {
        self.labels.extend(labels);
        self
    }

    /// The colon-joined pattern string rules match against:
    /// `op:<type>:<name-segments>`.
    #[must_use]
    pub fn pattern_string(&self) -> String {
        let mut out = format!("op:{}", self.op_type);
        for token in self.name.split_whitespace() {
            out.push(':');
            out.push_str(token);
        }
        out
    }

    /// Returns `true` if the executable carries the given label.
    #[must_use]
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l.as_str() == label)
    }
}

impl fmt::Display for OperationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pattern_string())
    }
}

// ── RulePattern ─────────────────────────────────────────────────────────

/// One pattern inside an allow or deny list.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct RulePattern(pub String);

impl RulePattern {
    /// Wrap a pattern string.
    #[must_use]
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    /// Returns `true` for operation patterns (`op:` prefix).
    #[must_use]
    pub fn is_operation(&self) -> bool {
        self.0.starts_with("op:")
    }

    /// Specificity: the number of concrete (non-wildcard) segments.
    ///
    /// `op:cmd:git:push` → 4, `op:cmd:git` → 3, `op:cmd:git:*` → 3, a bare
    /// label → 1, `*` → 0. Operation patterns therefore always outrank bare
    /// label patterns.
    #[must_use]
    pub fn specificity(&self) -> usize {
        if self.0 == "*" {
            return 0;
        }
        self.0.split(':').filter(|seg| *seg != "*").count()
    }

    /// Returns `true` if this pattern applies to `op`.
    ///
    /// Operation patterns match by segment prefix or glob; label patterns
    /// match when the target executable carries the label.
    #[must_use]
    pub fn matches(&self, op: &OperationRef) -> bool {
        if self.0 == "*" {
            return true;
        }
        if self.is_operation() {
            let target = op.pattern_string();
            if segment_prefix_match(&self.0, &target) {
                return true;
            }
            return compile_glob(&self.0).is_some_and(|g| g.is_match(&target));
        }
        op.has_label(&self.0)
    }
}

impl fmt::Display for RulePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RulePattern {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

fn segment_prefix_match(pattern: &str, target: &str) -> bool {
    if pattern == target {
        return true;
    }
    target.starts_with(pattern) && target.as_bytes().get(pattern.len()) == Some(&b':')
}

fn compile_glob(pattern: &str) -> Option<GlobMatcher> {
    // Globs operate on the colon-joined string; treat ':' as a literal by
    // matching on the whole string rather than path components.
    Glob::new(pattern).ok().map(|g| g.compile_matcher())
}

// ── LabelRule / PolicyRules ─────────────────────────────────────────────

/// Allow and deny pattern lists for a single input label.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct LabelRule {
    /// Patterns that permit the flow.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow: Vec<RulePattern>,
    /// Patterns that block the flow.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deny: Vec<RulePattern>,
}

/// Per-label rule table: `{label → {allow, deny}}`.
///
/// Keys are label spellings or taint spellings (`secret`, `src:mcp`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct PolicyRules(pub BTreeMap<String, LabelRule>);

impl PolicyRules {
    /// Empty rule table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the rule entry for a label spelling.
    #[must_use]
    pub fn for_label(&self, label: &str) -> Option<&LabelRule> {
        self.0.get(label)
    }

    /// Insert or extend the entry for a label (builder).
    #[must_use]
    pub fn rule(
        mut self,
        label: impl Into<String>,
        allow: impl IntoIterator<Item = RulePattern>,
        deny: impl IntoIterator<Item = RulePattern>,
    ) -> Self {
        let entry = self.0.entry(label.into()).or_default();
        entry.allow.extend(allow);
        entry.deny.extend(deny);
        self
    }
}

// ── Resolution ──────────────────────────────────────────────────────────

/// Outcome of resolving one label against one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelResolution {
    /// A pattern permitted the flow; carries the winning pattern.
    Allowed(RulePattern),
    /// A pattern blocked the flow; carries the winning pattern.
    Denied(RulePattern),
    /// No pattern for this label matched the operation.
    Abstained,
}

/// Resolve the rules for a single label against `op`.
///
/// The most specific matching pattern wins; on a specificity tie, deny wins.
#[must_use]
pub fn resolve_label(rule: &LabelRule, op: &OperationRef) -> LabelResolution {
    let best_allow = best_match(&rule.allow, op);
    let best_deny = best_match(&rule.deny, op);
    match (best_allow, best_deny) {
        (None, None) => LabelResolution::Abstained,
        (Some((_, p)), None) => LabelResolution::Allowed(p),
        (None, Some((_, p))) => LabelResolution::Denied(p),
        (Some((sa, pa)), Some((sd, pd))) => {
            if sa > sd {
                LabelResolution::Allowed(pa)
            } else {
                LabelResolution::Denied(pd)
            }
        }
    }
}

fn best_match(patterns: &[RulePattern], op: &OperationRef) -> Option<(usize, RulePattern)> {
    patterns
        .iter()
        .filter(|p| p.matches(op))
        .map(|p| (p.specificity(), p.clone()))
        .max_by_key(|(s, _)| *s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op_git_push() -> OperationRef {
        OperationRef::command("git push --force")
    }

    #[test]
    fn command_name_drops_flags() {
        let op = op_git_push();
        assert_eq!(op.name, "git push");
        assert_eq!(op.pattern_string(), "op:cmd:git:push");
    }

    #[test]
    fn segment_prefix_matches_but_string_prefix_does_not() {
        let op = OperationRef::command("git push");
        assert!(RulePattern::from("op:cmd:git").matches(&op));
        assert!(RulePattern::from("op:cmd:git:push").matches(&op));
        // "op:cmd:gi" is a string prefix but not a segment prefix.
        assert!(!RulePattern::from("op:cmd:gi").matches(&op));
    }

    #[test]
    fn glob_patterns_match_whole_operation_string() {
        let op = OperationRef::command("git push");
        assert!(RulePattern::from("op:cmd:git:*").matches(&op));
        assert!(!RulePattern::from("op:cmd:svn:*").matches(&op));
    }

    #[test]
    fn label_patterns_match_executable_labels() {
        let op = OperationRef::new("code", "deploy")
            .with_labels([DataLabel::from("destructive")]);
        assert!(RulePattern::from("destructive").matches(&op));
        assert!(!RulePattern::from("readonly").matches(&op));
    }

    #[test]
    fn specificity_ordering() {
        assert!(
            RulePattern::from("op:cmd:git:push").specificity()
                > RulePattern::from("op:cmd:git").specificity()
        );
        assert!(
            RulePattern::from("op:cmd:git").specificity()
                > RulePattern::from("destructive").specificity()
        );
        assert_eq!(RulePattern::from("*").specificity(), 0);
        // A trailing wildcard does not add specificity.
        assert_eq!(
            RulePattern::from("op:cmd:git:*").specificity(),
            RulePattern::from("op:cmd:git").specificity()
        );
    }

    #[test]
    fn specific_allow_overrides_broader_deny() {
        let rule = LabelRule {
            allow: vec!["op:cmd:git:push".into()],
            deny: vec!["op:cmd:git".into()],
        };
        match resolve_label(&rule, &OperationRef::command("git push")) {
            LabelResolution::Allowed(p) => assert_eq!(p.0, "op:cmd:git:push"),
            other => panic!("expected allow, got {other:?}"),
        }
        // The broader deny still applies to siblings.
        match resolve_label(&rule, &OperationRef::command("git fetch")) {
            LabelResolution::Denied(p) => assert_eq!(p.0, "op:cmd:git"),
            other => panic!("expected deny, got {other:?}"),
        }
    }

    #[test]
    fn tie_goes_to_deny() {
        let rule = LabelRule {
            allow: vec!["op:cmd:rm".into()],
            deny: vec!["op:cmd:rm".into()],
        };
        assert!(matches!(
            resolve_label(&rule, &OperationRef::command("rm")),
            LabelResolution::Denied(_)
        ));
    }

    #[test]
    fn no_match_abstains() {
        let rule = LabelRule {
            allow: vec![],
            deny: vec!["op:cmd:curl".into()],
        };
        assert_eq!(
            resolve_label(&rule, &OperationRef::command("echo hi")),
            LabelResolution::Abstained
        );
    }
}
