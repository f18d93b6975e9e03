// SPDX-License-Identifier: MIT OR Apache-2.0
//! Policy and guard end-to-end behavior: specificity resolution, the
//! src:mcp → destructive denial (scenario S3), and guard transforms.

use mlld_core::security::{DataLabel, SecurityDescriptor, TaintSource};
use mlld_core::StructuredValue;
use mlld_policy::guards::{GuardDecl, GuardKind, GuardRegistry, GuardVerdict};
use mlld_policy::rules::{OperationRef, PolicyRules, RulePattern};
use mlld_policy::{union, FlowContext, PolicyEnforcer, PolicyFragment, PolicySummary};
use std::sync::Arc;

fn enforcer_with(rules: PolicyRules) -> PolicyEnforcer {
    PolicyEnforcer::new(Arc::new(PolicySummary {
        rules,
        ..PolicySummary::default()
    }))
}

#[test]
fn most_specific_pattern_decides() {
    // Nested patterns with alternating outcomes: a specific allow inside a
    // broader deny, plus a bare-label deny below both.
    let enforcer = enforcer_with(PolicyRules::new().rule(
        "secret",
        [RulePattern::from("op:cmd:git:push")],
        [RulePattern::from("op:cmd:git"), RulePattern::from("destructive")],
    ));
    let secret = SecurityDescriptor::labeled(DataLabel::Secret);

    // op:cmd:git:push (the most specific pattern) allows.
    assert!(enforcer
        .check(&FlowContext::arg(
            secret.clone(),
            OperationRef::command("git push origin")
        ))
        .is_allow());

    // Sibling operations fall back to the broader deny.
    assert!(!enforcer
        .check(&FlowContext::arg(
            secret.clone(),
            OperationRef::command("git fetch")
        ))
        .is_allow());

    // Label-pattern deny is the least specific and never overrides the
    // op-pattern allow.
    let op = OperationRef::command("git push").with_labels([DataLabel::from("destructive")]);
    assert!(enforcer.check(&FlowContext::arg(secret, op)).is_allow());
}

#[test]
fn mcp_taint_into_destructive_exe_is_denied_with_details() {
    // S3: policy denies src:mcp flowing to destructive.
    let enforcer = enforcer_with(PolicyRules::new().rule(
        "src:mcp",
        [],
        [RulePattern::from("destructive")],
    ));
    let input = SecurityDescriptor::tainted(TaintSource::Mcp, "mcp:createIssue");
    let op = OperationRef::new("code", "deploy").with_labels([DataLabel::from("destructive")]);

    let err = enforcer
        .enforce(&FlowContext::arg(input, op))
        .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("src:mcp"), "{message}");
    assert!(message.contains("deploy"), "{message}");
    assert_eq!(err.exit_code(), 3);
}

#[test]
fn union_composition_keeps_both_fragments_rules() {
    let base = PolicyFragment {
        rules: PolicyRules::new().rule("secret", [], [RulePattern::from("op:cmd")]),
        ..PolicyFragment::default()
    };
    let escalation = PolicyFragment {
        rules: PolicyRules::new().rule(
            "secret",
            [RulePattern::from("op:cmd:echo")],
            [],
        ),
        labels: vec!["reviewed".into()],
        ..PolicyFragment::default()
    };
    let summary = union([base, escalation]);
    let enforcer = PolicyEnforcer::new(Arc::new(summary));
    let secret = SecurityDescriptor::labeled(DataLabel::Secret);

    assert!(enforcer
        .check(&FlowContext::arg(secret.clone(), OperationRef::command("echo hi")))
        .is_allow());
    assert!(!enforcer
        .check(&FlowContext::arg(secret, OperationRef::command("curl x")))
        .is_allow());
}

#[test]
fn guard_transform_replaces_value_and_keeps_descriptor() {
    let original = StructuredValue::text("raw pii")
        .with_security(&SecurityDescriptor::labeled(DataLabel::Pii).with_source("file:in"));
    let replacement = StructuredValue::text("[scrubbed]");

    let out = GuardVerdict::AllowTransformed(replacement)
        .resolve(original)
        .expect("transform resolves");
    assert_eq!(out.as_text(), "[scrubbed]");
    assert!(out.security.has_label(&DataLabel::Pii));
    assert_eq!(out.security.sources, vec!["file:in"]);
}

#[test]
fn guard_deny_carries_the_exact_reason() {
    let verdict = GuardVerdict::Deny {
        reason: "value contains credentials".into(),
    };
    match verdict {
        GuardVerdict::Deny { reason } => {
            assert_eq!(reason, "value contains credentials");
        }
        _ => unreachable!(),
    }
}

#[test]
fn for_label_guards_select_on_taint_spellings() {
    let mut registry = GuardRegistry::new();
    registry.register(GuardDecl {
        name: "quarantine".into(),
        kind: GuardKind::ForLabel {
            label: "src:network".into(),
        },
        body: vec![mlld_core::ast::Node::text("deny fetched content")],
    });

    let fetched = SecurityDescriptor::tainted(TaintSource::Network, "https://x");
    assert_eq!(registry.for_descriptor(&fetched).len(), 1);
    let local = SecurityDescriptor::labeled(DataLabel::Pii);
    assert!(registry.for_descriptor(&local).is_empty());
}

#[test]
fn unlabeled_input_uses_the_untrusted_default() {
    let enforcer = enforcer_with(PolicyRules::new().rule(
        "untrusted",
        [],
        [RulePattern::from("op:cmd:rm")],
    ));
    assert!(!enforcer
        .check(&FlowContext::arg(
            SecurityDescriptor::empty(),
            OperationRef::command("rm -rf tmp")
        ))
        .is_allow());
    // An explicitly labeled value is no longer "unlabeled".
    assert!(enforcer
        .check(&FlowContext::arg(
            SecurityDescriptor::labeled(DataLabel::from("reviewed")),
            OperationRef::command("rm -rf tmp")
        ))
        .is_allow());
}

#[test]
fn audit_trail_records_denials() {
    let enforcer = enforcer_with(PolicyRules::new().rule(
        "secret",
        [],
        [RulePattern::from("op:cmd:curl")],
    ));
    let secret = SecurityDescriptor::labeled(DataLabel::Secret);
    let _ = enforcer.check(&FlowContext::arg(
        secret.clone(),
        OperationRef::command("curl evil"),
    ));
    let _ = enforcer.check(&FlowContext::arg(secret, OperationRef::command("echo ok")));
    assert_eq!(enforcer.audit_entries().len(), 2);
    assert_eq!(enforcer.denied_count(), 1);
}
