// SPDX-License-Identifier: MIT OR Apache-2.0
//! Algebraic properties of the value model: wrap idempotence, descriptor
//! merge laws, and the truthiness table.

use mlld_core::security::{DataLabel, SecurityDescriptor, TaintSource};
use mlld_core::{is_truthy, StructuredValue};
use proptest::prelude::*;

fn arb_label() -> impl Strategy<Value = DataLabel> {
    prop_oneof![
        Just(DataLabel::Secret),
        Just(DataLabel::Pii),
        Just(DataLabel::Untrusted),
        Just(DataLabel::Retryable),
        "[a-z]{1,8}".prop_map(DataLabel::Custom),
    ]
}

fn arb_taint() -> impl Strategy<Value = TaintSource> {
    prop_oneof![
        Just(TaintSource::Mcp),
        Just(TaintSource::Network),
        Just(TaintSource::Exec),
        Just(TaintSource::File),
        Just(TaintSource::User),
    ]
}

fn arb_descriptor() -> impl Strategy<Value = SecurityDescriptor> {
    (
        prop::collection::btree_set(arb_label(), 0..4),
        prop::collection::btree_set(arb_taint(), 0..4),
        prop::collection::vec("[a-z:/]{1,12}", 0..4),
    )
        .prop_map(|(labels, taint, sources)| {
            let mut d = SecurityDescriptor::default();
            d.labels = labels;
            d.taint = taint;
            for s in sources {
                if !d.sources.contains(&s) {
                    d.sources.push(s);
                }
            }
            d
        })
}

fn arb_json() -> impl Strategy<Value = serde_json::Value> {
    prop_oneof![
        Just(serde_json::Value::Null),
        any::<bool>().prop_map(serde_json::Value::from),
        any::<i64>().prop_map(serde_json::Value::from),
        "[ -~]{0,24}".prop_map(serde_json::Value::from),
        prop::collection::vec(any::<i64>(), 0..4)
            .prop_map(|v| serde_json::json!(v)),
    ]
}

proptest! {
    #[test]
    fn wrap_is_idempotent(json in arb_json()) {
        let once = StructuredValue::wrap(StructuredValue::from(json));
        let twice = StructuredValue::wrap(once.clone());
        prop_assert_eq!(&once, &twice);
        prop_assert_eq!(once.as_text(), twice.as_text());
    }

    #[test]
    fn merge_identity_is_the_empty_descriptor(d in arb_descriptor()) {
        prop_assert_eq!(d.merge(&SecurityDescriptor::empty()), d.clone());
        prop_assert_eq!(SecurityDescriptor::empty().merge(&d), d);
    }

    #[test]
    fn merge_labels_and_taint_are_set_union(a in arb_descriptor(), b in arb_descriptor()) {
        let merged = a.merge(&b);
        for label in a.labels.iter().chain(b.labels.iter()) {
            prop_assert!(merged.has_label(label));
        }
        for taint in a.taint.iter().chain(b.taint.iter()) {
            prop_assert!(merged.has_taint(taint));
        }
        prop_assert_eq!(
            merged.labels.len(),
            a.labels.union(&b.labels).count()
        );
    }

    #[test]
    fn merge_is_associative(
        a in arb_descriptor(),
        b in arb_descriptor(),
        c in arb_descriptor()
    ) {
        prop_assert_eq!(a.merge(&b).merge(&c), a.merge(&b.merge(&c)));
    }

    #[test]
    fn merge_is_commutative_on_label_and_taint_sets(
        a in arb_descriptor(),
        b in arb_descriptor()
    ) {
        let ab = a.merge(&b);
        let ba = b.merge(&a);
        prop_assert_eq!(ab.labels, ba.labels);
        prop_assert_eq!(ab.taint, ba.taint);
    }

    #[test]
    fn merge_sources_preserve_left_order(a in arb_descriptor(), b in arb_descriptor()) {
        let merged = a.merge(&b);
        // The left side's sources form a prefix-ordered subsequence.
        let mut last = 0usize;
        for src in &a.sources {
            let at = merged.sources[last..]
                .iter()
                .position(|s| s == src)
                .map(|p| p + last);
            prop_assert!(at.is_some());
            last = at.unwrap();
        }
        // No duplicates survive.
        let mut seen = std::collections::BTreeSet::new();
        for src in &merged.sources {
            prop_assert!(seen.insert(src.clone()));
        }
    }
}

#[test]
fn truthiness_table_matches_the_contract() {
    let falsy = [
        StructuredValue::from(false),
        StructuredValue::text("false"),
        StructuredValue::from(0i64),
        StructuredValue::text("0"),
        StructuredValue::text(""),
        StructuredValue::null(),
    ];
    for value in falsy {
        assert!(!is_truthy(&value), "expected falsy: {value:?}");
    }

    let truthy = [
        StructuredValue::text("hello"),
        StructuredValue::from(2i64),
        StructuredValue::from(-1i64),
        StructuredValue::from(true),
        StructuredValue::from(serde_json::json!([0])),
        StructuredValue::from(serde_json::json!({"a": false})),
        StructuredValue::from(serde_json::json!([])),
        StructuredValue::from(serde_json::json!({})),
    ];
    for value in truthy {
        assert!(is_truthy(&value), "expected truthy: {value:?}");
    }
}

#[test]
fn as_text_is_stable_across_double_wrap() {
    for raw in ["plain", r#"{"k": 1}"#, "", "multi\nline"] {
        let once = StructuredValue::wrap(raw);
        let twice = StructuredValue::wrap(once.clone());
        assert_eq!(once.as_text(), twice.as_text());
    }
}
