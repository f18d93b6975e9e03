// SPDX-License-Identifier: MIT OR Apache-2.0
//! Truthiness and loose equality over structured values.
//!
//! `when` branch matching and condition evaluation use these rules rather
//! than strict JSON equality: numeric strings compare numerically, boolean
//! spellings compare as booleans, and emptiness is falsy.

use crate::{StructuredValue, ValueData, ValueKind};

/// Returns `true` unless the value is one of the falsy forms.
///
/// Falsy: `false`, `"false"`, `0`, `"0"`, the empty string, `null`, and a
/// missing value. Everything else is truthy, including arrays and objects
/// (empty or not).
#[must_use]
pub fn is_truthy(value: &StructuredValue) -> bool {
    match &value.data {
        Some(ValueData::Json(json)) => json_truthy(json),
        Some(ValueData::Items(_)) => true,
        None => match value.kind {
            ValueKind::Null => false,
            _ => text_truthy(&value.as_text()),
        },
    }
}

fn json_truthy(json: &serde_json::Value) -> bool {
    match json {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        serde_json::Value::String(s) => text_truthy(s),
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => true,
    }
}

fn text_truthy(text: &str) -> bool {
    !(text.is_empty() || text == "false" || text == "0")
}

/// Loose equality between two values.
///
/// Primitive forms are normalized first: numbers and numeric strings with
/// equal numeric value are equal, and booleans equal their string spellings.
/// When both sides carry typed data of the same shape, comparison is deep
/// JSON equality; otherwise the textual views decide.
#[must_use]
pub fn loose_eq(a: &StructuredValue, b: &StructuredValue) -> bool {
    if let (Some(na), Some(nb)) = (as_number(a), as_number(b)) {
        return na == nb;
    }
    if let (Some(ba), Some(bb)) = (as_bool(a), as_bool(b)) {
        return ba == bb;
    }
    match (a.as_json(), b.as_json()) {
        (Some(ja), Some(jb)) if !ja.is_string() && !jb.is_string() => ja == jb,
        _ => a.as_text() == b.as_text(),
    }
}

fn as_number(value: &StructuredValue) -> Option<f64> {
    if let Some(serde_json::Value::Number(n)) = value.as_json() {
        return n.as_f64();
    }
    let text = value.as_text();
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok()
}

fn as_bool(value: &StructuredValue) -> Option<bool> {
    if let Some(serde_json::Value::Bool(b)) = value.as_json() {
        return Some(b);
    }
    match value.as_text().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StructuredValue;

    #[test]
    fn falsy_table() {
        for falsy in [
            StructuredValue::from(false),
            StructuredValue::text("false"),
            StructuredValue::from(0i64),
            StructuredValue::text("0"),
            StructuredValue::text(""),
            StructuredValue::null(),
        ] {
            assert!(!is_truthy(&falsy), "expected falsy: {falsy:?}");
        }
    }

    #[test]
    fn truthy_table() {
        for truthy in [
            StructuredValue::text("hello"),
            StructuredValue::from(1i64),
            StructuredValue::from(-0.5),
            StructuredValue::from(true),
            StructuredValue::from(serde_json::json!([1])),
            StructuredValue::from(serde_json::json!({"k": 0})),
            StructuredValue::from(serde_json::json!([])),
            StructuredValue::from(serde_json::json!({})),
        ] {
            assert!(is_truthy(&truthy), "expected truthy: {truthy:?}");
        }
    }

    #[test]
    fn numeric_string_equals_number() {
        assert!(loose_eq(
            &StructuredValue::from(1i64),
            &StructuredValue::text("1")
        ));
        assert!(loose_eq(
            &StructuredValue::text("2.50"),
            &StructuredValue::from(2.5)
        ));
        assert!(!loose_eq(
            &StructuredValue::from(1i64),
            &StructuredValue::text("2")
        ));
    }

    #[test]
    fn boolean_spellings_compare_as_booleans() {
        assert!(loose_eq(
            &StructuredValue::from(true),
            &StructuredValue::text("true")
        ));
        assert!(loose_eq(
            &StructuredValue::text("false"),
            &StructuredValue::from(false)
        ));
        assert!(!loose_eq(
            &StructuredValue::from(true),
            &StructuredValue::text("false")
        ));
    }

    #[test]
    fn typed_data_compares_deeply() {
        let a = StructuredValue::from(serde_json::json!({"a": [1, 2]}));
        let b = StructuredValue::from(serde_json::json!({"a": [1, 2]}));
        let c = StructuredValue::from(serde_json::json!({"a": [2, 1]}));
        assert!(loose_eq(&a, &b));
        assert!(!loose_eq(&a, &c));
    }

    #[test]
    fn text_fallback_compares_textual_views() {
        assert!(loose_eq(
            &StructuredValue::text("abc"),
            &StructuredValue::text("abc")
        ));
        assert!(!loose_eq(
            &StructuredValue::text("abc"),
            &StructuredValue::text("abd")
        ));
    }
}
