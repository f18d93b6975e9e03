// SPDX-License-Identifier: MIT OR Apache-2.0
//! Built-in format transformers and the format label.
//!
//! Transformers are reserved stage names (`@json`, `@lines`, …) handled by
//! the machine itself; user executables may not shadow them. Each sets the
//! format label of the value it produces, which downstream code stages use
//! to decide whether the pipeline input should be parsed before delivery.

use mlld_core::{MlldError, StructuredValue, ValueData};

/// Stage names reserved for built-in effects.
pub const RESERVED_EFFECTS: &[&str] = &["show", "log", "output"];

/// Stage names reserved for built-in transformers.
pub const RESERVED_TRANSFORMERS: &[&str] = &[
    "json", "lines", "first", "sortBy", "includes", "md", "xml", "csv", "trim",
];

/// Returns `true` if `name` may not be redefined by a user executable.
#[must_use]
pub fn is_reserved(name: &str) -> bool {
    RESERVED_EFFECTS.contains(&name) || RESERVED_TRANSFORMERS.contains(&name)
}

/// Apply a built-in transformer.
///
/// Returns `None` when `name` is not a transformer (the machine then
/// dispatches to the executor). `args` are the stage's literal arguments,
/// already rendered to text.
///
/// # Errors
///
/// Fails only on malformed transformer arguments (`@first("x")`).
pub fn apply(
    name: &str,
    input: &StructuredValue,
    args: &[String],
) -> Result<Option<StructuredValue>, MlldError> {
    let out = match name {
        "json" => Some(to_json(input)),
        "lines" => Some(to_lines(input)),
        "first" => Some(first(input, args)?),
        "sortBy" => Some(sort_by(input, args)),
        "includes" => Some(includes(input, args)),
        "md" => Some(input.clone().with_format("markdown")),
        "xml" => Some(to_xml(input)),
        "csv" => Some(to_csv(input)),
        "trim" => Some(StructuredValue::text(input.as_text().trim().to_string())
            .with_security(&input.security)
            .with_format("text")),
        _ => None,
    };
    Ok(out)
}

fn to_json(input: &StructuredValue) -> StructuredValue {
    let value = input
        .as_json()
        .or_else(|| serde_json::from_str(input.as_text().trim()).ok())
        .unwrap_or(serde_json::Value::Null);
    StructuredValue::from(value)
        .with_security(&input.security)
        .with_format("json")
}

fn to_lines(input: &StructuredValue) -> StructuredValue {
    let lines: Vec<serde_json::Value> = input
        .as_text()
        .lines()
        .map(|l| serde_json::Value::String(l.to_string()))
        .collect();
    StructuredValue::from(serde_json::Value::Array(lines))
        .with_security(&input.security)
        .with_format("lines")
}

fn first(input: &StructuredValue, args: &[String]) -> Result<StructuredValue, MlldError> {
    let n: usize = match args.first() {
        Some(raw) => raw.trim().parse().map_err(|_| {
            MlldError::validation(
                mlld_core::ErrorCode::MissingSlot,
                format!("@first expects a number, got '{raw}'"),
            )
        })?,
        None => 1,
    };
    let out = match elements(input) {
        Some(items) => serde_json::Value::Array(items.into_iter().take(n).collect()),
        None => serde_json::Value::Array(
            input
                .as_text()
                .lines()
                .take(n)
                .map(|l| serde_json::Value::String(l.to_string()))
                .collect(),
        ),
    };
    Ok(StructuredValue::from(out).with_security(&input.security))
}

fn sort_by(input: &StructuredValue, args: &[String]) -> StructuredValue {
    let key = args.first().map(String::as_str);
    let mut items = elements(input).unwrap_or_else(|| {
        input
            .as_text()
            .lines()
            .map(|l| serde_json::Value::String(l.to_string()))
            .collect()
    });
    items.sort_by(|a, b| {
        let ka = sort_key(a, key);
        let kb = sort_key(b, key);
        ka.cmp(&kb)
    });
    StructuredValue::from(serde_json::Value::Array(items)).with_security(&input.security)
}

fn sort_key(value: &serde_json::Value, key: Option<&str>) -> String {
    match (key, value) {
        (Some(k), serde_json::Value::Object(map)) => map
            .get(k)
            .map(render_scalar)
            .unwrap_or_default(),
        _ => render_scalar(value),
    }
}

fn includes(input: &StructuredValue, args: &[String]) -> StructuredValue {
    let needle = args.first().map(String::as_str).unwrap_or_default();
    match elements(input) {
        Some(items) => {
            let kept: Vec<_> = items
                .into_iter()
                .filter(|v| render_scalar(v).contains(needle))
                .collect();
            StructuredValue::from(serde_json::Value::Array(kept)).with_security(&input.security)
        }
        None => {
            let kept: Vec<serde_json::Value> = input
                .as_text()
                .lines()
                .filter(|l| l.contains(needle))
                .map(|l| serde_json::Value::String(l.to_string()))
                .collect();
            StructuredValue::from(serde_json::Value::Array(kept)).with_security(&input.security)
        }
    }
}

fn to_xml(input: &StructuredValue) -> StructuredValue {
    let body = match input.as_json() {
        Some(json) => xml_render("value", &json),
        None => format!("<value>{}</value>", xml_escape(&input.as_text())),
    };
    StructuredValue::text(body)
        .with_security(&input.security)
        .with_format("xml")
}

fn xml_render(tag: &str, value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Array(items) => {
            let inner: String = items.iter().map(|v| xml_render("item", v)).collect();
            format!("<{tag}>{inner}</{tag}>")
        }
        serde_json::Value::Object(map) => {
            let inner: String = map.iter().map(|(k, v)| xml_render(k, v)).collect();
            format!("<{tag}>{inner}</{tag}>")
        }
        other => format!("<{tag}>{}</{tag}>", xml_escape(&render_scalar(other))),
    }
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn to_csv(input: &StructuredValue) -> StructuredValue {
    let rows = elements(input).unwrap_or_default();
    let mut out = String::new();
    // Header: union of object keys in first-seen order.
    let mut headers: Vec<String> = Vec::new();
    for row in &rows {
        if let serde_json::Value::Object(map) = row {
            for key in map.keys() {
                if !headers.contains(key) {
                    headers.push(key.clone());
                }
            }
        }
    }
    if headers.is_empty() {
        for row in &rows {
            out.push_str(&csv_escape(&render_scalar(row)));
            out.push('\n');
        }
    } else {
        out.push_str(&headers.iter().map(|h| csv_escape(h)).collect::<Vec<_>>().join(","));
        out.push('\n');
        for row in &rows {
            let cells: Vec<String> = headers
                .iter()
                .map(|h| match row {
                    serde_json::Value::Object(map) => {
                        map.get(h).map(render_scalar).unwrap_or_default()
                    }
                    _ => String::new(),
                })
                .map(|c| csv_escape(&c))
                .collect();
            out.push_str(&cells.join(","));
            out.push('\n');
        }
    }
    StructuredValue::text(out)
        .with_security(&input.security)
        .with_format("csv")
}

fn csv_escape(cell: &str) -> String {
    if cell.contains(',') || cell.contains('"') || cell.contains('\n') {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}

fn render_scalar(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// The value's elements as plain JSON, when it is any array shape.
fn elements(input: &StructuredValue) -> Option<Vec<serde_json::Value>> {
    match &input.data {
        Some(ValueData::Json(serde_json::Value::Array(items))) => Some(items.clone()),
        Some(ValueData::Items(items)) => Some(
            items
                .iter()
                .map(|v| v.as_json().unwrap_or_else(|| serde_json::Value::String(v.as_text())))
                .collect(),
        ),
        _ => input.as_json().and_then(|j| match j {
            serde_json::Value::Array(items) => Some(items),
            _ => None,
        }),
    }
}
