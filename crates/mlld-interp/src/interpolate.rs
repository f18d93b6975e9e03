// SPDX-License-Identifier: MIT OR Apache-2.0
//! Interpolation of node sequences.
//!
//! Four contexts with different escaping contracts:
//!
//! | context | behavior |
//! |---|---|
//! | `PlainText` | values render verbatim |
//! | `ShellCommand` | simple values inline; complex values become `"$MLLD_IN_x"` references with the value delivered out-of-band |
//! | `TripleBacktick` | `@var` interpolation only; `<…>` stays literal |
//! | `AngleBracket` | `<…>` loads files |
//!
//! A sequence that is a single value-producing node preserves structure;
//! anything else concatenates textual views. The security descriptors of
//! every referenced value merge into the result.

use futures::future::BoxFuture;
use mlld_core::ast::{ExecInvocation, FieldAccess, Node, NodeKind, VariableReference};
use mlld_core::security::SecurityDescriptor;
use mlld_core::variable::Quantifier;
use mlld_core::{ErrorCode, MlldError, StructuredValue, ValueData};
use mlld_env::Environment;
use mlld_exec::{Param, INLINE_LIMIT};

use crate::Interpreter;

/// Maximum length a value may have and still be inlined into command text.
const SHELL_INLINE_LIMIT: usize = 256;

/// Characters that disqualify a value from shell inlining.
const SHELL_SPECIALS: &[char] = &[
    '|', '&', ';', '<', '>', '(', ')', '$', '`', '\\', '"', '\'', '\n', '*', '?', '{', '}', '~',
    '#', '!', ' ',
];

/// Which interpolation contract applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpContext {
    /// `show`, variable templates.
    PlainText,
    /// Command lines handed to the shell.
    ShellCommand,
    /// Triple-backtick templates: no file loads.
    TripleBacktick,
    /// `<…>` loads files.
    AngleBracket,
}

/// A command line plus the out-of-band parameters it references.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShellRendered {
    /// The command text with complex values replaced by `"$MLLD_IN_x"`.
    pub command: String,
    /// Values delivered via the environment rather than the command text.
    pub params: Vec<Param>,
    /// Merged descriptor of everything referenced.
    pub security: SecurityDescriptor,
}

impl Interpreter {
    /// Resolve an interpolatable sequence to a structured value.
    ///
    /// # Errors
    ///
    /// Propagates resolution errors; in strict mode an undefined variable is
    /// fatal, otherwise it renders as empty text.
    pub fn resolve_nodes<'a>(
        &'a self,
        nodes: &'a [Node],
        env: &'a Environment,
        ctx: InterpContext,
    ) -> BoxFuture<'a, Result<StructuredValue, MlldError>> {
        Box::pin(async move {
            // Single value-producing node: preserve structure.
            let value_nodes: Vec<&Node> = nodes
                .iter()
                .filter(|n| !matches!(n.kind, NodeKind::Comment { .. }))
                .collect();
            if value_nodes.len() == 1 {
                return self.resolve_single(value_nodes[0], env, ctx).await;
            }

            let mut text = String::new();
            let mut security = SecurityDescriptor::default();
            for node in value_nodes {
                let value = self.resolve_single(node, env, ctx).await?;
                security.absorb(&value.security);
                text.push_str(&value.as_text());
            }
            Ok(StructuredValue::text(text).with_security(&security))
        })
    }

    fn resolve_single<'a>(
        &'a self,
        node: &'a Node,
        env: &'a Environment,
        ctx: InterpContext,
    ) -> BoxFuture<'a, Result<StructuredValue, MlldError>> {
        Box::pin(async move {
            match &node.kind {
                NodeKind::Text { content } => Ok(StructuredValue::text(content.clone())),
                NodeKind::Literal { value } => Ok(StructuredValue::from(value.clone())),
                NodeKind::Comment { .. } => Ok(StructuredValue::text("")),
                NodeKind::Code { body, .. } => Ok(StructuredValue::text(body.clone())),
                NodeKind::Error { message } => Err(MlldError::Syntax {
                    message: message.clone(),
                    location: node.location,
                }),
                NodeKind::VarRef(reference) => self.resolve_var_ref(reference, env).await,
                NodeKind::Exec(invocation) => {
                    let value = self.invoke_as_value(invocation, env).await?;
                    Ok(value)
                }
                NodeKind::Load { pattern, section } => match ctx {
                    InterpContext::TripleBacktick => {
                        Ok(StructuredValue::text(format!("<{pattern}>")))
                    }
                    _ => self.load_pattern(pattern, section.as_deref(), env).await,
                },
                NodeKind::Directive(directive) => {
                    let result = self.eval_directive(directive, env).await?;
                    Ok(result.unwrap_or_else(|| StructuredValue::text("")))
                }
                NodeKind::Branch { .. } => Err(MlldError::internal(
                    "branch node outside a when directive",
                )),
            }
        })
    }

    /// Resolve `@var` with field access and postfix pipes.
    pub(crate) async fn resolve_var_ref(
        &self,
        reference: &VariableReference,
        env: &Environment,
    ) -> Result<StructuredValue, MlldError> {
        let Some(variable) = env.get_variable(&reference.identifier) else {
            if self.options.strict {
                return Err(MlldError::resolution(
                    ErrorCode::UndefinedVariable,
                    format!("undefined variable @{}", reference.identifier),
                ));
            }
            return Ok(StructuredValue::text(""));
        };

        // Quantifier views short-circuit field access.
        if let Some(FieldAccess::Field { name }) = reference.fields.first() {
            let quantifier = match name.as_str() {
                "any" => Some(Quantifier::Any),
                "all" => Some(Quantifier::All),
                "none" => Some(Quantifier::None),
                _ => None,
            };
            if let Some(q) = quantifier {
                if let Some(view) = variable.quantifier(q) {
                    let json = serde_json::to_value(&view)?;
                    let rest = &reference.fields[1..];
                    let base = StructuredValue::from(json)
                        .with_security(&variable.descriptor());
                    return Ok(apply_fields(base, rest));
                }
            }
        }

        let mut value = variable.value.clone();
        value.security = variable.descriptor();
        let mut value = apply_fields(value, &reference.fields);

        if !reference.pipes.is_empty() {
            value = self
                .run_pipeline(value, &reference.pipes, None, None, env)
                .await?;
        }
        Ok(value)
    }

    /// Render a command line, splitting complex values out of the text.
    ///
    /// Undefined variables render as empty text here regardless of strict
    /// mode: shell interpolation classifies them as simple.
    ///
    /// # Errors
    ///
    /// Propagates evaluation errors from nested invocations.
    pub async fn resolve_shell(
        &self,
        nodes: &[Node],
        env: &Environment,
    ) -> Result<ShellRendered, MlldError> {
        let mut out = ShellRendered::default();
        for node in nodes {
            match &node.kind {
                NodeKind::Text { content } => out.command.push_str(content),
                NodeKind::Comment { .. } => {}
                NodeKind::VarRef(reference) => {
                    let value = if env.has_variable(&reference.identifier) {
                        self.resolve_var_ref(reference, env).await?
                    } else {
                        StructuredValue::text("")
                    };
                    out.security.absorb(&value.security);
                    let text = value.as_text();
                    if is_shell_simple(&text) {
                        out.command.push_str(&text);
                    } else {
                        let name = shell_param_name(reference);
                        out.command.push_str(&format!("\"$MLLD_IN_{name}\""));
                        out.params.push(Param::text(name, text));
                    }
                }
                _ => {
                    let value = self
                        .resolve_nodes(
                            std::slice::from_ref(node),
                            env,
                            InterpContext::ShellCommand,
                        )
                        .await?;
                    out.security.absorb(&value.security);
                    let text = value.as_text();
                    if is_shell_simple(&text) {
                        out.command.push_str(&text);
                    } else {
                        let name = format!("arg{}", out.params.len());
                        out.command.push_str(&format!("\"$MLLD_IN_{name}\""));
                        out.params.push(Param::text(name, text));
                    }
                }
            }
        }
        Ok(out)
    }

    /// Render argument sequences to plain text (effects, transformer args).
    pub(crate) async fn render_args_plain(
        &self,
        args: &[Vec<Node>],
        env: &Environment,
    ) -> Result<Vec<String>, MlldError> {
        let mut out = Vec::with_capacity(args.len());
        for seq in args {
            let value = self
                .resolve_nodes(seq, env, InterpContext::PlainText)
                .await?;
            out.push(value.as_text());
        }
        Ok(out)
    }

    /// Run the postfix/`with` pipeline over a seed value.
    pub(crate) fn run_pipeline<'a>(
        &'a self,
        seed: StructuredValue,
        stages: &'a [ExecInvocation],
        source: Option<&'a ExecInvocation>,
        max_retries: Option<u32>,
        env: &'a Environment,
    ) -> BoxFuture<'a, Result<StructuredValue, MlldError>> {
        use mlld_pipeline::{preprocess_with_source, PipelineMachine, PipelineOptions};
        Box::pin(async move {
            let retryable = seed
                .security
                .has_label(&mlld_core::DataLabel::Retryable);
            let prepared = preprocess_with_source(source, retryable, stages);
            let options = PipelineOptions {
                max_retries: max_retries.unwrap_or(self.options.max_retries),
                streaming: self.options.streaming,
                ..PipelineOptions::default()
            };
            let machine = PipelineMachine::new(self, env, options);
            let machine = match &self.bus {
                Some(bus) if self.options.streaming => machine.with_bus(bus),
                _ => machine,
            };
            machine.run(seed, &prepared).await
        })
    }
}

/// Apply a field path; every miss yields empty text.
#[must_use]
pub fn apply_fields(value: StructuredValue, fields: &[FieldAccess]) -> StructuredValue {
    let mut current = value;
    for field in fields {
        let security = current.security.clone();
        current = step_field(&current, field)
            .unwrap_or_else(|| StructuredValue::text(""))
            .with_security(&security);
    }
    current
}

fn step_field(value: &StructuredValue, field: &FieldAccess) -> Option<StructuredValue> {
    match field {
        FieldAccess::Field { name } => {
            if name == "ctx" {
                let ctx = serde_json::to_value(value.ctx()).ok()?;
                return Some(StructuredValue::from(ctx));
            }
            match &value.data {
                Some(ValueData::Json(serde_json::Value::Object(map))) => {
                    map.get(name).cloned().map(StructuredValue::from)
                }
                // Property access on a primitive or an array yields nothing.
                _ => None,
            }
        }
        FieldAccess::Index { index } => match &value.data {
            Some(ValueData::Items(items)) => {
                let idx = normalize_index(*index, items.len())?;
                items.get(idx).cloned()
            }
            Some(ValueData::Json(serde_json::Value::Array(items))) => {
                let idx = normalize_index(*index, items.len())?;
                items.get(idx).cloned().map(StructuredValue::from)
            }
            _ => None,
        },
        FieldAccess::Slice { start, end } => match &value.data {
            Some(ValueData::Items(items)) => {
                let (a, b) = slice_bounds(*start, *end, items.len());
                Some(StructuredValue::items(items[a..b].to_vec()))
            }
            Some(ValueData::Json(serde_json::Value::Array(items))) => {
                let (a, b) = slice_bounds(*start, *end, items.len());
                Some(StructuredValue::from(serde_json::Value::Array(
                    items[a..b].to_vec(),
                )))
            }
            _ => {
                let text = value.as_text();
                let chars: Vec<char> = text.chars().collect();
                let (a, b) = slice_bounds(*start, *end, chars.len());
                Some(StructuredValue::text(chars[a..b].iter().collect::<String>()))
            }
        },
    }
}

fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let idx = if index < 0 {
        len.checked_sub(index.unsigned_abs() as usize)?
    } else {
        index as usize
    };
    (idx < len).then_some(idx)
}

fn slice_bounds(start: Option<i64>, end: Option<i64>, len: usize) -> (usize, usize) {
    let clamp = |i: i64| -> usize {
        if i < 0 {
            len.saturating_sub(i.unsigned_abs() as usize)
        } else {
            (i as usize).min(len)
        }
    };
    let a = start.map_or(0, clamp);
    let b = end.map_or(len, clamp);
    (a, a.max(b))
}

/// A value is shell-simple when it is short and free of metacharacters.
#[must_use]
pub fn is_shell_simple(text: &str) -> bool {
    text.len() <= SHELL_INLINE_LIMIT.min(INLINE_LIMIT)
        && !text.contains(SHELL_SPECIALS)
}

fn shell_param_name(reference: &VariableReference) -> String {
    let mut name = reference.identifier.clone();
    for field in &reference.fields {
        match field {
            FieldAccess::Field { name: f } => {
                name.push('_');
                name.push_str(f);
            }
            FieldAccess::Index { index } => {
                name.push('_');
                name.push_str(&index.unsigned_abs().to_string());
            }
            FieldAccess::Slice { .. } => name.push_str("_slice"),
        }
    }
    name.replace(|c: char| !c.is_ascii_alphanumeric() && c != '_', "_")
}
