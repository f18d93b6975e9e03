// SPDX-License-Identifier: MIT OR Apache-2.0
//! Directive handlers.
//!
//! `eval_directive` is a closed dispatch table over [`DirectiveKind`]. Each
//! handler validates its slots, interpolates operands, and either mutates
//! the environment, emits effects, or returns a value for expression use.

use futures::future::BoxFuture;
use mlld_core::ast::{
    Directive, DirectiveKind, ExecInvocation, Node, NodeKind,
};
use mlld_core::{
    loose_eq, DataLabel, ErrorCode, MlldError, StructuredValue, ValueKind, Variable, VariableKind,
    VariableSource,
};
use mlld_env::{BindingKind, Effect, Environment};
use mlld_exec::{ExecRequest, Language, Runner};
use mlld_pipeline::{ensure_newline, parallel_map, ParallelOptions};
use mlld_policy::guards::{GuardDecl, GuardKind};
use mlld_policy::rules::RulePattern;
use mlld_policy::{union, PolicyEnforcer, PolicyFragment};
use mlld_stream::StreamEvent;
use std::sync::Arc;
use std::time::Duration;

use crate::interpolate::InterpContext;
use crate::Interpreter;

impl Interpreter {
    /// Evaluate one directive.
    ///
    /// Returns the directive's value when it has one (expression use);
    /// binding and effect directives return `None` or their bound value.
    ///
    /// # Errors
    ///
    /// Propagates validation, resolution, policy, and execution errors.
    pub fn eval_directive<'a>(
        &'a self,
        directive: &'a Directive,
        env: &'a Environment,
    ) -> BoxFuture<'a, Result<Option<StructuredValue>, MlldError>> {
        Box::pin(async move {
            match directive.kind {
                DirectiveKind::Var => self.eval_binding(directive, env, BindingKind::Var).await,
                DirectiveKind::Let => self.eval_binding(directive, env, BindingKind::Let).await,
                DirectiveKind::Path => self.eval_path(directive, env).await,
                DirectiveKind::Exe => self.eval_exe(directive, env).await,
                DirectiveKind::Show | DirectiveKind::Log => {
                    self.eval_show(directive, env).await
                }
                DirectiveKind::Run => self.eval_run(directive, env, false).await,
                DirectiveKind::Stream | DirectiveKind::StreamRun => {
                    self.eval_run(directive, env, true).await
                }
                DirectiveKind::Output => self.eval_output(directive, env, true).await,
                DirectiveKind::Append => self.eval_output(directive, env, false).await,
                DirectiveKind::For => self.eval_for(directive, env).await,
                DirectiveKind::When => self.eval_when(directive, env).await,
                DirectiveKind::Import => self.eval_import(directive, env).await,
                DirectiveKind::Export => self.eval_export(directive).await,
                DirectiveKind::Guard => self.eval_guard_decl(directive, env).await,
                DirectiveKind::Policy => self.eval_policy(directive, env).await,
                DirectiveKind::Embed | DirectiveKind::Add => {
                    self.eval_embed(directive, env).await
                }
            }
        })
    }

    // ── var / let ───────────────────────────────────────────────────────

    async fn eval_binding(
        &self,
        directive: &Directive,
        env: &Environment,
        binding: BindingKind,
    ) -> Result<Option<StructuredValue>, MlldError> {
        let name = text_slot(directive, "identifier")?;
        let value_nodes = require_slot(directive, "value")?;
        let mut value = self
            .resolve_nodes(value_nodes, env, InterpContext::AngleBracket)
            .await?;

        if let Some(stages) = pipeline_slot(directive) {
            let source = value_nodes.iter().find_map(|n| match &n.kind {
                NodeKind::Exec(call) => Some(call.clone()),
                _ => None,
            });
            value = self
                .run_pipeline(
                    value,
                    &stages,
                    source.as_ref(),
                    max_retries_meta(directive),
                    env,
                )
                .await?;
        }

        let labels = labels_from_meta(directive);
        let kind = kind_for_value(&value);
        let variable = Variable {
            name: name.clone(),
            value,
            kind,
            source: VariableSource {
                directive: directive.kind.as_str().to_string(),
                syntax: directive.subtype.clone().unwrap_or_default(),
                has_interpolation: value_nodes
                    .iter()
                    .any(|n| matches!(n.kind, NodeKind::VarRef(_) | NodeKind::Exec(_))),
                is_multi_line: false,
                file_path: env.current_file_path(),
            },
            labels: labels.iter().cloned().collect(),
            is_readonly: false,
            is_parameter: false,
            is_system: false,
        }
        .with_labels(labels);
        let bound = variable.value.clone();
        env.declare(binding, variable)?;
        Ok(Some(bound))
    }

    // ── path ────────────────────────────────────────────────────────────

    async fn eval_path(
        &self,
        directive: &Directive,
        env: &Environment,
    ) -> Result<Option<StructuredValue>, MlldError> {
        let name = text_slot(directive, "identifier")?;
        let raw = self
            .resolve_nodes(
                require_slot(directive, "value")?,
                env,
                InterpContext::PlainText,
            )
            .await?
            .as_text();

        let home = || std::env::var("HOME").unwrap_or_else(|_| "/".to_string());
        let resolved = if let Some(rest) = raw.strip_prefix("$.") {
            self.options.base_dir.join(rest.trim_start_matches('/'))
        } else if let Some(rest) = raw.strip_prefix("$PROJECTPATH") {
            self.options.base_dir.join(rest.trim_start_matches('/'))
        } else if let Some(rest) = raw.strip_prefix("$~") {
            std::path::PathBuf::from(home()).join(rest.trim_start_matches('/'))
        } else if let Some(rest) = raw.strip_prefix("$HOMEPATH") {
            std::path::PathBuf::from(home()).join(rest.trim_start_matches('/'))
        } else {
            let path = std::path::PathBuf::from(&raw);
            if path.is_absolute() && !self.options.allow_absolute_paths {
                return Err(MlldError::validation(
                    ErrorCode::MissingSlot,
                    format!("absolute path '{raw}' requires --allow-absolute-paths"),
                ));
            }
            path
        };

        let value = StructuredValue::text(resolved.display().to_string());
        env.declare(
            if env.scope() == mlld_env::ScopeKind::Module {
                BindingKind::Var
            } else {
                BindingKind::Let
            },
            Variable::new(name, value.clone(), VariableKind::Path),
        )?;
        Ok(Some(value))
    }

    // ── exe ─────────────────────────────────────────────────────────────

    async fn eval_exe(
        &self,
        directive: &Directive,
        env: &Environment,
    ) -> Result<Option<StructuredValue>, MlldError> {
        let def = crate::exec_def::ExecutableDef {
            name: text_slot(directive, "identifier")?,
            params: directive
                .slot("params")
                .map(|nodes| {
                    nodes
                        .iter()
                        .filter_map(|n| match &n.kind {
                            NodeKind::Text { content } => Some(content.clone()),
                            _ => None,
                        })
                        .collect()
                })
                .unwrap_or_default(),
            body: exe_body(directive)?,
            labels: labels_from_meta(directive).into_iter().collect(),
        };
        let name = def.name.clone();
        self.register_exec(def)?;
        env.declare(
            BindingKind::System,
            Variable::new(
                name.clone(),
                StructuredValue::text(format!("@{name}")),
                VariableKind::Executable,
            ),
        )?;
        Ok(None)
    }

    // ── show / log ──────────────────────────────────────────────────────

    async fn eval_show(
        &self,
        directive: &Directive,
        env: &Environment,
    ) -> Result<Option<StructuredValue>, MlldError> {
        let mut value = self
            .resolve_nodes(
                require_slot(directive, "value")?,
                env,
                InterpContext::AngleBracket,
            )
            .await?;
        if let Some(stages) = pipeline_slot(directive) {
            value = self
                .run_pipeline(value, &stages, None, max_retries_meta(directive), env)
                .await?;
        }
        let content = ensure_newline(value.as_text());
        env.emit_effect(Effect::stdout(content.clone()).from_source(directive.kind.as_str()));
        self.publish(StreamEvent::Effect {
            kind: "stdout".to_string(),
            content,
        });
        Ok(Some(value))
    }

    // ── run / stream ────────────────────────────────────────────────────

    async fn eval_run(
        &self,
        directive: &Directive,
        env: &Environment,
        stream: bool,
    ) -> Result<Option<StructuredValue>, MlldError> {
        let stream = stream
            && directive
                .meta_value("stream")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(true);

        let mut value = if let Some(command) = directive.slot("command") {
            let rendered = self.resolve_shell(command, env).await?;
            self.enforcer().enforce(&mlld_policy::FlowContext::op(
                rendered.security.clone(),
                mlld_policy::OperationRef::command(&rendered.command)
                    .with_labels(env.enclosing_exe_labels()),
            ))?;
            let request = ExecRequest {
                code: rendered.command.clone(),
                params: rendered.params,
                stdin: None,
                env: Default::default(),
                ctx: run_ctx(&rendered.command, self.options.timeout),
            };
            let outcome = self
                .runners
                .for_language(Language::Shell)
                .execute(request)
                .await?
                .into_result(&rendered.command, self.options.timeout)?;
            if outcome.exit_code != 0 {
                return Err(MlldError::execution(
                    format!(
                        "command exited with code {}: {}",
                        outcome.exit_code,
                        outcome.stderr.trim()
                    ),
                    Some(outcome.exit_code),
                ));
            }
            StructuredValue::exec_result(outcome.stdout, outcome.stderr, outcome.exit_code, {
                let mut words = rendered.command.split_whitespace();
                words.next().unwrap_or("run").to_string()
            })
            .with_security(&rendered.security)
        } else if let Some(code_nodes) = directive.slot("code") {
            let Some((lang, body)) = code_nodes.iter().find_map(|n| match &n.kind {
                NodeKind::Code { lang, body } => Some((lang.clone(), body.clone())),
                _ => None,
            }) else {
                return Err(missing_slot(directive, "code"));
            };
            let language = Language::from_tag(&lang).ok_or_else(|| {
                MlldError::resolution(
                    ErrorCode::RuntimeUnavailable,
                    format!("no runtime for language '{lang}'"),
                )
            })?;
            let request = ExecRequest {
                code: body,
                params: Vec::new(),
                stdin: None,
                env: Default::default(),
                ctx: run_ctx(&lang, self.options.timeout),
            };
            let outcome = self
                .runners
                .for_language(language)
                .execute(request)
                .await?
                .into_result(&lang, self.options.timeout)?;
            if outcome.exit_code != 0 {
                return Err(MlldError::execution(
                    format!(
                        "{lang} exited with code {}: {}",
                        outcome.exit_code,
                        outcome.stderr.trim()
                    ),
                    Some(outcome.exit_code),
                ));
            }
            StructuredValue::exec_result(outcome.stdout, outcome.stderr, outcome.exit_code, lang)
        } else if let Some(exec) = directive.slot("exec") {
            self.resolve_nodes(exec, env, InterpContext::PlainText).await?
        } else {
            return Err(missing_slot(directive, "command"));
        };

        if let Some(stages) = pipeline_slot(directive) {
            value = self
                .run_pipeline(value, &stages, None, max_retries_meta(directive), env)
                .await?;
        }

        let content = value.as_text();
        if !content.is_empty() {
            let content = ensure_newline(content);
            env.emit_effect(Effect::stdout(content.clone()).from_source("run"));
            if stream {
                self.publish(StreamEvent::Chunk {
                    content,
                    stage: None,
                });
            }
        }
        Ok(Some(value))
    }

    // ── output / append ─────────────────────────────────────────────────

    async fn eval_output(
        &self,
        directive: &Directive,
        env: &Environment,
        truncate: bool,
    ) -> Result<Option<StructuredValue>, MlldError> {
        let value = self
            .resolve_nodes(
                require_slot(directive, "value")?,
                env,
                InterpContext::AngleBracket,
            )
            .await?;
        let target = match directive.slot("target") {
            Some(nodes) => {
                self.resolve_nodes(nodes, env, InterpContext::PlainText)
                    .await?
                    .as_text()
            }
            None => "stdout".to_string(),
        };
        let content = ensure_newline(value.as_text());
        let effect = match target.as_str() {
            "stdout" => Effect::stdout(content),
            "stderr" => Effect::stderr(content),
            path => {
                let resolved = self.resolve_load_path(&self.options.base_dir, path)?;
                if truncate {
                    Effect::file_replace(resolved, content)
                } else {
                    Effect::file(resolved, content)
                }
            }
        };
        env.emit_effect(effect.from_source(directive.kind.as_str()));
        Ok(Some(value))
    }

    // ── for ─────────────────────────────────────────────────────────────

    async fn eval_for(
        &self,
        directive: &Directive,
        env: &Environment,
    ) -> Result<Option<StructuredValue>, MlldError> {
        let item_name = text_slot(directive, "item")?;
        let list = self
            .resolve_nodes(
                require_slot(directive, "list")?,
                env,
                InterpContext::PlainText,
            )
            .await?;
        let body = require_slot(directive, "body")?;

        let elements: Vec<StructuredValue> = match (&list.data, list.as_items()) {
            (_, Some(items)) => items.to_vec(),
            (Some(mlld_core::ValueData::Json(serde_json::Value::Array(items))), _) => {
                items.iter().cloned().map(StructuredValue::from).collect()
            }
            _ => {
                return Err(MlldError::validation(
                    ErrorCode::MissingSlot,
                    "for expects an array",
                ));
            }
        };

        if directive.subtype.as_deref() == Some("parallel") {
            return self
                .eval_for_parallel(directive, env, &item_name, elements, body)
                .await;
        }

        let mut results = Vec::with_capacity(elements.len());
        for element in elements {
            let child = env.create_child();
            child.set_parameter(Variable::parameter(item_name.clone(), element));
            results.push(self.eval_body_nodes(body, &child).await?);
        }
        Ok(Some(StructuredValue::items(results)))
    }

    async fn eval_for_parallel(
        &self,
        directive: &Directive,
        env: &Environment,
        item_name: &str,
        elements: Vec<StructuredValue>,
        body: &[Node],
    ) -> Result<Option<StructuredValue>, MlldError> {
        let cap = directive
            .meta_value("cap")
            .and_then(serde_json::Value::as_u64)
            .map(|c| c as usize)
            .unwrap_or(self.options.parallel.cap);
        let mut options = ParallelOptions::with_cap(cap);
        if let Some(ms) = directive
            .meta_value("pacing")
            .and_then(serde_json::Value::as_u64)
        {
            options = options.with_pacing(Duration::from_millis(ms));
        }

        let results = parallel_map(elements.len(), &options, |index| {
            let element = elements[index].clone();
            let child = env.create_parallel_child().create_child();
            child.set_parameter(Variable::parameter(item_name.to_string(), element));
            async move { self.eval_body_nodes(body, &child).await }
        })
        .await;

        let mut out = Vec::with_capacity(results.len());
        let mut errors = Vec::new();
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(value) => out.push(value),
                Err(err) => {
                    errors.push(format!("iteration {index}: {err}"));
                    out.push(StructuredValue::text(format!("<error: {err}>")));
                }
            }
        }
        if self.options.strict {
            if let Some(first) = errors.first() {
                return Err(MlldError::execution(first.clone(), None));
            }
        }
        // Surface accumulated errors as @mx.errors for the repair idiom.
        env.set_system(Variable::system(
            "mx",
            StructuredValue::from(serde_json::json!({ "errors": errors })),
        ));
        Ok(Some(StructuredValue::items(out)))
    }

    /// Evaluate a block body: directives run in order, the last value wins.
    pub(crate) async fn eval_body_nodes(
        &self,
        body: &[Node],
        env: &Environment,
    ) -> Result<StructuredValue, MlldError> {
        let mut last = StructuredValue::text("");
        for node in body {
            match &node.kind {
                NodeKind::Directive(directive) => {
                    if let Some(value) = self.eval_directive(directive, env).await? {
                        last = value;
                    }
                }
                NodeKind::Text { content } if content.trim().is_empty() => {}
                NodeKind::Text { .. } => {
                    return Err(MlldError::validation(
                        ErrorCode::BareTextInBlock,
                        "bare text is not allowed inside a block body",
                    ));
                }
                _ => {
                    last = self
                        .resolve_nodes(std::slice::from_ref(node), env, InterpContext::PlainText)
                        .await?;
                }
            }
        }
        Ok(last)
    }

    // ── when ────────────────────────────────────────────────────────────

    async fn eval_when(
        &self,
        directive: &Directive,
        env: &Environment,
    ) -> Result<Option<StructuredValue>, MlldError> {
        let branches = require_slot(directive, "branches")?;
        let parsed: Vec<(&Vec<Node>, &Vec<Node>)> = branches
            .iter()
            .filter_map(|n| match &n.kind {
                NodeKind::Branch { condition, body } => Some((condition, body)),
                _ => None,
            })
            .collect();

        // Switch form: compare the discriminant against branch keys.
        if let Some(expr) = directive.slot("expr") {
            let discriminant = self
                .resolve_nodes(expr, env, InterpContext::PlainText)
                .await?;
            let mut none_branch: Option<&[Node]> = None;
            for (condition, body) in &parsed {
                if condition.is_empty() {
                    none_branch = Some(body.as_slice());
                    continue;
                }
                if is_wildcard(condition) {
                    let child = env.create_child();
                    return Ok(Some(self.eval_body_nodes(body, &child).await?));
                }
                let key = self
                    .resolve_nodes(condition, env, InterpContext::PlainText)
                    .await?;
                if loose_eq(&discriminant, &key) {
                    let child = env.create_child();
                    return Ok(Some(self.eval_body_nodes(body, &child).await?));
                }
            }
            if let Some(body) = none_branch {
                let child = env.create_child();
                return Ok(Some(self.eval_body_nodes(body, &child).await?));
            }
            return Ok(None);
        }

        // Guarded form with a modifier.
        let modifier = directive
            .meta_value("modifier")
            .and_then(serde_json::Value::as_str)
            .or(directive.subtype.as_deref())
            .unwrap_or("first");
        if parsed.is_empty() && matches!(modifier, "any" | "all") {
            return Err(MlldError::validation(
                ErrorCode::EmptyWhenModifier,
                format!("when {modifier}: requires at least one condition"),
            ));
        }

        let mut truth = Vec::with_capacity(parsed.len());
        for (condition, _) in &parsed {
            let value = self
                .resolve_nodes(condition, env, InterpContext::PlainText)
                .await?;
            truth.push(value.is_truthy());
        }

        let mut last = None;
        match modifier {
            "any" => {
                for ((_, body), truthy) in parsed.iter().zip(&truth) {
                    if *truthy {
                        let child = env.create_child();
                        last = Some(self.eval_body_nodes(body, &child).await?);
                    }
                }
            }
            "all" => {
                if truth.iter().all(|t| *t) {
                    for (_, body) in &parsed {
                        let child = env.create_child();
                        last = Some(self.eval_body_nodes(body, &child).await?);
                    }
                }
            }
            "none" => {
                if truth.iter().all(|t| !*t) {
                    for (_, body) in &parsed {
                        let child = env.create_child();
                        last = Some(self.eval_body_nodes(body, &child).await?);
                    }
                }
            }
            _ => {
                for ((_, body), truthy) in parsed.iter().zip(&truth) {
                    if *truthy {
                        let child = env.create_child();
                        last = Some(self.eval_body_nodes(body, &child).await?);
                        break;
                    }
                }
            }
        }
        Ok(last)
    }

    // ── export ──────────────────────────────────────────────────────────

    async fn eval_export(
        &self,
        directive: &Directive,
    ) -> Result<Option<StructuredValue>, MlldError> {
        let names = require_slot(directive, "names")?;
        let mut exported = Vec::new();
        for node in names {
            if let NodeKind::Text { content } = &node.kind {
                let name = content.trim();
                if name == "*" {
                    return Err(MlldError::validation(
                        ErrorCode::WildcardExport,
                        "wildcard exports are not allowed; list each name",
                    ));
                }
                if !name.is_empty() {
                    exported.push(name.to_string());
                }
            }
        }
        if let Ok(mut exports) = self.exports.write() {
            exports.extend(exported);
        }
        Ok(None)
    }

    // ── guard ───────────────────────────────────────────────────────────

    async fn eval_guard_decl(
        &self,
        directive: &Directive,
        env: &Environment,
    ) -> Result<Option<StructuredValue>, MlldError> {
        let name = text_slot(directive, "name")?;
        let body = require_slot(directive, "body")?.to_vec();
        let form = directive
            .meta_value("form")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("before");
        let kind = match form {
            "for" => GuardKind::ForLabel {
                label: directive
                    .meta_value("label")
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| missing_slot(directive, "label"))?
                    .to_string(),
            },
            "after" => GuardKind::After {
                op: RulePattern::new(
                    directive
                        .meta_value("op")
                        .and_then(serde_json::Value::as_str)
                        .ok_or_else(|| missing_slot(directive, "op"))?,
                ),
            },
            _ => GuardKind::Before {
                op: RulePattern::new(
                    directive
                        .meta_value("op")
                        .and_then(serde_json::Value::as_str)
                        .ok_or_else(|| missing_slot(directive, "op"))?,
                ),
            },
        };
        env.register_guard(GuardDecl { name, kind, body });
        Ok(None)
    }

    // ── policy ──────────────────────────────────────────────────────────

    async fn eval_policy(
        &self,
        directive: &Directive,
        env: &Environment,
    ) -> Result<Option<StructuredValue>, MlldError> {
        let fragments: Vec<PolicyFragment> = match directive.meta_value("fragments") {
            Some(value) => serde_json::from_value(value.clone())?,
            None => {
                let value = self
                    .resolve_nodes(
                        require_slot(directive, "value")?,
                        env,
                        InterpContext::PlainText,
                    )
                    .await?;
                let json = value.as_json().ok_or_else(|| {
                    MlldError::validation(
                        ErrorCode::MissingSlot,
                        "policy expects fragment data",
                    )
                })?;
                match json {
                    serde_json::Value::Array(_) => serde_json::from_value(json)?,
                    other => vec![serde_json::from_value(other)?],
                }
            }
        };
        let summary = Arc::new(union(fragments));
        env.set_policy_summary(Arc::clone(&summary));
        if let Ok(mut enforcer) = self.enforcer.write() {
            *enforcer = Arc::new(PolicyEnforcer::new(summary));
        }
        Ok(None)
    }

    // ── embed / add ─────────────────────────────────────────────────────

    async fn eval_embed(
        &self,
        directive: &Directive,
        env: &Environment,
    ) -> Result<Option<StructuredValue>, MlldError> {
        let path = text_slot(directive, "path")?;
        let section = directive
            .meta_value("section")
            .and_then(serde_json::Value::as_str)
            .map(ToString::to_string);
        let value = self
            .load_pattern(&path, section.as_deref(), env)
            .await?;
        env.emit_effect(
            Effect::stdout(ensure_newline(value.as_text()))
                .from_source(directive.kind.as_str()),
        );
        Ok(Some(value))
    }
}

// ── Slot helpers ────────────────────────────────────────────────────────

fn require_slot<'a>(directive: &'a Directive, name: &str) -> Result<&'a [Node], MlldError> {
    directive
        .slot(name)
        .filter(|nodes| !nodes.is_empty())
        .ok_or_else(|| missing_slot(directive, name))
}

fn missing_slot(directive: &Directive, name: &str) -> MlldError {
    MlldError::validation(
        ErrorCode::MissingSlot,
        format!("{} requires a '{name}' slot", directive.kind),
    )
}

fn text_slot(directive: &Directive, name: &str) -> Result<String, MlldError> {
    let nodes = require_slot(directive, name)?;
    let text: String = nodes
        .iter()
        .filter_map(|n| match &n.kind {
            NodeKind::Text { content } => Some(content.as_str()),
            _ => None,
        })
        .collect();
    if text.is_empty() {
        return Err(missing_slot(directive, name));
    }
    Ok(text)
}

fn labels_from_meta(directive: &Directive) -> Vec<DataLabel> {
    directive
        .meta_value("labels")
        .and_then(serde_json::Value::as_array)
        .map(|labels| {
            labels
                .iter()
                .filter_map(serde_json::Value::as_str)
                .map(DataLabel::from)
                .collect()
        })
        .unwrap_or_default()
}

fn max_retries_meta(directive: &Directive) -> Option<u32> {
    directive
        .meta_value("maxRetries")
        .and_then(serde_json::Value::as_u64)
        .map(|n| n as u32)
}

/// The stage calls of a `with { pipeline: [...] }` or postfix chain.
fn pipeline_slot(directive: &Directive) -> Option<Vec<ExecInvocation>> {
    directive.slot("pipeline").map(|nodes| {
        nodes
            .iter()
            .filter_map(|n| match &n.kind {
                NodeKind::Exec(call) => Some(call.clone()),
                _ => None,
            })
            .collect()
    })
}

fn is_wildcard(condition: &[Node]) -> bool {
    matches!(
        condition,
        [Node {
            kind: NodeKind::Text { content },
            ..
        }] if content == "*"
    )
}

fn kind_for_value(value: &StructuredValue) -> VariableKind {
    match value.kind {
        ValueKind::Text | ValueKind::LoadResult | ValueKind::ExecResult => VariableKind::Text,
        ValueKind::Array => VariableKind::Array,
        ValueKind::Object => VariableKind::Object,
        ValueKind::Json | ValueKind::Number | ValueKind::Boolean | ValueKind::Null => {
            VariableKind::Primitive
        }
        ValueKind::PipelineInput => VariableKind::PipelineInput,
    }
}

fn exe_body(directive: &Directive) -> Result<crate::exec_def::ExecBody, MlldError> {
    use crate::exec_def::ExecBody;
    if let Some(template) = directive.slot("template") {
        return Ok(ExecBody::Template {
            nodes: template.to_vec(),
        });
    }
    if let Some(command) = directive.slot("command") {
        return Ok(ExecBody::Command {
            command: command.to_vec(),
        });
    }
    if let Some(code_nodes) = directive.slot("code") {
        if let Some((lang, body)) = code_nodes.iter().find_map(|n| match &n.kind {
            NodeKind::Code { lang, body } => Some((lang.clone(), body.clone())),
            _ => None,
        }) {
            if matches!(lang.as_str(), "sh" | "bash" | "shell") {
                return Ok(ExecBody::Shell {
                    script: vec![Node::text(body)],
                });
            }
            return Ok(ExecBody::Code { lang, body });
        }
    }
    if let Some(collection) = directive.meta_value("collection") {
        return Ok(ExecBody::Collection {
            functions: serde_json::from_value(collection.clone())?,
        });
    }
    Err(missing_slot(directive, "template|command|code"))
}

fn run_ctx(operation: &str, timeout: Option<Duration>) -> mlld_exec::ExecutionContext {
    let mut ctx = mlld_exec::ExecutionContext::named(operation);
    if let Some(t) = timeout {
        ctx = ctx.with_timeout(t);
    }
    ctx
}
