// SPDX-License-Identifier: MIT OR Apache-2.0
//! Invocation of executables: parameter binding, policy and guard
//! enforcement, external execution, and result wrapping.
//!
//! Parameter binding precedence per formal slot, strongest first: bound
//! arguments from partial application, positional caller arguments, the
//! pipeline input into the first free slot, then the empty string.

use async_trait::async_trait;
use mlld_core::ast::{ExecInvocation, Node};
use mlld_core::{ErrorCode, MlldError, StructuredValue, Variable};
use mlld_env::Environment;
use mlld_exec::{ExecRequest, ExecutionContext, Language, Param, Runner};
use mlld_pipeline::{MxContext, StageExecutor, StageOutcome};
use mlld_policy::guards::{GuardDecl, GuardVerdict};
use mlld_policy::{FlowContext, OperationRef};
use tracing::debug;

use crate::exec_def::{ExecBody, ExecutableDef};
use crate::interpolate::InterpContext;
use crate::Interpreter;

impl Interpreter {
    /// Register an executable definition.
    ///
    /// # Errors
    ///
    /// Propagates validation failures (reserved name, `cmd` operators).
    pub fn register_exec(&self, def: ExecutableDef) -> Result<(), MlldError> {
        def.validate()?;
        if let ExecBody::Collection { functions } = &def.body {
            // Shadow environments: first declare, then use.
            if let Ok(mut shadows) = self.shadows.write() {
                for (lang, fns) in functions {
                    let entry = shadows.entry(lang.clone()).or_default();
                    for (name, body) in fns {
                        entry.insert(name.clone(), body.clone());
                    }
                }
            }
        }
        if let Ok(mut exes) = self.exes.write() {
            exes.insert(def.name.clone(), def);
        }
        Ok(())
    }

    /// Look up an executable definition.
    #[must_use]
    pub fn exec_def(&self, name: &str) -> Option<ExecutableDef> {
        self.exes.read().ok().and_then(|m| m.get(name).cloned())
    }

    /// Invoke outside a pipeline; a retry outcome is an error here.
    pub(crate) async fn invoke_as_value(
        &self,
        call: &ExecInvocation,
        env: &Environment,
    ) -> Result<StructuredValue, MlldError> {
        match self.invoke_call(call, None, None, env).await? {
            StageOutcome::Value(value) => Ok(value),
            StageOutcome::Retry { .. } => Err(MlldError::RetryOutsidePipeline),
        }
    }

    /// Invoke an executable with full policy and guard mediation.
    pub(crate) async fn invoke_call(
        &self,
        call: &ExecInvocation,
        pipeline_input: Option<&StructuredValue>,
        mx: Option<&MxContext>,
        env: &Environment,
    ) -> Result<StageOutcome, MlldError> {
        let def = self.exec_def(&call.name).ok_or_else(|| {
            MlldError::resolution(
                ErrorCode::UndefinedVariable,
                format!("undefined executable @{}", call.name),
            )
        })?;

        let op = OperationRef::new(def.op_type(), operation_name(&def))
            .with_labels(def.labels.iter().cloned())
            .with_labels(env.enclosing_exe_labels());

        let guards = env.guards();
        // After-guards cannot apply once output has streamed; fail before
        // doing any work.
        if self.options.streaming && guards.has_after_for(&op) {
            let guard = guards
                .after_for(&op)
                .first()
                .map(|g| g.name.clone())
                .unwrap_or_default();
            return Err(MlldError::StreamingAfterGuard { guard });
        }

        // Evaluate arguments and bind parameters.
        let mut bound = self
            .bind_parameters(&def, call, pipeline_input, env)
            .await?;

        // Argument flow: enforcer first, then for-label guards.
        let enforcer = self.enforcer();
        let mut flow_security = env.security_snapshot();
        for param in &mut bound {
            let ctx = FlowContext {
                input: param.value.security.clone(),
                op: op.clone(),
                exe_labels: env.enclosing_exe_labels(),
                channel: mlld_policy::FlowChannel::Arg,
            };
            enforcer.enforce(&ctx)?;
            for guard in guards.for_descriptor(&param.value.security) {
                match self.eval_guard(guard, &param.value, mx, env).await? {
                    GuardVerdict::Allow => {}
                    GuardVerdict::AllowTransformed(replacement) => {
                        param.value = replacement.with_security(&param.value.security);
                    }
                    GuardVerdict::Deny { reason } => {
                        return Err(mlld_policy::guard_denied(&guard.name, &reason));
                    }
                    GuardVerdict::Retry { hint } => {
                        return self.guard_retry(hint, mx);
                    }
                }
            }
            flow_security.absorb(&param.value.security);
        }

        // Operation channel.
        enforcer.enforce(&FlowContext {
            input: flow_security.clone(),
            op: op.clone(),
            exe_labels: env.enclosing_exe_labels(),
            channel: mlld_policy::FlowChannel::Op,
        })?;

        // Before-guards observe the merged input.
        let merged_input = StructuredValue::text("").with_security(&flow_security);
        for guard in guards.before_for(&op) {
            match self.eval_guard(guard, &merged_input, mx, env).await? {
                GuardVerdict::Allow | GuardVerdict::AllowTransformed(_) => {}
                GuardVerdict::Deny { reason } => {
                    return Err(mlld_policy::guard_denied(&guard.name, &reason));
                }
                GuardVerdict::Retry { hint } => return self.guard_retry(hint, mx),
            }
        }

        // Execute the body.
        let in_pipeline = mx.is_some();
        let mut result = self
            .execute_body(&def, &bound, pipeline_input, in_pipeline, env)
            .await?;
        result.security.absorb(&flow_security);

        // After-guards may replace or reject the result.
        for guard in guards.after_for(&op) {
            match self.eval_guard(guard, &result, mx, env).await? {
                GuardVerdict::Allow => {}
                GuardVerdict::AllowTransformed(replacement) => {
                    result = replacement.with_security(&result.security);
                }
                GuardVerdict::Deny { reason } => {
                    return Err(mlld_policy::guard_denied(&guard.name, &reason));
                }
                GuardVerdict::Retry { hint } => return self.guard_retry(hint, mx),
            }
        }

        // A textual `retry` verdict from the body is the stage retry signal.
        if let Some(outcome) = retry_outcome(&result) {
            if mx.is_none() {
                return Err(MlldError::RetryOutsidePipeline);
            }
            return Ok(outcome);
        }

        Ok(StageOutcome::Value(result))
    }

    fn guard_retry(
        &self,
        hint: Option<serde_json::Value>,
        mx: Option<&MxContext>,
    ) -> Result<StageOutcome, MlldError> {
        if mx.is_none() {
            return Err(MlldError::RetryOutsidePipeline);
        }
        Ok(StageOutcome::Retry { hint })
    }

    /// Bind formal parameters by the §4.5 precedence.
    async fn bind_parameters(
        &self,
        def: &ExecutableDef,
        call: &ExecInvocation,
        pipeline_input: Option<&StructuredValue>,
        env: &Environment,
    ) -> Result<Vec<BoundParam>, MlldError> {
        let mut positional = Vec::with_capacity(call.args.len());
        for arg in &call.args {
            positional.push(
                self.resolve_nodes(arg, env, InterpContext::PlainText)
                    .await?,
            );
        }
        let mut bound_named = std::collections::BTreeMap::new();
        for (name, nodes) in &call.bind {
            bound_named.insert(
                name.clone(),
                self.resolve_nodes(nodes, env, InterpContext::PlainText)
                    .await?,
            );
        }

        let mut out = Vec::with_capacity(def.params.len());
        let mut positional_iter = positional.into_iter();
        let mut pipeline_used = false;
        for (slot, name) in def.params.iter().enumerate() {
            let value = if let Some(v) = bound_named.remove(name) {
                v
            } else if let Some(v) = positional_iter.next() {
                v
            } else if slot == 0 && !pipeline_used && pipeline_input.is_some() {
                pipeline_used = true;
                let input = pipeline_input.expect("checked");
                if matches!(def.body, ExecBody::Code { .. }) {
                    let format = input
                        .metadata
                        .format
                        .clone()
                        .unwrap_or_else(|| default_format(input));
                    StructuredValue::pipeline_input(input, format)
                } else {
                    input.clone()
                }
            } else {
                StructuredValue::text("")
            };
            out.push(BoundParam {
                name: name.clone(),
                value,
            });
        }
        Ok(out)
    }

    /// Execute the executable's body with parameters already bound.
    async fn execute_body(
        &self,
        def: &ExecutableDef,
        bound: &[BoundParam],
        pipeline_input: Option<&StructuredValue>,
        in_pipeline: bool,
        env: &Environment,
    ) -> Result<StructuredValue, MlldError> {
        let child = env.create_exec_child(def.labels.iter().cloned());
        for param in bound {
            child.set_parameter(Variable::parameter(param.name.clone(), param.value.clone()));
        }
        if let Some(input) = pipeline_input {
            child.set_parameter(Variable::parameter("input", input.clone()));
        }

        debug!(target: "mlld.interp", exe = %def.name, kind = def.op_type(), "invoke");
        match &def.body {
            ExecBody::Template { nodes } => {
                self.resolve_nodes(nodes, &child, InterpContext::PlainText)
                    .await
            }
            ExecBody::Command { command } | ExecBody::Shell { script: command } => {
                let rendered = self.resolve_shell(command, &child).await?;
                let mut params: Vec<Param> = rendered.params;
                for param in bound {
                    params.push(Param::text(param.name.clone(), param.value.as_text()));
                }
                let request = ExecRequest {
                    code: rendered.command,
                    params,
                    stdin: None,
                    env: Default::default(),
                    ctx: exec_ctx(&def.name, self.options.timeout),
                };
                let outcome = self
                    .runners
                    .for_language(Language::Shell)
                    .execute(request)
                    .await?
                    .into_result(&def.name, self.options.timeout)?;
                self.wrap_outcome(outcome, def, in_pipeline)
            }
            ExecBody::Code { lang, body } => {
                let language = Language::from_tag(lang).ok_or_else(|| {
                    MlldError::resolution(
                        ErrorCode::RuntimeUnavailable,
                        format!("no runtime for language '{lang}'"),
                    )
                })?;
                let code = self.with_shadow_prelude(lang, body);
                let params = bound
                    .iter()
                    .map(|p| Param {
                        name: p.name.clone(),
                        value: p.value.as_text(),
                        json: p.value.as_json(),
                    })
                    .collect();
                let request = ExecRequest {
                    code,
                    params,
                    stdin: None,
                    env: Default::default(),
                    ctx: exec_ctx(&def.name, self.options.timeout),
                };
                let outcome = self
                    .runners
                    .for_language(language)
                    .execute(request)
                    .await?
                    .into_result(&def.name, self.options.timeout)?;
                self.wrap_outcome(outcome, def, in_pipeline)
            }
            ExecBody::Collection { .. } => Err(MlldError::validation(
                ErrorCode::MissingSlot,
                format!("'@{}' declares a shadow environment and cannot be invoked", def.name),
            )),
        }
    }

    /// Prepend the language's shadow-environment functions to a code body.
    fn with_shadow_prelude(&self, lang: &str, body: &str) -> String {
        let Some(shadows) = self.shadows.read().ok() else {
            return body.to_string();
        };
        let key = match lang {
            "node" | "javascript" => "js",
            "py" | "python3" => "python",
            other => other,
        };
        let Some(fns) = shadows.get(key).or_else(|| shadows.get(lang)) else {
            return body.to_string();
        };
        let mut out = String::new();
        for def in fns.values() {
            out.push_str(def);
            out.push('\n');
        }
        out.push_str(body);
        out
    }

    fn wrap_outcome(
        &self,
        outcome: mlld_exec::ExecOutcome,
        def: &ExecutableDef,
        in_pipeline: bool,
    ) -> Result<StructuredValue, MlldError> {
        if outcome.exit_code != 0 && !in_pipeline {
            let stderr = outcome.stderr.trim();
            return Err(MlldError::execution(
                format!(
                    "'@{}' exited with code {}{}",
                    def.name,
                    outcome.exit_code,
                    if stderr.is_empty() {
                        String::new()
                    } else {
                        format!(": {stderr}")
                    }
                ),
                Some(outcome.exit_code),
            ));
        }
        Ok(StructuredValue::exec_result(
            outcome.stdout,
            outcome.stderr,
            outcome.exit_code,
            &def.name,
        ))
    }

    /// Evaluate a guard body to a verdict.
    pub(crate) async fn eval_guard(
        &self,
        guard: &GuardDecl,
        input: &StructuredValue,
        mx: Option<&MxContext>,
        env: &Environment,
    ) -> Result<GuardVerdict, MlldError> {
        let child = env.create_child();
        child.set_parameter(Variable::parameter("input", input.clone()));
        if let Some(mx) = mx {
            let value = StructuredValue::from(mx.to_value());
            child.set_system(Variable::system("mx", value.clone()));
            child.set_system(Variable::system("p", value));
        }
        let result = self
            .resolve_nodes(&guard.body, &child, InterpContext::PlainText)
            .await?;
        Ok(parse_guard_verdict(&result))
    }
}

/// One bound formal parameter.
#[derive(Debug, Clone)]
struct BoundParam {
    name: String,
    value: StructuredValue,
}

fn exec_ctx(name: &str, timeout: Option<std::time::Duration>) -> ExecutionContext {
    let mut ctx = ExecutionContext::named(name);
    if let Some(t) = timeout {
        ctx = ctx.with_timeout(t);
    }
    ctx
}

fn operation_name(def: &ExecutableDef) -> String {
    match &def.body {
        ExecBody::Command { command } | ExecBody::Shell { script: command } => {
            use mlld_core::ast::NodeKind;
            let text: String = command
                .iter()
                .filter_map(|n| match &n.kind {
                    NodeKind::Text { content } => Some(content.as_str()),
                    _ => None,
                })
                .collect();
            let head: Vec<&str> = text
                .split_whitespace()
                .take_while(|t| !t.starts_with('-'))
                .take(2)
                .collect();
            if head.is_empty() {
                def.name.clone()
            } else {
                head.join(" ")
            }
        }
        _ => def.name.clone(),
    }
}

fn default_format(input: &StructuredValue) -> String {
    if input.as_json().is_some() {
        "json".to_string()
    } else {
        "text".to_string()
    }
}

/// Detect the textual retry signal.
fn retry_outcome(value: &StructuredValue) -> Option<StageOutcome> {
    let text = value.as_text();
    let trimmed = text.trim();
    if trimmed == "retry" {
        return Some(StageOutcome::Retry { hint: None });
    }
    if let Some(rest) = trimmed.strip_prefix("retry ") {
        let hint = serde_json::from_str(rest)
            .unwrap_or_else(|_| serde_json::Value::String(rest.to_string()));
        return Some(StageOutcome::Retry { hint: Some(hint) });
    }
    None
}

/// Parse a guard body's result into a verdict.
#[must_use]
pub fn parse_guard_verdict(value: &StructuredValue) -> GuardVerdict {
    let text = value.as_text();
    let trimmed = text.trim();
    if trimmed == "allow" {
        return GuardVerdict::Allow;
    }
    if let Some(rest) = trimmed.strip_prefix("allow ") {
        return GuardVerdict::AllowTransformed(StructuredValue::text(rest.to_string()));
    }
    if trimmed == "deny" {
        return GuardVerdict::Deny {
            reason: String::new(),
        };
    }
    if let Some(rest) = trimmed.strip_prefix("deny ") {
        return GuardVerdict::Deny {
            reason: rest.to_string(),
        };
    }
    if trimmed == "retry" {
        return GuardVerdict::Retry { hint: None };
    }
    if let Some(rest) = trimmed.strip_prefix("retry ") {
        let hint = serde_json::from_str(rest)
            .unwrap_or_else(|_| serde_json::Value::String(rest.to_string()));
        return GuardVerdict::Retry { hint: Some(hint) };
    }
    GuardVerdict::Allow
}

// ── StageExecutor ───────────────────────────────────────────────────────

#[async_trait]
impl StageExecutor for Interpreter {
    async fn invoke(
        &self,
        call: &ExecInvocation,
        input: &StructuredValue,
        mx: &MxContext,
        env: &Environment,
    ) -> Result<StageOutcome, MlldError> {
        let stage_env = env.create_child();
        let mx_value = StructuredValue::from(mx.to_value());
        stage_env.set_system(Variable::system("mx", mx_value.clone()));
        stage_env.set_system(Variable::system("p", mx_value));
        stage_env.set_system(Variable::system(
            "ctx",
            StructuredValue::from(serde_json::to_value(input.ctx())?),
        ));
        self.invoke_call(call, Some(input), Some(mx), &stage_env)
            .await
    }

    async fn render_args(
        &self,
        args: &[Vec<Node>],
        env: &Environment,
    ) -> Result<Vec<String>, MlldError> {
        self.render_args_plain(args, env).await
    }
}
