// SPDX-License-Identifier: MIT OR Apache-2.0
//! The stage execution machine.
//!
//! State per logical stage: the current input, a 1-based attempt counter,
//! and the hint history. Retries re-run the same stage with the counter
//! incremented; the hint history grows by exactly one entry per retry, so
//! `hint_history.len() == try - 1` holds at the start of every attempt.

use async_trait::async_trait;
use mlld_core::ast::{ExecInvocation, Node};
use mlld_core::{MlldError, StructuredValue};
use mlld_env::{Effect, Environment};
use mlld_policy::guards::GuardContext;
use mlld_stream::{StreamBus, StreamEvent};
use serde::Serialize;
use tracing::debug;

use crate::format;
use crate::preprocess::{EffectStage, PreparedStage};

/// Default per-stage retry cap. Overridable via
/// [`PipelineOptions::max_retries`].
pub const DEFAULT_MAX_RETRIES: u32 = 5;

// ── MxContext ───────────────────────────────────────────────────────────

/// Operation summary exposed as `@mx.op`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MxOp {
    /// Operation type (`exec`, `cmd`, `code`, `effect`).
    #[serde(rename = "type")]
    pub op_type: String,
    /// Operation name.
    pub name: String,
    /// Labels on the target executable.
    pub labels: Vec<String>,
}

/// The ambient pipeline context exposed to user code as `@mx` (alias `@p`).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MxContext {
    /// Zero-based stage index.
    pub stage: usize,
    /// Total number of prepared stages.
    #[serde(rename = "totalStages")]
    pub total_stages: usize,
    /// 1-based attempt counter for the current stage.
    #[serde(rename = "try")]
    pub try_count: u32,
    /// Hints from prior retries of this stage, oldest first.
    #[serde(rename = "hintHistory")]
    pub hint_history: Vec<serde_json::Value>,
    /// Textual outputs of completed stages, oldest first.
    #[serde(rename = "previousOutputs")]
    pub previous_outputs: Vec<String>,
    /// Textual view of the current input.
    pub input: String,
    /// The most recent hint, when any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<serde_json::Value>,
    /// Guard retry state.
    pub guard: GuardContext,
    /// The operation about to run.
    pub op: MxOp,
    /// Taint spellings on the current input.
    pub taint: Vec<String>,
    /// Provenance of the current input.
    pub sources: Vec<String>,
    /// Label spellings on the current input.
    pub labels: Vec<String>,
    /// Errors collected from parallel iterations.
    pub errors: Vec<String>,
}

impl MxContext {
    /// Context for one attempt of one stage.
    #[must_use]
    pub fn for_stage(
        stage: usize,
        total_stages: usize,
        try_count: u32,
        hint_history: &[serde_json::Value],
        previous_outputs: &[String],
        input: &StructuredValue,
        op: MxOp,
    ) -> Self {
        Self {
            stage,
            total_stages,
            try_count,
            hint_history: hint_history.to_vec(),
            previous_outputs: previous_outputs.to_vec(),
            input: input.as_text(),
            hint: hint_history.last().cloned(),
            guard: GuardContext {
                try_count,
                hint_history: hint_history.to_vec(),
            },
            op,
            taint: input.security.taint.iter().map(ToString::to_string).collect(),
            sources: input.security.sources.clone(),
            labels: input
                .security
                .labels
                .iter()
                .map(|l| l.as_str().to_string())
                .collect(),
            errors: Vec::new(),
        }
    }

    /// The JSON shape bound as the `@mx` variable.
    #[must_use]
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

// ── StageExecutor ───────────────────────────────────────────────────────

/// What one real stage produced.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// A value to pass to the next stage.
    Value(StructuredValue),
    /// Re-run this stage with an incremented attempt counter.
    Retry {
        /// Hint for the next attempt, visible as `@mx.hint`.
        hint: Option<serde_json::Value>,
    },
}

/// The seam between the pipeline machine and the interpreter.
///
/// The machine owns ordering, retries, effects, and format propagation; the
/// executor owns name resolution, parameter binding, and actual invocation.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Invoke a real stage with the current pipeline input.
    async fn invoke(
        &self,
        call: &ExecInvocation,
        input: &StructuredValue,
        mx: &MxContext,
        env: &Environment,
    ) -> Result<StageOutcome, MlldError>;

    /// Render argument sequences to text (for effects and builtin
    /// transformer arguments).
    async fn render_args(
        &self,
        args: &[Vec<Node>],
        env: &Environment,
    ) -> Result<Vec<String>, MlldError>;
}

// ── PipelineOptions / PipelineMachine ───────────────────────────────────

/// Per-pipeline knobs.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Retry cap per stage (attempts, not re-runs).
    pub max_retries: u32,
    /// Whether a stream bus receives stage/retry/chunk events.
    pub streaming: bool,
    /// Cooperative cancellation; checked between attempts.
    pub cancel: Option<crate::cancel::CancellationToken>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            streaming: false,
            cancel: None,
        }
    }
}

/// Drives a prepared stage list over a seed value.
pub struct PipelineMachine<'a> {
    executor: &'a dyn StageExecutor,
    env: &'a Environment,
    bus: Option<&'a StreamBus>,
    options: PipelineOptions,
}

impl<'a> PipelineMachine<'a> {
    /// Machine over the given executor and environment.
    #[must_use]
    pub fn new(
        executor: &'a dyn StageExecutor,
        env: &'a Environment,
        options: PipelineOptions,
    ) -> Self {
        Self {
            executor,
            env,
            bus: None,
            options,
        }
    }

    /// Attach a stream bus (builder).
    #[must_use]
    pub fn with_bus(mut self, bus: &'a StreamBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Run the pipeline to completion.
    ///
    /// # Errors
    ///
    /// Propagates stage errors and raises
    /// [`MlldError::MaxRetriesExceeded`] when a stage exhausts its cap.
    pub async fn run(
        &self,
        seed: StructuredValue,
        stages: &[PreparedStage],
    ) -> Result<StructuredValue, MlldError> {
        let total = stages.len();
        let mut current = seed;
        let mut previous_outputs: Vec<String> = Vec::new();

        for (index, stage) in stages.iter().enumerate() {
            for effect in &stage.pre_effects {
                self.emit_effect(effect, &current).await?;
            }

            let mut try_count: u32 = 1;
            let mut hint_history: Vec<serde_json::Value> = Vec::new();

            let output = loop {
                if let Some(cancel) = &self.options.cancel {
                    if cancel.is_cancelled() {
                        return Err(MlldError::Cancelled);
                    }
                }
                self.publish(StreamEvent::Stage {
                    index,
                    name: stage.name().to_string(),
                    attempt: try_count,
                });
                // Expose the current input's security as the ambient
                // snapshot for anything the stage evaluates.
                self.env.set_security_snapshot(current.security.clone());

                let mx = MxContext::for_stage(
                    index,
                    total,
                    try_count,
                    &hint_history,
                    &previous_outputs,
                    &current,
                    MxOp {
                        op_type: "exec".to_string(),
                        name: stage.name().to_string(),
                        labels: Vec::new(),
                    },
                );

                let outcome = match &stage.call {
                    None => StageOutcome::Value(current.clone()),
                    Some(call) => self.run_call(call, &current, &mx).await?,
                };

                match outcome {
                    StageOutcome::Value(value) => {
                        // Derived values absorb the input's descriptor.
                        break value.with_security(&current.security);
                    }
                    StageOutcome::Retry { hint } => {
                        debug!(target: "mlld.pipeline", stage = index, attempt = try_count, "retry");
                        self.publish(StreamEvent::Retry {
                            stage: index,
                            attempt: try_count,
                            hint: hint.clone(),
                        });
                        hint_history.push(hint.unwrap_or(serde_json::Value::Null));
                        try_count += 1;
                        if try_count > self.options.max_retries {
                            return Err(MlldError::MaxRetriesExceeded {
                                stage: index,
                                tries: try_count - 1,
                            });
                        }
                    }
                }
            };

            for effect in &stage.post_effects {
                self.emit_effect(effect, &output).await?;
            }

            self.publish(StreamEvent::Chunk {
                content: output.as_text(),
                stage: Some(index),
            });
            previous_outputs.push(output.as_text());
            current = output;
        }

        Ok(current)
    }

    async fn run_call(
        &self,
        call: &ExecInvocation,
        input: &StructuredValue,
        mx: &MxContext,
    ) -> Result<StageOutcome, MlldError> {
        if format::RESERVED_TRANSFORMERS.contains(&call.name.as_str()) {
            let args = self.executor.render_args(&call.args, self.env).await?;
            if let Some(value) = format::apply(&call.name, input, &args)? {
                return Ok(StageOutcome::Value(value));
            }
        }
        self.executor.invoke(call, input, mx, self.env).await
    }

    async fn emit_effect(
        &self,
        effect: &EffectStage,
        value: &StructuredValue,
    ) -> Result<(), MlldError> {
        let args = self.executor.render_args(&effect.args, self.env).await?;
        let (kind, content) = match effect.name.as_str() {
            "log" => (
                "stderr",
                args.first().cloned().unwrap_or_else(|| value.as_text()),
            ),
            "output" => {
                let target = args.first().map(String::as_str).unwrap_or("stdout");
                let content = ensure_newline(value.as_text());
                match target {
                    "stdout" => ("stdout", content),
                    "stderr" => ("stderr", content),
                    path => {
                        self.env.emit_effect(
                            Effect::file(path, content.clone()).from_source("output"),
                        );
                        self.publish(StreamEvent::Effect {
                            kind: "file".to_string(),
                            content,
                        });
                        return Ok(());
                    }
                }
            }
            // "show" and anything future-proofed defaults to stdout.
            _ => (
                "stdout",
                args.first().cloned().unwrap_or_else(|| value.as_text()),
            ),
        };
        let content = ensure_newline(content);
        let env_effect = match kind {
            "stderr" => Effect::stderr(content.clone()),
            _ => Effect::stdout(content.clone()),
        };
        self.env.emit_effect(env_effect.from_source(effect.name.clone()));
        self.publish(StreamEvent::Effect {
            kind: kind.to_string(),
            content,
        });
        Ok(())
    }

    fn publish(&self, event: StreamEvent) {
        if let Some(bus) = self.bus {
            bus.publish(event);
        }
    }
}

/// Append a trailing newline unless one is already present.
#[must_use]
pub fn ensure_newline(mut s: String) -> String {
    if !s.ends_with('\n') {
        s.push('\n');
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::preprocess;
    use mlld_core::ast::NodeKind;
    use mlld_env::BufferedEffects;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Executor that scripts per-stage behavior for machine tests.
    struct ScriptedExecutor {
        attempts: AtomicU32,
        succeed_on: u32,
    }

    #[async_trait]
    impl StageExecutor for ScriptedExecutor {
        async fn invoke(
            &self,
            call: &ExecInvocation,
            input: &StructuredValue,
            mx: &MxContext,
            _env: &Environment,
        ) -> Result<StageOutcome, MlldError> {
            match call.name.as_str() {
                "upper" => Ok(StageOutcome::Value(StructuredValue::text(
                    input.as_text().to_uppercase(),
                ))),
                "flaky" => {
                    let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    // Invariant checked mid-flight: history trails the counter.
                    assert_eq!(mx.hint_history.len() as u32, mx.try_count - 1);
                    if n >= self.succeed_on {
                        Ok(StageOutcome::Value(StructuredValue::text("final")))
                    } else {
                        Ok(StageOutcome::Retry {
                            hint: Some(serde_json::json!({"code": 429})),
                        })
                    }
                }
                "always_retry" => Ok(StageOutcome::Retry { hint: None }),
                other => Err(MlldError::internal(format!("unknown stage {other}"))),
            }
        }

        async fn render_args(
            &self,
            args: &[Vec<Node>],
            _env: &Environment,
        ) -> Result<Vec<String>, MlldError> {
            Ok(args
                .iter()
                .map(|seq| {
                    seq.iter()
                        .map(|n| match &n.kind {
                            NodeKind::Text { content } => content.clone(),
                            NodeKind::Literal { value } => match value {
                                serde_json::Value::String(s) => s.clone(),
                                other => other.to_string(),
                            },
                            _ => String::new(),
                        })
                        .collect()
                })
                .collect())
        }
    }

    fn scripted(succeed_on: u32) -> ScriptedExecutor {
        ScriptedExecutor {
            attempts: AtomicU32::new(0),
            succeed_on,
        }
    }

    fn env_with_buffer() -> (Environment, Arc<BufferedEffects>) {
        let buffer = Arc::new(BufferedEffects::new());
        (Environment::root(buffer.clone()), buffer)
    }

    #[tokio::test]
    async fn stages_run_in_order_and_thread_values() {
        let (env, _) = env_with_buffer();
        let executor = scripted(1);
        let machine = PipelineMachine::new(&executor, &env, PipelineOptions::default());
        let stages = preprocess(&[ExecInvocation::new("upper")]);
        let out = machine
            .run(StructuredValue::text("hello"), &stages)
            .await
            .unwrap();
        assert_eq!(out.as_text(), "HELLO");
    }

    #[tokio::test]
    async fn retry_with_hint_reaches_success() {
        let (env, _) = env_with_buffer();
        let executor = scripted(3);
        let machine = PipelineMachine::new(&executor, &env, PipelineOptions::default());
        let stages = preprocess(&[ExecInvocation::new("flaky")]);
        let out = machine
            .run(StructuredValue::text("draft"), &stages)
            .await
            .unwrap();
        assert_eq!(out.as_text(), "final");
        assert_eq!(executor.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_cap_raises_max_retries_exceeded() {
        let (env, _) = env_with_buffer();
        let executor = scripted(u32::MAX);
        let machine = PipelineMachine::new(
            &executor,
            &env,
            PipelineOptions {
                max_retries: 3,
                ..PipelineOptions::default()
            },
        );
        let stages = preprocess(&[ExecInvocation::new("always_retry")]);
        let err = machine
            .run(StructuredValue::text("x"), &stages)
            .await
            .unwrap_err();
        assert!(
            matches!(err, MlldError::MaxRetriesExceeded { stage: 0, tries: 3 }),
            "{err}"
        );
    }

    #[tokio::test]
    async fn effects_flush_around_their_stage() {
        let (env, buffer) = env_with_buffer();
        let executor = scripted(1);
        let machine = PipelineMachine::new(&executor, &env, PipelineOptions::default());
        let stages = preprocess(&[
            ExecInvocation::new("log"),
            ExecInvocation::new("upper"),
            ExecInvocation::new("show"),
        ]);
        let out = machine
            .run(StructuredValue::text("hi"), &stages)
            .await
            .unwrap();
        assert_eq!(out.as_text(), "HI");
        // Pre-effect saw the input, post-effect saw the output.
        assert_eq!(buffer.stderr(), "hi\n");
        assert_eq!(buffer.stdout(), "HI\n");
    }

    #[tokio::test]
    async fn builtin_transformers_run_without_the_executor() {
        let (env, _) = env_with_buffer();
        let executor = scripted(1);
        let machine = PipelineMachine::new(&executor, &env, PipelineOptions::default());
        let stages = preprocess(&[
            ExecInvocation::new("lines"),
            ExecInvocation::new("first").arg(vec![Node::text("2")]),
        ]);
        let out = machine
            .run(StructuredValue::text("a\nb\nc"), &stages)
            .await
            .unwrap();
        assert_eq!(out.as_json(), Some(serde_json::json!(["a", "b"])));
    }

    #[tokio::test]
    async fn descriptor_merges_through_every_stage() {
        use mlld_core::security::{DataLabel, SecurityDescriptor};
        let (env, _) = env_with_buffer();
        let executor = scripted(1);
        let machine = PipelineMachine::new(&executor, &env, PipelineOptions::default());
        let seed = StructuredValue::text("hello")
            .with_security(&SecurityDescriptor::labeled(DataLabel::Pii));
        let stages = preprocess(&[ExecInvocation::new("upper")]);
        let out = machine.run(seed, &stages).await.unwrap();
        assert!(out.security.has_label(&DataLabel::Pii));
    }

    #[tokio::test]
    async fn bus_sees_stage_retry_and_chunk_events() {
        let (env, _) = env_with_buffer();
        let executor = scripted(2);
        let bus = StreamBus::new();
        let mut sub = bus.subscribe();
        let machine = PipelineMachine::new(&executor, &env, PipelineOptions::default())
            .with_bus(&bus);
        let stages = preprocess(&[ExecInvocation::new("flaky")]);
        machine
            .run(StructuredValue::text("draft"), &stages)
            .await
            .unwrap();

        let mut saw_retry = false;
        let mut saw_chunk = false;
        while let Ok(envelope) =
            tokio::time::timeout(std::time::Duration::from_millis(50), sub.recv()).await
        {
            match envelope {
                Some(e) => match e.event {
                    StreamEvent::Retry { .. } => saw_retry = true,
                    StreamEvent::Chunk { .. } => saw_chunk = true,
                    _ => {}
                },
                None => break,
            }
        }
        assert!(saw_retry);
        assert!(saw_chunk);
    }
}
