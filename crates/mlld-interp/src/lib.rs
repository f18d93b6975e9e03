// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! mlld-interp
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Directive handlers.
pub mod eval;
/// Executable definitions.
pub mod exec_def;
/// Invocation, parameter binding, guards, and result wrapping.
pub mod executor;
/// Interpolation of node sequences.
pub mod interpolate;
/// File loads (`<path>`, globs) and section extraction.
pub mod load;
/// Program loading, module cache, and import resolution.
pub mod loader;

use mlld_core::ast::Program;
use mlld_core::{MlldError, StructuredValue};
use mlld_env::{Effect, EffectHandler, Environment};
use mlld_exec::RunnerSet;
use mlld_pipeline::{ensure_newline, ParallelOptions, DEFAULT_MAX_RETRIES};
use mlld_policy::PolicyEnforcer;
use mlld_stream::{StreamBus, StreamEvent};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::info;
use uuid::Uuid;

pub use exec_def::{ExecBody, ExecutableDef};
pub use loader::{JsonAstLoader, ModuleCache, ProgramLoader};

// ── RunOptions ──────────────────────────────────────────────────────────

/// Knobs for one interpreter instance.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Strict mode: undefined variables are fatal instead of empty.
    pub strict: bool,
    /// Per-stage retry cap for pipelines.
    pub max_retries: u32,
    /// Deadline applied to each external execution.
    pub timeout: Option<Duration>,
    /// Parallel iteration defaults.
    pub parallel: ParallelOptions,
    /// Whether stage/chunk events stream to the bus.
    pub streaming: bool,
    /// Base directory for relative paths and imports.
    pub base_dir: PathBuf,
    /// Permit absolute paths in `path` bindings and loads.
    pub allow_absolute_paths: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            strict: false,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout: None,
            parallel: ParallelOptions::from_env(),
            streaming: false,
            base_dir: PathBuf::from("."),
            allow_absolute_paths: false,
        }
    }
}

// ── Interpreter ─────────────────────────────────────────────────────────

/// The evaluator over a parsed [`Program`].
///
/// Holds the module-root environment plus the process-wide registries:
/// executables, shadow environments, the policy enforcer, the module cache,
/// and the external runners.
pub struct Interpreter {
    pub(crate) env: Environment,
    pub(crate) runners: Arc<RunnerSet>,
    pub(crate) enforcer: RwLock<Arc<PolicyEnforcer>>,
    pub(crate) exes: RwLock<BTreeMap<String, ExecutableDef>>,
    pub(crate) shadows: RwLock<BTreeMap<String, BTreeMap<String, String>>>,
    pub(crate) exports: RwLock<Vec<String>>,
    pub(crate) bus: Option<Arc<StreamBus>>,
    pub(crate) loader: Arc<dyn ProgramLoader>,
    pub(crate) modules: Arc<ModuleCache>,
    pub(crate) visiting: Mutex<Vec<String>>,
    pub(crate) options: RunOptions,
}

impl Interpreter {
    /// Interpreter with the given effect handler and options.
    #[must_use]
    pub fn new(effects: Arc<dyn EffectHandler>, options: RunOptions) -> Self {
        Self {
            env: Environment::root(effects),
            runners: Arc::new(RunnerSet::new()),
            enforcer: RwLock::new(Arc::new(PolicyEnforcer::permissive())),
            exes: RwLock::new(BTreeMap::new()),
            shadows: RwLock::new(BTreeMap::new()),
            exports: RwLock::new(Vec::new()),
            bus: None,
            loader: Arc::new(JsonAstLoader),
            modules: Arc::new(ModuleCache::new()),
            visiting: Mutex::new(Vec::new()),
            options,
        }
    }

    /// Attach a stream bus (builder).
    #[must_use]
    pub fn with_bus(mut self, bus: Arc<StreamBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Replace the program loader (builder).
    #[must_use]
    pub fn with_loader(mut self, loader: Arc<dyn ProgramLoader>) -> Self {
        self.loader = loader;
        self
    }

    /// The module-root environment.
    #[must_use]
    pub fn env(&self) -> &Environment {
        &self.env
    }

    /// The active policy enforcer.
    #[must_use]
    pub fn enforcer(&self) -> Arc<PolicyEnforcer> {
        self.enforcer
            .read()
            .map(|e| Arc::clone(&e))
            .unwrap_or_else(|_| Arc::new(PolicyEnforcer::permissive()))
    }

    /// Names exported by the evaluated module.
    #[must_use]
    pub fn exported_names(&self) -> Vec<String> {
        self.exports.read().map(|e| e.clone()).unwrap_or_default()
    }

    /// Evaluate a whole program.
    ///
    /// Bare text (markdown mode) becomes stdout output; directives run in
    /// program order. Errors are enriched with the directive kind before
    /// propagating.
    ///
    /// # Errors
    ///
    /// The first fatal error aborts evaluation.
    pub async fn run_program(&self, program: &Program) -> Result<(), MlldError> {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        self.env.set_current_file_path(program.file_path.clone());
        if let Some(file) = &program.file_path {
            // Record this module in the import chain for cycle detection.
            if let Ok(mut visiting) = self.visiting.lock() {
                if !visiting.contains(file) {
                    visiting.push(file.clone());
                }
            }
        }
        self.publish(StreamEvent::Start { run_id });
        info!(target: "mlld.interp", %run_id, "run start");

        let result = self.run_nodes(program).await;

        match &result {
            Ok(()) => self.publish(StreamEvent::Stop {
                run_id,
                duration_ms: started.elapsed().as_millis() as u64,
            }),
            Err(err) => self.publish(StreamEvent::Error {
                code: err.code().code().to_string(),
                message: err.to_string(),
            }),
        }
        result
    }

    async fn run_nodes(&self, program: &Program) -> Result<(), MlldError> {
        use mlld_core::ast::ProgramNode;
        for node in &program.nodes {
            match node {
                ProgramNode::Text { content } => {
                    self.env
                        .emit_effect(Effect::stdout(ensure_newline(content.clone())));
                }
                ProgramNode::Directive(directive) => {
                    self.eval_directive(directive, &self.env)
                        .await
                        .map_err(|e| {
                            let e = e.in_context(directive.kind.as_str());
                            match directive.location {
                                Some(loc) => e.at(loc),
                                None => e,
                            }
                        })?;
                }
            }
        }
        Ok(())
    }

    /// Evaluate a single expression sequence at module scope (used by the
    /// live RPC `execute` request and tests).
    ///
    /// # Errors
    ///
    /// Propagates any evaluation error.
    pub async fn eval_expression(
        &self,
        nodes: &[mlld_core::ast::Node],
    ) -> Result<StructuredValue, MlldError> {
        self.resolve_nodes(nodes, &self.env, interpolate::InterpContext::PlainText)
            .await
    }

    pub(crate) fn publish(&self, event: StreamEvent) {
        if let Some(bus) = &self.bus {
            bus.publish(event);
        }
    }
}
