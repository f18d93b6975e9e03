// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! mlld-env
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Effect kinds, the handler trait, and built-in handlers.
pub mod effects;

use mlld_core::security::{DataLabel, SecurityDescriptor};
use mlld_core::{ErrorCode, MlldError, Variable};
use mlld_policy::{GuardDecl, GuardRegistry, PolicySummary};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use tracing::trace;

pub use effects::{BufferedEffects, Effect, EffectHandler, EffectKind, NullEffects, TerminalEffects};

// ── Scope model ─────────────────────────────────────────────────────────

/// What level of the scope chain an environment represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// Module top level; `var` lands here.
    Module,
    /// A block body (`for`, `when […]`, `exe […]`, pipeline stage).
    Block,
}

/// Which binding form a declaration used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    /// `var`: module-level.
    Var,
    /// `let`: block-scoped.
    Let,
    /// Formal parameter bound at invocation; bypasses scope checks.
    Parameter,
    /// Runtime-provided binding (`@mx`, builtins); bypasses scope checks.
    System,
}

// ── Shared state ────────────────────────────────────────────────────────

struct SharedState {
    effects: Arc<dyn EffectHandler>,
    policy: RwLock<Arc<PolicySummary>>,
    guards: RwLock<GuardRegistry>,
    file_path: RwLock<Option<String>>,
}

// ── Environment ─────────────────────────────────────────────────────────

struct EnvInner {
    parent: Option<Environment>,
    scope: ScopeKind,
    parallel_boundary: bool,
    exe_labels: BTreeSet<DataLabel>,
    ambient: RwLock<SecurityDescriptor>,
    vars: RwLock<BTreeMap<String, Variable>>,
    shared: Arc<SharedState>,
}

/// A handle onto one scope in the chain.
///
/// Cloning is cheap and shares the scope; use the `create_*` methods to
/// open child scopes. Lookups fall through to the parent; writes always
/// land in the handle's own scope.
#[derive(Clone)]
pub struct Environment {
    inner: Arc<EnvInner>,
}

impl Environment {
    /// Root (module-level) environment with the given effect handler.
    #[must_use]
    pub fn root(effects: Arc<dyn EffectHandler>) -> Self {
        Self {
            inner: Arc::new(EnvInner {
                parent: None,
                scope: ScopeKind::Module,
                parallel_boundary: false,
                exe_labels: BTreeSet::new(),
                ambient: RwLock::new(SecurityDescriptor::default()),
                vars: RwLock::new(BTreeMap::new()),
                shared: Arc::new(SharedState {
                    effects,
                    policy: RwLock::new(Arc::new(PolicySummary::default())),
                    guards: RwLock::new(GuardRegistry::new()),
                    file_path: RwLock::new(None),
                }),
            }),
        }
    }

    fn child_with(&self, parallel_boundary: bool, exe_labels: BTreeSet<DataLabel>) -> Self {
        Self {
            inner: Arc::new(EnvInner {
                parent: Some(self.clone()),
                scope: ScopeKind::Block,
                parallel_boundary,
                exe_labels,
                ambient: RwLock::new(self.security_snapshot()),
                vars: RwLock::new(BTreeMap::new()),
                shared: Arc::clone(&self.inner.shared),
            }),
        }
    }

    /// Child scope for a block body.
    #[must_use]
    pub fn create_child(&self) -> Self {
        self.child_with(false, BTreeSet::new())
    }

    /// Child scope rooted at a parallel block; outer names become read-only.
    #[must_use]
    pub fn create_parallel_child(&self) -> Self {
        self.child_with(true, BTreeSet::new())
    }

    /// Child scope for an executable invocation, recording its labels.
    #[must_use]
    pub fn create_exec_child(&self, labels: impl IntoIterator<Item = DataLabel>) -> Self {
        self.child_with(false, labels.into_iter().collect())
    }

    /// Scope kind of this handle.
    #[must_use]
    pub fn scope(&self) -> ScopeKind {
        self.inner.scope
    }

    // ── Variables ───────────────────────────────────────────────────────

    /// Look up a variable, walking the parent chain.
    #[must_use]
    pub fn get_variable(&self, name: &str) -> Option<Variable> {
        let mut env = Some(self);
        while let Some(e) = env {
            if let Ok(vars) = e.inner.vars.read() {
                if let Some(v) = vars.get(name) {
                    return Some(v.clone());
                }
            }
            env = e.inner.parent.as_ref();
        }
        None
    }

    /// Returns `true` if `name` resolves anywhere in the chain.
    #[must_use]
    pub fn has_variable(&self, name: &str) -> bool {
        self.get_variable(name).is_some()
    }

    /// Names bound directly in this scope (not the parent chain), sorted.
    #[must_use]
    pub fn own_names(&self) -> Vec<String> {
        self.inner
            .vars
            .read()
            .map(|vars| vars.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Declare a binding, enforcing the scope rules for its form.
    ///
    /// # Errors
    ///
    /// - `var` inside a block body → [`ErrorCode::VarInsideBlock`]
    /// - `let` at module scope → [`ErrorCode::LetAtModuleScope`]
    /// - `let` rebinding a name bound outside a parallel block → a
    ///   validation error naming the read-only outer scope
    pub fn declare(&self, binding: BindingKind, variable: Variable) -> Result<(), MlldError> {
        match binding {
            BindingKind::Var => {
                if self.inner.scope != ScopeKind::Module {
                    return Err(MlldError::validation(
                        ErrorCode::VarInsideBlock,
                        format!("var @{} is not allowed inside a block body", variable.name),
                    ));
                }
            }
            BindingKind::Let => {
                if self.inner.scope == ScopeKind::Module {
                    return Err(MlldError::validation(
                        ErrorCode::LetAtModuleScope,
                        format!("let @{} is not allowed at module scope", variable.name),
                    ));
                }
                if self.outer_name_across_parallel(&variable.name) {
                    return Err(MlldError::validation(
                        ErrorCode::VarInsideBlock,
                        format!(
                            "cannot assign @{} inside a parallel block: the outer scope is read-only",
                            variable.name
                        ),
                    ));
                }
            }
            BindingKind::Parameter | BindingKind::System => {}
        }
        trace!(target: "mlld.env", name = %variable.name, ?binding, "declare");
        if let Ok(mut vars) = self.inner.vars.write() {
            vars.insert(variable.name.clone(), variable);
        }
        Ok(())
    }

    /// Bind a formal parameter in this scope.
    pub fn set_parameter(&self, variable: Variable) {
        let _ = self.declare(BindingKind::Parameter, variable);
    }

    /// Bind a runtime-provided variable in this scope.
    pub fn set_system(&self, variable: Variable) {
        let _ = self.declare(BindingKind::System, variable);
    }

    /// True when `name` is bound in a scope that lies outside the nearest
    /// parallel boundary above this handle.
    fn outer_name_across_parallel(&self, name: &str) -> bool {
        let mut crossed = self.inner.parallel_boundary;
        let mut env = self.inner.parent.as_ref();
        // Check own scope first: a binding here is always fine.
        if let Ok(vars) = self.inner.vars.read() {
            if vars.contains_key(name) {
                return false;
            }
        }
        while let Some(e) = env {
            if let Ok(vars) = e.inner.vars.read() {
                if vars.contains_key(name) {
                    return crossed;
                }
            }
            crossed |= e.inner.parallel_boundary;
            env = e.inner.parent.as_ref();
        }
        false
    }

    /// Returns `true` when this scope sits inside a parallel block.
    #[must_use]
    pub fn in_parallel_block(&self) -> bool {
        let mut env = Some(self);
        while let Some(e) = env {
            if e.inner.parallel_boundary {
                return true;
            }
            env = e.inner.parent.as_ref();
        }
        false
    }

    // ── Effects ─────────────────────────────────────────────────────────

    /// Emit an effect through the configured handler.
    pub fn emit_effect(&self, effect: Effect) {
        self.inner.shared.effects.emit(effect);
    }

    /// The configured effect handler.
    #[must_use]
    pub fn effects(&self) -> Arc<dyn EffectHandler> {
        Arc::clone(&self.inner.shared.effects)
    }

    // ── Ambient context ─────────────────────────────────────────────────

    /// Path of the file currently being evaluated, when known.
    #[must_use]
    pub fn current_file_path(&self) -> Option<String> {
        self.inner
            .shared
            .file_path
            .read()
            .ok()
            .and_then(|p| p.clone())
    }

    /// Record the file being evaluated.
    pub fn set_current_file_path(&self, path: Option<String>) {
        if let Ok(mut p) = self.inner.shared.file_path.write() {
            *p = path;
        }
    }

    /// The frozen policy summary.
    #[must_use]
    pub fn policy_summary(&self) -> Arc<PolicySummary> {
        self.inner
            .shared
            .policy
            .read()
            .map(|p| Arc::clone(&p))
            .unwrap_or_default()
    }

    /// Swap in a new policy summary (the `policy` directive's rebuild).
    pub fn set_policy_summary(&self, summary: Arc<PolicySummary>) {
        if let Ok(mut p) = self.inner.shared.policy.write() {
            *p = summary;
        }
    }

    /// Register a guard declaration.
    pub fn register_guard(&self, guard: GuardDecl) {
        if let Ok(mut guards) = self.inner.shared.guards.write() {
            guards.register(guard);
        }
    }

    /// Snapshot of the guard registry.
    #[must_use]
    pub fn guards(&self) -> GuardRegistry {
        self.inner
            .shared
            .guards
            .read()
            .map(|g| g.clone())
            .unwrap_or_default()
    }

    /// Labels of every enclosing executable, innermost last.
    #[must_use]
    pub fn enclosing_exe_labels(&self) -> BTreeSet<DataLabel> {
        let mut labels = BTreeSet::new();
        let mut env = Some(self);
        while let Some(e) = env {
            labels.extend(e.inner.exe_labels.iter().cloned());
            env = e.inner.parent.as_ref();
        }
        labels
    }

    /// The ambient security descriptor (e.g. the current pipeline input's).
    #[must_use]
    pub fn security_snapshot(&self) -> SecurityDescriptor {
        self.inner
            .ambient
            .read()
            .map(|a| a.clone())
            .unwrap_or_default()
    }

    /// Replace the ambient security descriptor for this scope.
    pub fn set_security_snapshot(&self, descriptor: SecurityDescriptor) {
        if let Ok(mut a) = self.inner.ambient.write() {
            *a = descriptor;
        }
    }

    /// Merge descriptors, in environment terms: a thin wrapper over the
    /// descriptor algebra so handlers need only the environment.
    #[must_use]
    pub fn merge_security_descriptors<'a>(
        descriptors: impl IntoIterator<Item = &'a SecurityDescriptor>,
    ) -> SecurityDescriptor {
        SecurityDescriptor::merge_all(descriptors)
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("scope", &self.inner.scope)
            .field("parallel", &self.inner.parallel_boundary)
            .field(
                "vars",
                &self
                    .inner
                    .vars
                    .read()
                    .map(|v| v.keys().cloned().collect::<Vec<_>>())
                    .unwrap_or_default(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlld_core::{StructuredValue, VariableKind};

    fn text_var(name: &str, value: &str) -> Variable {
        Variable::new(name, StructuredValue::text(value), VariableKind::Text)
    }

    fn root() -> Environment {
        Environment::root(Arc::new(BufferedEffects::new()))
    }

    #[test]
    fn child_lookup_falls_through_to_parent() {
        let env = root();
        env.declare(BindingKind::Var, text_var("greeting", "hi")).unwrap();
        let child = env.create_child();
        assert_eq!(
            child.get_variable("greeting").unwrap().value.as_text(),
            "hi"
        );
    }

    #[test]
    fn child_writes_do_not_leak() {
        let env = root();
        let child = env.create_child();
        child
            .declare(BindingKind::Let, text_var("local", "x"))
            .unwrap();
        assert!(child.has_variable("local"));
        assert!(!env.has_variable("local"));
    }

    #[test]
    fn var_inside_block_is_rejected() {
        let child = root().create_child();
        let err = child
            .declare(BindingKind::Var, text_var("module_level", "x"))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::VarInsideBlock);
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn let_at_module_scope_is_rejected() {
        let env = root();
        let err = env
            .declare(BindingKind::Let, text_var("block_level", "x"))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::LetAtModuleScope);
    }

    #[test]
    fn let_shadowing_inside_same_block_is_allowed() {
        let child = root().create_child();
        child.declare(BindingKind::Let, text_var("x", "1")).unwrap();
        child.declare(BindingKind::Let, text_var("x", "2")).unwrap();
        assert_eq!(child.get_variable("x").unwrap().value.as_text(), "2");
    }

    #[test]
    fn parallel_block_cannot_rebind_outer_names() {
        let env = root();
        env.declare(BindingKind::Var, text_var("total", "0")).unwrap();
        let worker = env.create_parallel_child().create_child();
        let err = worker
            .declare(BindingKind::Let, text_var("total", "1"))
            .unwrap_err();
        assert!(err.to_string().contains("read-only"), "{err}");
        // Fresh names are fine.
        worker
            .declare(BindingKind::Let, text_var("local", "1"))
            .unwrap();
        // And the outer binding is untouched.
        assert_eq!(env.get_variable("total").unwrap().value.as_text(), "0");
    }

    #[test]
    fn exe_labels_accumulate_up_the_chain() {
        let env = root();
        let outer = env.create_exec_child([DataLabel::from("destructive")]);
        let inner = outer.create_exec_child([DataLabel::from("network")]);
        let labels = inner.enclosing_exe_labels();
        assert!(labels.contains(&DataLabel::from("destructive")));
        assert!(labels.contains(&DataLabel::from("network")));
    }

    #[test]
    fn policy_swap_is_visible_everywhere() {
        let env = root();
        let child = env.create_child();
        let summary = Arc::new(PolicySummary {
            labels: vec!["destructive".into()],
            ..PolicySummary::default()
        });
        child.set_policy_summary(Arc::clone(&summary));
        assert_eq!(env.policy_summary().labels, vec!["destructive"]);
    }

    #[test]
    fn ambient_security_is_inherited_by_children() {
        let env = root();
        env.set_security_snapshot(SecurityDescriptor::labeled(DataLabel::Secret));
        let child = env.create_child();
        assert!(child
            .security_snapshot()
            .has_label(&DataLabel::Secret));
    }

    #[test]
    fn effects_route_to_the_shared_handler() {
        let buffer = Arc::new(BufferedEffects::new());
        let env = Environment::root(buffer.clone());
        env.create_child().emit_effect(Effect::stdout("out\n"));
        assert_eq!(buffer.stdout(), "out\n");
    }
}
