// SPDX-License-Identifier: MIT OR Apache-2.0
//! Program loading, the module cache, and import resolution.
//!
//! The grammar lives outside this workspace, so programs arrive through a
//! [`ProgramLoader`]. The default loader reads a serialized AST (JSON).
//! Imported modules evaluate in their own module-root environment; their
//! exported bindings and executables are copied into the importing scope.
//! The cache holds at most one entry per module path behind a per-entry
//! async lock, so concurrent imports of the same module load it once.

use async_trait::async_trait;
use mlld_core::ast::{Directive, Program};
use mlld_core::{ErrorCode, MlldError, StructuredValue, Variable, VariableKind};
use mlld_env::{BindingKind, Environment};
use mlld_core::ast::NodeKind;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::exec_def::ExecutableDef;
use crate::{Interpreter, RunOptions};

// ── ProgramLoader ───────────────────────────────────────────────────────

/// Source of parsed programs.
#[async_trait]
pub trait ProgramLoader: Send + Sync {
    /// Load and parse the program at `path`.
    ///
    /// # Errors
    ///
    /// Fails when the file is unreadable or not a valid program.
    async fn load(&self, path: &Path) -> Result<Program, MlldError>;
}

/// Default loader: the file contains a serialized [`Program`] (JSON).
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonAstLoader;

#[async_trait]
impl ProgramLoader for JsonAstLoader {
    async fn load(&self, path: &Path) -> Result<Program, MlldError> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|err| {
            MlldError::resolution(
                ErrorCode::ModuleNotFound,
                format!("cannot read module '{}': {err}", path.display()),
            )
        })?;
        let mut program: Program = serde_json::from_str(&raw).map_err(|err| {
            MlldError::Syntax {
                message: format!("invalid program '{}': {err}", path.display()),
                location: None,
            }
        })?;
        if program.file_path.is_none() {
            program.file_path = Some(path.display().to_string());
        }
        Ok(program)
    }
}

// ── ModuleCache ─────────────────────────────────────────────────────────

/// An evaluated module, immutable once written.
#[derive(Debug, Clone)]
pub struct CachedModule {
    /// Exported bindings.
    pub exports: Vec<Variable>,
    /// Exported executables.
    pub exes: Vec<ExecutableDef>,
    /// Content hash of the loaded program.
    pub hash: String,
    /// When the entry was written.
    pub loaded_at: Instant,
}

type EntryLock = Arc<tokio::sync::Mutex<Option<CachedModule>>>;

/// Content-addressed cache with one async lock per module path, so each
/// (module, version) is fetched at most once.
#[derive(Debug, Default)]
pub struct ModuleCache {
    entries: Mutex<BTreeMap<String, EntryLock>>,
}

impl ModuleCache {
    /// Empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for `key`, created on first use.
    #[must_use]
    pub fn entry(&self, key: &str) -> EntryLock {
        let mut entries = self.entries.lock().expect("module cache poisoned");
        Arc::clone(entries.entry(key.to_string()).or_default())
    }

    /// Number of cached module slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// Returns `true` when nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Content hash of a program, used for the content-addressed cache.
#[must_use]
pub fn program_hash(program: &Program) -> String {
    let serialized = serde_json::to_vec(program).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&serialized);
    format!("{:x}", hasher.finalize())
}

// ── Import evaluation ───────────────────────────────────────────────────

impl Interpreter {
    pub(crate) async fn eval_import(
        &self,
        directive: &Directive,
        env: &Environment,
    ) -> Result<Option<StructuredValue>, MlldError> {
        let path_text = directive
            .slot("path")
            .and_then(|nodes| {
                nodes.iter().find_map(|n| match &n.kind {
                    NodeKind::Text { content } => Some(content.clone()),
                    _ => None,
                })
            })
            .ok_or_else(|| {
                MlldError::validation(ErrorCode::MissingSlot, "import requires a 'path' slot")
            })?;
        let kind = directive
            .meta_value("kind")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("local");
        let ttl = directive
            .meta_value("ttl")
            .and_then(serde_json::Value::as_u64)
            .map(Duration::from_secs);

        let resolved = self.resolve_load_path(&self.options.base_dir, &path_text)?;
        let key = resolved.display().to_string();

        // Cycle detection over the active import chain.
        {
            let visiting = self.visiting.lock().expect("visiting poisoned");
            if visiting.contains(&key) {
                let mut chain = visiting.clone();
                chain.push(key.clone());
                return Err(MlldError::CircularImport { chain });
            }
        }

        let entry = self.modules.entry(&key);
        let mut slot = entry.lock().await;
        let fresh = match (&*slot, kind) {
            (_, "live") => None,
            (Some(module), "cached") => {
                let ttl = ttl.unwrap_or(Duration::from_secs(300));
                (module.loaded_at.elapsed() < ttl).then(|| module.clone())
            }
            (Some(module), _) => Some(module.clone()),
            (None, _) => None,
        };

        let module = match fresh {
            Some(module) => module,
            None => {
                debug!(target: "mlld.interp", module = %key, "loading module");
                let module = self.load_module(&resolved, &key).await?;
                *slot = Some(module.clone());
                module
            }
        };
        drop(slot);

        // Requested names, or everything the module exports.
        let requested: Option<Vec<String>> = directive.slot("names").map(|nodes| {
            nodes
                .iter()
                .filter_map(|n| match &n.kind {
                    NodeKind::Text { content } => Some(content.trim().to_string()),
                    _ => None,
                })
                .filter(|s| !s.is_empty())
                .collect()
        });

        for variable in &module.exports {
            if requested
                .as_ref()
                .is_none_or(|names| names.contains(&variable.name))
            {
                env.declare(BindingKind::System, variable.clone())?;
            }
        }
        for def in &module.exes {
            if requested
                .as_ref()
                .is_none_or(|names| names.contains(&def.name))
            {
                self.register_exec(def.clone())?;
            }
        }
        Ok(None)
    }

    async fn load_module(&self, path: &Path, key: &str) -> Result<CachedModule, MlldError> {
        let program = self.loader.load(path).await?;

        let chain = {
            let mut visiting = self.visiting.lock().expect("visiting poisoned");
            visiting.push(key.to_string());
            visiting.clone()
        };

        let sub = Interpreter {
            env: Environment::root(self.env.effects()),
            runners: Arc::clone(&self.runners),
            enforcer: RwLock::new(self.enforcer()),
            exes: RwLock::new(BTreeMap::new()),
            shadows: RwLock::new(BTreeMap::new()),
            exports: RwLock::new(Vec::new()),
            bus: self.bus.clone(),
            loader: Arc::clone(&self.loader),
            modules: Arc::clone(&self.modules),
            visiting: Mutex::new(chain),
            options: RunOptions {
                base_dir: path
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from(".")),
                parallel: self.options.parallel.clone(),
                ..self.options.clone()
            },
        };
        let result = sub.run_program(&program).await;

        if let Ok(mut visiting) = self.visiting.lock() {
            visiting.pop();
        }
        result?;

        let mut names = sub.exported_names();
        if names.is_empty() {
            names = sub.env.own_names();
        }
        let exports: Vec<Variable> = names
            .iter()
            .filter_map(|name| sub.env.get_variable(name))
            .filter(|v| v.kind != VariableKind::Executable)
            .collect();
        let exes: Vec<ExecutableDef> = {
            let defs = sub.exes.read().map(|m| m.clone()).unwrap_or_default();
            defs.into_values()
                .filter(|def| {
                    sub.exported_names().is_empty() || names.contains(&def.name)
                })
                .collect()
        };

        Ok(CachedModule {
            exports,
            exes,
            hash: program_hash(&program),
            loaded_at: Instant::now(),
        })
    }
}
