// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! mlld-config
#![deny(unsafe_code)]
#![warn(missing_docs)]

use mlld_core::MlldError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Current lock file version.
pub const LOCK_VERSION: u32 = 1;

// ── Lock file ───────────────────────────────────────────────────────────

/// Resolver configuration inside the lock file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Resolvers {
    /// Registry prefixes, checked in order.
    #[serde(default)]
    pub prefixes: Vec<String>,
}

/// The `config` section of the lock file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LockConfig {
    /// Resolver settings.
    #[serde(default)]
    pub resolvers: Resolvers,
}

/// `mlld.lock.json`.
///
/// Every section is optional on disk; missing sections read as empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LockFile {
    /// Format version.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Resolver configuration.
    #[serde(default)]
    pub config: LockConfig,
    /// Import pins: specifier → resolution record.
    #[serde(default)]
    pub imports: BTreeMap<String, serde_json::Value>,
    /// Module records: name → metadata.
    #[serde(default)]
    pub modules: BTreeMap<String, serde_json::Value>,
    /// Cache records: content hash → metadata.
    #[serde(default)]
    pub cache: BTreeMap<String, serde_json::Value>,
}

fn default_version() -> u32 {
    LOCK_VERSION
}

impl Default for LockFile {
    fn default() -> Self {
        Self {
            version: LOCK_VERSION,
            config: LockConfig::default(),
            imports: BTreeMap::new(),
            modules: BTreeMap::new(),
            cache: BTreeMap::new(),
        }
    }
}

impl LockFile {
    /// Read a lock file; a missing file yields the default.
    ///
    /// # Errors
    ///
    /// Fails on unreadable files or malformed JSON.
    pub fn load(path: &Path) -> Result<Self, MlldError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Write the lock file with stable two-space indentation.
    ///
    /// # Errors
    ///
    /// Propagates I/O and serialization failures.
    pub fn save(&self, path: &Path) -> Result<(), MlldError> {
        let mut out = serde_json::to_string_pretty(self)?;
        out.push('\n');
        std::fs::write(path, out)?;
        Ok(())
    }
}

// ── Environment ─────────────────────────────────────────────────────────

/// Settings read from the process environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvConfig {
    /// `MLLD_PARALLEL_LIMIT`: default worker cap for `for parallel`.
    pub parallel_limit: Option<usize>,
    /// `MLLD_IMMEDIATE_EFFECTS`: flush effects as they happen.
    pub immediate_effects: bool,
    /// `MLLD_MAX_RETRIES`: per-stage retry cap override.
    pub max_retries: Option<u32>,
    /// `MLLD_METADATA_GUARD`: guard value metadata behind explicit access.
    pub metadata_guard: bool,
}

impl EnvConfig {
    /// Snapshot the relevant environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            parallel_limit: parse_var("MLLD_PARALLEL_LIMIT"),
            immediate_effects: flag_var("MLLD_IMMEDIATE_EFFECTS"),
            max_retries: parse_var("MLLD_MAX_RETRIES"),
            metadata_guard: flag_var("MLLD_METADATA_GUARD"),
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn flag_var(name: &str) -> bool {
    std::env::var(name).map(|v| flag_value(&v)).unwrap_or(false)
}

fn flag_value(v: &str) -> bool {
    !matches!(v, "" | "0" | "false")
}
