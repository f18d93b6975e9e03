// SPDX-License-Identifier: MIT OR Apache-2.0
//! File loads for `<path>` and `<glob*>` expressions, plus markdown section
//! extraction for `embed`.

use globset::Glob;
use mlld_core::{MlldError, StructuredValue};
use mlld_env::Environment;
use std::path::{Path, PathBuf};

use crate::Interpreter;

impl Interpreter {
    /// Load a path or glob pattern into a structured value.
    ///
    /// A plain path yields a single load-result. A glob yields an array of
    /// load-results in lexicographic path order whose textual view is the
    /// concatenation of the file contents.
    ///
    /// # Errors
    ///
    /// Fails when a plain path does not exist or cannot be read; a glob
    /// matching nothing yields an empty array.
    pub async fn load_pattern(
        &self,
        pattern: &str,
        section: Option<&str>,
        env: &Environment,
    ) -> Result<StructuredValue, MlldError> {
        let base = self.load_base(env);
        if pattern.contains('*') || pattern.contains('[') || pattern.contains('?') {
            let paths = glob_paths(&base, pattern)?;
            let mut items = Vec::with_capacity(paths.len());
            for path in paths {
                items.push(self.load_one(&path, section).await?);
            }
            return Ok(StructuredValue::items(items));
        }
        let path = self.resolve_load_path(&base, pattern)?;
        self.load_one(&path, section).await
    }

    async fn load_one(
        &self,
        path: &Path,
        section: Option<&str>,
    ) -> Result<StructuredValue, MlldError> {
        let content = tokio::fs::read_to_string(path).await.map_err(|err| {
            MlldError::resolution(
                mlld_core::ErrorCode::ModuleNotFound,
                format!("cannot read '{}': {err}", path.display()),
            )
        })?;
        let content = match section {
            Some(heading) => extract_section(&content, heading, DEFAULT_SECTION_THRESHOLD)
                .unwrap_or_default(),
            None => content,
        };
        Ok(StructuredValue::load_result(
            content,
            path.display().to_string(),
        ))
    }

    fn load_base(&self, env: &Environment) -> PathBuf {
        env.current_file_path()
            .map(PathBuf::from)
            .and_then(|p| p.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| self.options.base_dir.clone())
    }

    pub(crate) fn resolve_load_path(
        &self,
        base: &Path,
        raw: &str,
    ) -> Result<PathBuf, MlldError> {
        let path = Path::new(raw);
        if path.is_absolute() {
            if !self.options.allow_absolute_paths {
                return Err(MlldError::validation(
                    mlld_core::ErrorCode::MissingSlot,
                    format!("absolute path '{raw}' requires --allow-absolute-paths"),
                ));
            }
            return Ok(path.to_path_buf());
        }
        Ok(base.join(path))
    }
}

/// Minimum similarity for fuzzy heading matches, on a 0–100 scale.
const DEFAULT_SECTION_THRESHOLD: u32 = 80;

/// All paths under `base` matching `pattern`, lexicographically sorted.
fn glob_paths(base: &Path, pattern: &str) -> Result<Vec<PathBuf>, MlldError> {
    let matcher = Glob::new(pattern)
        .map_err(|err| {
            MlldError::validation(
                mlld_core::ErrorCode::MissingSlot,
                format!("invalid glob '{pattern}': {err}"),
            )
        })?
        .compile_matcher();
    let mut paths: Vec<PathBuf> = std::fs::read_dir(base)
        .map_err(MlldError::Io)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .map(|name| matcher.is_match(Path::new(name)))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();
    Ok(paths)
}

/// Extract a markdown section by heading.
///
/// The match is case-insensitive and tolerant of small differences; a
/// candidate heading wins when its similarity to the request reaches
/// `threshold` (0–100). The section runs until the next heading of the same
/// or higher level.
#[must_use]
pub fn extract_section(content: &str, heading: &str, threshold: u32) -> Option<String> {
    let mut best: Option<(u32, usize, usize)> = None; // (score, line idx, level)
    let lines: Vec<&str> = content.lines().collect();
    for (idx, line) in lines.iter().enumerate() {
        let trimmed = line.trim_start();
        let level = trimmed.chars().take_while(|c| *c == '#').count();
        if level == 0 || !trimmed[level..].starts_with(' ') {
            continue;
        }
        let title = trimmed[level..].trim();
        let score = similarity(title, heading);
        if score >= threshold && best.is_none_or(|(s, _, _)| score > s) {
            best = Some((score, idx, level));
        }
    }
    let (_, start, level) = best?;
    let mut out = String::new();
    for line in &lines[start..] {
        let trimmed = line.trim_start();
        let l = trimmed.chars().take_while(|c| *c == '#').count();
        if l > 0 && l <= level && !out.is_empty() {
            break;
        }
        out.push_str(line);
        out.push('\n');
    }
    Some(out)
}

/// Similarity on a 0–100 scale: normalized longest-common-subsequence over
/// case-folded titles. Cheap, order-preserving, and good enough for heading
/// typos.
fn similarity(a: &str, b: &str) -> u32 {
    let a: Vec<char> = a.to_lowercase().chars().collect();
    let b: Vec<char> = b.to_lowercase().chars().collect();
    if a.is_empty() || b.is_empty() {
        return if a == b { 100 } else { 0 };
    }
    let mut dp = vec![vec![0usize; b.len() + 1]; a.len() + 1];
    for i in 1..=a.len() {
        for j in 1..=b.len() {
            dp[i][j] = if a[i - 1] == b[j - 1] {
                dp[i - 1][j - 1] + 1
            } else {
                dp[i - 1][j].max(dp[i][j - 1])
            };
        }
    }
    (200 * dp[a.len()][b.len()] / (a.len() + b.len())) as u32
}
