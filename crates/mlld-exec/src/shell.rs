// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shell adapter.
//!
//! Small parameters are exported as `MLLD_IN_*` environment variables. When
//! any parameter (or the script itself) exceeds the inline limit, the whole
//! script is fed through stdin (`sh -s`) with quoted-heredoc assignments
//! prepended, which keeps every `execve` argument tiny regardless of value
//! size.

use async_trait::async_trait;
use mlld_core::MlldError;

use crate::delivery::{env_name, wrap_heredoc, INLINE_LIMIT};
use crate::process::{self, ProcessSpec};
use crate::{ExecOutcome, ExecRequest, Language, Runner};

/// Runs `sh { … }` bodies and `cmd { … }` command lines.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
}

impl ShellRunner {
    /// Runner using the platform `sh`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }

    /// Runner using an explicit shell binary.
    #[must_use]
    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Runner for ShellRunner {
    async fn execute(&self, request: ExecRequest) -> Result<ExecOutcome, MlldError> {
        let mut env = request.env.clone();
        let large: Vec<_> = request
            .params
            .iter()
            .filter(|p| p.value.len() > INLINE_LIMIT)
            .collect();
        for param in request
            .params
            .iter()
            .filter(|p| p.value.len() <= INLINE_LIMIT)
        {
            env.insert(env_name(&param.name), param.value.clone());
        }

        let spec = if large.is_empty() && request.code.len() <= INLINE_LIMIT {
            ProcessSpec {
                program: self.shell.clone(),
                args: vec!["-c".to_string(), request.code],
                env,
                cwd: request.ctx.cwd,
                stdin: request.stdin,
                timeout: request.ctx.timeout,
            }
        } else {
            // Script over stdin: heredoc assignments, then the body.
            let mut script = String::new();
            for param in large {
                let var = env_name(&param.name);
                script.push_str(&wrap_heredoc(&var, &param.value));
                script.push('\n');
                script.push_str(&format!("export {var}\n"));
            }
            script.push_str(&request.code);
            script.push('\n');
            ProcessSpec {
                program: self.shell.clone(),
                args: vec!["-s".to_string()],
                env,
                cwd: request.ctx.cwd,
                stdin: Some(script),
                timeout: request.ctx.timeout,
            }
        };

        process::run(spec).await
    }

    fn language(&self) -> Language {
        Language::Shell
    }
}
