// SPDX-License-Identifier: MIT OR Apache-2.0
//! Language runtime adapters for `js`/`node` and `python` bodies.
//!
//! Each adapter compiles the user body into a self-contained script: a
//! prelude that collects `MLLD_IN_*` variables and merges any large-value
//! JSON payload from stdin, one binding per formal parameter, then the body
//! wrapped so its return value lands on stdout (strings verbatim, anything
//! else as JSON).

use async_trait::async_trait;
use mlld_core::MlldError;

use crate::delivery::{ParamDelivery, ENV_PREFIX};
use crate::process::{self, ProcessSpec};
use crate::{ExecOutcome, ExecRequest, Language, Param, Runner};

// ── Node ────────────────────────────────────────────────────────────────

/// Runs `js { … }` / `node { … }` bodies via the `node` binary.
#[derive(Debug, Clone)]
pub struct NodeRunner {
    binary: String,
}

impl NodeRunner {
    /// Runner using `node` from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            binary: "node".to_string(),
        }
    }

    /// Render the complete script for a request (exposed for tests).
    #[must_use]
    pub fn script(params: &[Param], body: &str) -> String {
        let mut script = String::new();
        script.push_str(&format!(
            r#"const __mlld = {{}};
for (const [k, v] of Object.entries(process.env)) {{
  if (k.startsWith('{ENV_PREFIX}')) __mlld[k.slice({prefix_len})] = v;
}}
let __mlld_stdin = '';
try {{ __mlld_stdin = require('fs').readFileSync(0, 'utf8'); }} catch {{}}
if (__mlld_stdin) {{
  try {{ Object.assign(__mlld, JSON.parse(__mlld_stdin)); }} catch {{}}
}}
"#,
            prefix_len = ENV_PREFIX.len()
        ));
        for param in params {
            let name = &param.name;
            if param.json.is_some() {
                script.push_str(&format!(
                    "let {name}; try {{ {name} = JSON.parse(__mlld[{key}] ?? 'null'); }} catch {{ {name} = __mlld[{key}] ?? ''; }}\n",
                    key = js_string(name)
                ));
            } else {
                script.push_str(&format!(
                    "const {name} = __mlld[{key}] ?? '';\n",
                    key = js_string(name)
                ));
            }
        }
        script.push_str("(async () => {\n");
        script.push_str("  const __result = await (async () => {\n");
        script.push_str(body);
        script.push_str("\n  })();\n");
        script.push_str(
            "  if (__result !== undefined) process.stdout.write(typeof __result === 'string' ? __result : JSON.stringify(__result));\n",
        );
        script.push_str(
            "})().catch((err) => { console.error(err && err.stack ? err.stack : String(err)); process.exit(1); });\n",
        );
        script
    }
}

impl Default for NodeRunner {
    fn default() -> Self {
        Self::new()
    }
}

fn js_string(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

#[async_trait]
impl Runner for NodeRunner {
    async fn execute(&self, request: ExecRequest) -> Result<ExecOutcome, MlldError> {
        let delivery = ParamDelivery::plan(&request.params);
        let mut env = delivery.env;
        env.extend(request.env.clone());
        let stdin = request.stdin.clone().or(delivery.stdin_payload);
        process::run(ProcessSpec {
            program: self.binary.clone(),
            args: vec![
                "-e".to_string(),
                Self::script(&request.params, &request.code),
            ],
            env,
            cwd: request.ctx.cwd,
            stdin,
            timeout: request.ctx.timeout,
        })
        .await
    }

    fn language(&self) -> Language {
        Language::Node
    }
}

// ── Python ──────────────────────────────────────────────────────────────

/// Runs `python { … }` bodies via `python3`.
#[derive(Debug, Clone)]
pub struct PythonRunner {
    binary: String,
}

impl PythonRunner {
    /// Runner using `python3` from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            binary: "python3".to_string(),
        }
    }

    /// Render the complete script for a request (exposed for tests).
    #[must_use]
    pub fn script(params: &[Param], body: &str) -> String {
        let mut script = String::new();
        script.push_str(&format!(
            r#"import json, os, sys
__mlld = {{k[{prefix_len}:]: v for k, v in os.environ.items() if k.startswith("{ENV_PREFIX}")}}
__mlld_stdin = sys.stdin.read()
if __mlld_stdin:
    try:
        __mlld.update(json.loads(__mlld_stdin))
    except ValueError:
        pass
"#,
            prefix_len = ENV_PREFIX.len()
        ));
        for param in params {
            let name = &param.name;
            let key = js_string(name);
            if param.json.is_some() {
                script.push_str(&format!(
                    "try:\n    {name} = json.loads(__mlld.get({key}, \"null\"))\nexcept ValueError:\n    {name} = __mlld.get({key}, \"\")\n"
                ));
            } else {
                script.push_str(&format!("{name} = __mlld.get({key}, \"\")\n"));
            }
        }
        script.push_str("def __mlld_main():\n");
        for line in body.lines() {
            script.push_str("    ");
            script.push_str(line);
            script.push('\n');
        }
        if body.lines().count() == 0 {
            script.push_str("    pass\n");
        }
        script.push_str(
            "__result = __mlld_main()\nif __result is not None:\n    sys.stdout.write(__result if isinstance(__result, str) else json.dumps(__result))\n",
        );
        script
    }
}

impl Default for PythonRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Runner for PythonRunner {
    async fn execute(&self, request: ExecRequest) -> Result<ExecOutcome, MlldError> {
        let delivery = ParamDelivery::plan(&request.params);
        let mut env = delivery.env;
        env.extend(request.env.clone());
        let stdin = request.stdin.clone().or(delivery.stdin_payload);
        process::run(ProcessSpec {
            program: self.binary.clone(),
            args: vec![
                "-c".to_string(),
                Self::script(&request.params, &request.code),
            ],
            env,
            cwd: request.ctx.cwd,
            stdin,
            timeout: request.ctx.timeout,
        })
        .await
    }

    fn language(&self) -> Language {
        Language::Python
    }
}
