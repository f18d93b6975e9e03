// SPDX-License-Identifier: MIT OR Apache-2.0
//! Executable definitions.
//!
//! An `exe` directive defines one of five body variants. `cmd { … }` bodies
//! are validated at definition time: shell operators mean the author wanted
//! `sh { … }`, and silently passing them to a shell would change semantics.

use mlld_core::ast::Node;
use mlld_core::security::DataLabel;
use mlld_core::{ErrorCode, MlldError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use mlld_pipeline::is_reserved;

/// Shell metacharacters rejected inside `cmd { … }` bodies.
const SHELL_OPERATORS: &[&str] = &["|", "&&", "||", ";", ">", "<", "`", "$("];

/// The body of a user-defined executable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecBody {
    /// A parameterized interpolation sequence; no external process.
    Template {
        /// The template nodes.
        nodes: Vec<Node>,
    },
    /// A literal command line; shell operators are rejected.
    Command {
        /// The command line, with `@param` interpolation slots.
        command: Vec<Node>,
    },
    /// A full shell body.
    Shell {
        /// The script, with `@param` interpolation slots.
        script: Vec<Node>,
    },
    /// A code body delegated to a language runtime.
    Code {
        /// Language tag (`js`, `node`, `python`).
        lang: String,
        /// The code body, verbatim.
        body: String,
    },
    /// A shadow-environment collection: `{lang: {fn1, fn2}}`.
    Collection {
        /// Function bodies per language.
        functions: BTreeMap<String, BTreeMap<String, String>>,
    },
}

/// A named executable: body, formal parameters, and declaration labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutableDef {
    /// Name, without the `@` sigil.
    pub name: String,
    /// Formal parameter names, in order.
    pub params: Vec<String>,
    /// The body variant.
    pub body: ExecBody,
    /// Labels declared on the executable (`destructive`, …).
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub labels: BTreeSet<DataLabel>,
}

impl ExecutableDef {
    /// Validate a definition: reserved-name and `cmd` operator checks.
    ///
    /// # Errors
    ///
    /// - [`ErrorCode::ReservedStageName`] when the name shadows a builtin.
    /// - [`ErrorCode::ShellPipeInCmd`] when a `cmd` body carries a shell
    ///   operator.
    pub fn validate(&self) -> Result<(), MlldError> {
        if is_reserved(&self.name) {
            return Err(MlldError::validation(
                ErrorCode::ReservedStageName,
                format!("'@{}' is a reserved builtin name", self.name),
            ));
        }
        if let ExecBody::Command { command } = &self.body {
            let rendered = render_static(command);
            for op in SHELL_OPERATORS {
                if rendered.contains(op) {
                    return Err(MlldError::validation(
                        ErrorCode::ShellPipeInCmd,
                        format!("cmd body for '@{}' contains '{op}'", self.name),
                    ));
                }
            }
        }
        Ok(())
    }

    /// The operation type string used for policy checks.
    #[must_use]
    pub fn op_type(&self) -> &'static str {
        match &self.body {
            ExecBody::Template { .. } => "template",
            ExecBody::Command { .. } => "cmd",
            ExecBody::Shell { .. } => "sh",
            ExecBody::Code { .. } => "code",
            ExecBody::Collection { .. } => "shadow",
        }
    }
}

/// Static text of an interpolatable sequence, ignoring dynamic parts.
fn render_static(nodes: &[Node]) -> String {
    use mlld_core::ast::NodeKind;
    nodes
        .iter()
        .filter_map(|n| match &n.kind {
            NodeKind::Text { content } => Some(content.clone()),
            NodeKind::Literal { value } => Some(match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd_def(name: &str, command: &str) -> ExecutableDef {
        ExecutableDef {
            name: name.into(),
            params: vec![],
            body: ExecBody::Command {
                command: vec![Node::text(command)],
            },
            labels: BTreeSet::new(),
        }
    }

    #[test]
    fn shell_pipe_in_cmd_is_rejected_with_a_hint() {
        let err = cmd_def("bad", "ls | wc -l").validate().unwrap_err();
        assert_eq!(err.code(), ErrorCode::ShellPipeInCmd);
        assert!(err.render().contains("use sh"), "{}", err.render());
    }

    #[test]
    fn plain_cmd_passes_validation() {
        cmd_def("ok", "git status").validate().unwrap();
    }

    #[test]
    fn command_substitution_and_redirects_are_rejected() {
        for body in ["echo $(date)", "echo hi > out.txt", "a && b", "a; b"] {
            assert!(cmd_def("bad", body).validate().is_err(), "{body}");
        }
    }

    #[test]
    fn shell_bodies_allow_operators() {
        let def = ExecutableDef {
            name: "count".into(),
            params: vec![],
            body: ExecBody::Shell {
                script: vec![Node::text("ls | wc -l")],
            },
            labels: BTreeSet::new(),
        };
        def.validate().unwrap();
    }

    #[test]
    fn reserved_names_cannot_be_redefined() {
        let err = cmd_def("json", "echo").validate().unwrap_err();
        assert_eq!(err.code(), ErrorCode::ReservedStageName);
        let err = cmd_def("show", "echo").validate().unwrap_err();
        assert_eq!(err.code(), ErrorCode::ReservedStageName);
    }

    #[test]
    fn def_round_trips_through_serde() {
        let def = ExecutableDef {
            name: "greet".into(),
            params: vec!["name".into()],
            body: ExecBody::Code {
                lang: "js".into(),
                body: "return `hi ${name}`;".into(),
            },
            labels: [DataLabel::from("network")].into_iter().collect(),
        };
        let json = serde_json::to_string(&def).unwrap();
        let back: ExecutableDef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, def);
    }
}
