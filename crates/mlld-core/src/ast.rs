// SPDX-License-Identifier: MIT OR Apache-2.0
//! The AST shape the evaluator consumes.
//!
//! The grammar lives outside this workspace; any front-end that produces
//! these serde-compatible types can drive the interpreter. Directives carry
//! their operands in named slots (`values`), each an interpolatable sequence
//! of [`Node`]s. Nested bodies (`for`, `when`, `exe`) are directives wrapped
//! in [`NodeKind::Directive`].

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::SourceLocation;

// ── DirectiveKind ───────────────────────────────────────────────────────

/// Every statement form the evaluator dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum DirectiveKind {
    /// Module-level binding.
    Var,
    /// Block-scoped binding.
    Let,
    /// Validated path binding.
    Path,
    /// Executable definition.
    Exe,
    /// Render and emit to stdout.
    Show,
    /// `show` sugar; stderr when used as a pipeline effect.
    Log,
    /// Execute a command or code.
    Run,
    /// Write to stdout, stderr, or a file.
    Output,
    /// Append to a file.
    Append,
    /// Iteration, optionally parallel.
    For,
    /// Conditional (switch or guarded form).
    When,
    /// Bring bindings from another module into scope.
    Import,
    /// Declare the module's public API.
    Export,
    /// Declare a guard.
    Guard,
    /// Bind a policy configuration.
    Policy,
    /// Include content from another file.
    Embed,
    /// Alias of `embed`.
    Add,
    /// Request streaming execution.
    Stream,
    /// Streaming `run`.
    StreamRun,
}

impl DirectiveKind {
    /// Canonical lower-case spelling, as it appears in source.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Var => "var",
            Self::Let => "let",
            Self::Path => "path",
            Self::Exe => "exe",
            Self::Show => "show",
            Self::Log => "log",
            Self::Run => "run",
            Self::Output => "output",
            Self::Append => "append",
            Self::For => "for",
            Self::When => "when",
            Self::Import => "import",
            Self::Export => "export",
            Self::Guard => "guard",
            Self::Policy => "policy",
            Self::Embed => "embed",
            Self::Add => "add",
            Self::Stream => "stream",
            Self::StreamRun => "stream-run",
        }
    }
}

impl std::fmt::Display for DirectiveKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Field and pipe access ───────────────────────────────────────────────

/// One step of postfix field access on a variable reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldAccess {
    /// `.name`
    Field {
        /// Property name.
        name: String,
    },
    /// `[i]`; negative indices count from the end.
    Index {
        /// Zero-based index.
        index: i64,
    },
    /// `[start:end]`; either bound may be omitted.
    Slice {
        /// Inclusive start, defaulting to 0.
        start: Option<i64>,
        /// Exclusive end, defaulting to the length.
        end: Option<i64>,
    },
}

/// Invocation of a named executable, used both for call expressions and for
/// pipeline stages.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct ExecInvocation {
    /// Executable name, without the `@` sigil.
    pub name: String,
    /// Positional arguments, each an interpolatable sequence.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Vec<Node>>,
    /// Named bound arguments from partial application (`bind: {…}`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub bind: BTreeMap<String, Vec<Node>>,
}

impl ExecInvocation {
    /// Invocation with no arguments.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            bind: BTreeMap::new(),
        }
    }

    /// Append a positional argument sequence.
    #[must_use]
    pub fn arg(mut self, nodes: Vec<Node>) -> Self {
        self.args.push(nodes);
        self
    }
}

/// A reference to a variable with optional field access and postfix pipes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct VariableReference {
    /// Identifier, without the `@` sigil.
    pub identifier: String,
    /// Field path applied left to right.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldAccess>,
    /// Postfix pipeline applied after field access.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pipes: Vec<ExecInvocation>,
    /// Parser's type annotation, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_type: Option<String>,
}

impl VariableReference {
    /// Bare reference to `identifier`.
    #[must_use]
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            fields: Vec::new(),
            pipes: Vec::new(),
            value_type: None,
        }
    }

    /// Append a `.name` field step.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>) -> Self {
        self.fields.push(FieldAccess::Field { name: name.into() });
        self
    }

    /// Append an `[i]` index step.
    #[must_use]
    pub fn index(mut self, index: i64) -> Self {
        self.fields.push(FieldAccess::Index { index });
        self
    }

    /// Append a postfix pipe stage.
    #[must_use]
    pub fn pipe(mut self, invocation: ExecInvocation) -> Self {
        self.pipes.push(invocation);
        self
    }
}

// ── Node ────────────────────────────────────────────────────────────────

/// The payload of a [`Node`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum NodeKind {
    /// Literal text.
    Text {
        /// The text content.
        content: String,
    },
    /// `@var` reference with optional fields and pipes.
    VarRef(VariableReference),
    /// `@fn(...)` invocation.
    Exec(ExecInvocation),
    /// A literal JSON value (numbers, booleans, arrays, objects).
    Literal {
        /// The literal payload.
        value: serde_json::Value,
    },
    /// `<path>` file load; `pattern` may contain a glob.
    Load {
        /// Path or glob pattern relative to the current file.
        pattern: String,
        /// Optional section header to extract.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        section: Option<String>,
    },
    /// Fenced code body with its language tag.
    Code {
        /// Language tag (`js`, `python`, `sh`, …).
        lang: String,
        /// The code body.
        body: String,
    },
    /// A comment; ignored by evaluation.
    Comment {
        /// Comment text.
        text: String,
    },
    /// A parse-error placeholder surfaced at evaluation time.
    Error {
        /// The parser's message.
        message: String,
    },
    /// A nested directive (block bodies).
    Directive(Box<Directive>),
    /// A `when` branch: condition (or key) and body.
    Branch {
        /// Branch key or condition sequence; empty for `none`/wildcard forms.
        condition: Vec<Node>,
        /// Nodes evaluated when the branch fires.
        body: Vec<Node>,
    },
}

/// One element of an interpolatable sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Node {
    /// Stable node identity assigned by the parser.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// Source location, surfaced in errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<SourceLocation>,
    /// The payload.
    #[serde(flatten)]
    pub kind: NodeKind,
}

impl Node {
    fn of(kind: NodeKind) -> Self {
        Self {
            node_id: None,
            location: None,
            kind,
        }
    }

    /// Literal text node.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self::of(NodeKind::Text {
            content: content.into(),
        })
    }

    /// Bare variable reference node.
    #[must_use]
    pub fn var(identifier: impl Into<String>) -> Self {
        Self::of(NodeKind::VarRef(VariableReference::new(identifier)))
    }

    /// Variable reference node from a prepared reference.
    #[must_use]
    pub fn var_ref(reference: VariableReference) -> Self {
        Self::of(NodeKind::VarRef(reference))
    }

    /// Executable invocation node.
    #[must_use]
    pub fn exec(invocation: ExecInvocation) -> Self {
        Self::of(NodeKind::Exec(invocation))
    }

    /// Literal JSON node.
    #[must_use]
    pub fn literal(value: serde_json::Value) -> Self {
        Self::of(NodeKind::Literal { value })
    }

    /// File-load node.
    #[must_use]
    pub fn load(pattern: impl Into<String>) -> Self {
        Self::of(NodeKind::Load {
            pattern: pattern.into(),
            section: None,
        })
    }

    /// Code-fence node.
    #[must_use]
    pub fn code(lang: impl Into<String>, body: impl Into<String>) -> Self {
        Self::of(NodeKind::Code {
            lang: lang.into(),
            body: body.into(),
        })
    }

    /// Nested directive node.
    #[must_use]
    pub fn directive(directive: Directive) -> Self {
        Self::of(NodeKind::Directive(Box::new(directive)))
    }

    /// `when` branch node.
    #[must_use]
    pub fn branch(condition: Vec<Node>, body: Vec<Node>) -> Self {
        Self::of(NodeKind::Branch { condition, body })
    }

    /// Attach a source location.
    #[must_use]
    pub fn at(mut self, location: SourceLocation) -> Self {
        self.location = Some(location);
        self
    }
}

// ── Directive ───────────────────────────────────────────────────────────

/// An mlld statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Directive {
    /// Statement form.
    pub kind: DirectiveKind,
    /// Parser-assigned refinement of the form (`parallel`, `switch`, …).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    /// Named operand slots, each an interpolatable sequence.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub values: BTreeMap<String, Vec<Node>>,
    /// Raw source text, when the parser preserves it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    /// Free-form attributes (`with { … }` options, iteration caps, labels).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, serde_json::Value>,
    /// Stable node identity assigned by the parser.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// Source location, surfaced in errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<SourceLocation>,
}

impl Directive {
    /// Empty directive of the given kind.
    #[must_use]
    pub fn new(kind: DirectiveKind) -> Self {
        Self {
            kind,
            subtype: None,
            values: BTreeMap::new(),
            raw: None,
            meta: BTreeMap::new(),
            node_id: None,
            location: None,
        }
    }

    /// Set a named slot (builder).
    #[must_use]
    pub fn value(mut self, slot: impl Into<String>, nodes: Vec<Node>) -> Self {
        self.values.insert(slot.into(), nodes);
        self
    }

    /// Set a meta attribute (builder).
    #[must_use]
    pub fn meta_attr(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    /// Set the subtype (builder).
    #[must_use]
    pub fn subtyped(mut self, subtype: impl Into<String>) -> Self {
        self.subtype = Some(subtype.into());
        self
    }

    /// Attach a source location (builder).
    #[must_use]
    pub fn at(mut self, location: SourceLocation) -> Self {
        self.location = Some(location);
        self
    }

    /// Look up a slot.
    #[must_use]
    pub fn slot(&self, name: &str) -> Option<&[Node]> {
        self.values.get(name).map(Vec::as_slice)
    }

    /// Look up a meta attribute.
    #[must_use]
    pub fn meta_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.meta.get(key)
    }
}

// ── Program ─────────────────────────────────────────────────────────────

/// How bare text at line start is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    /// `.mld`: bare text is an error.
    #[default]
    Strict,
    /// `.md`: bare text is output content; directives carry a `/` prefix.
    Markdown,
}

/// One top-level element of a program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgramNode {
    /// A directive statement.
    Directive(Directive),
    /// Bare text (markdown mode only).
    Text {
        /// The text content.
        content: String,
    },
}

/// A parsed program, ready for evaluation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct Program {
    /// Source mode the program was parsed under.
    #[serde(default)]
    pub mode: SourceMode,
    /// Top-level statements in program order.
    #[serde(default)]
    pub nodes: Vec<ProgramNode>,
    /// Path of the source file, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

impl Program {
    /// A strict-mode program over the given directives.
    #[must_use]
    pub fn from_directives(directives: Vec<Directive>) -> Self {
        Self {
            mode: SourceMode::Strict,
            nodes: directives.into_iter().map(ProgramNode::Directive).collect(),
            file_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directive_builder_round_trips_through_serde() {
        let d = Directive::new(DirectiveKind::Var)
            .value("identifier", vec![Node::text("greeting")])
            .value(
                "value",
                vec![Node::text("hello "), Node::var("name")],
            )
            .meta_attr("labels", serde_json::json!(["pii"]));
        let json = serde_json::to_string(&d).unwrap();
        let back: Directive = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn node_kind_serde_tag_is_kebab_case() {
        let n = Node::var_ref(VariableReference::new("v").field("a").index(-1));
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["type"], "var-ref");
        let back: Node = serde_json::from_value(json).unwrap();
        assert_eq!(back, n);
    }

    #[test]
    fn program_round_trips() {
        let p = Program::from_directives(vec![
            Directive::new(DirectiveKind::Show).value("value", vec![Node::text("hi")]),
        ]);
        let json = serde_json::to_string(&p).unwrap();
        let back: Program = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn exec_invocation_with_bind() {
        let mut inv = ExecInvocation::new("validate").arg(vec![Node::var("input")]);
        inv.bind.insert("limit".into(), vec![Node::text("3")]);
        let json = serde_json::to_string(&inv).unwrap();
        let back: ExecInvocation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, inv);
    }
}
