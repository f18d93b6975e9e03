// SPDX-License-Identifier: MIT OR Apache-2.0
//! Interpreter scenarios: the when-switch numeric/string match (S1),
//! alligator glob concatenation (S5), `cmd` operator rejection (S6), and
//! the variable scope rules.

use mlld_core::ast::{Directive, DirectiveKind, Node, Program};
use mlld_core::ErrorCode;
use mlld_env::{BindingKind, BufferedEffects, Environment};
use mlld_interp::{Interpreter, RunOptions};
use std::sync::Arc;

fn interp_in(dir: &std::path::Path) -> (Interpreter, Arc<BufferedEffects>) {
    let buffer = Arc::new(BufferedEffects::new());
    let interpreter = Interpreter::new(
        buffer.clone(),
        RunOptions {
            base_dir: dir.to_path_buf(),
            ..RunOptions::default()
        },
    );
    (interpreter, buffer)
}

#[tokio::test]
async fn s1_when_switch_numeric_string_equivalence() {
    let dir = tempfile::tempdir().unwrap();
    let (interpreter, buffer) = interp_in(dir.path());
    // var @v = 1; when @v: ["1" => show "a"; "2" => show "b"]
    let program = Program::from_directives(vec![
        Directive::new(DirectiveKind::Var)
            .value("identifier", vec![Node::text("v")])
            .value("value", vec![Node::literal(serde_json::json!(1))]),
        Directive::new(DirectiveKind::When)
            .value("expr", vec![Node::var("v")])
            .value(
                "branches",
                vec![
                    Node::branch(
                        vec![Node::text("1")],
                        vec![Node::directive(
                            Directive::new(DirectiveKind::Show)
                                .value("value", vec![Node::text("a")]),
                        )],
                    ),
                    Node::branch(
                        vec![Node::text("2")],
                        vec![Node::directive(
                            Directive::new(DirectiveKind::Show)
                                .value("value", vec![Node::text("b")]),
                        )],
                    ),
                ],
            ),
    ]);
    interpreter.run_program(&program).await.unwrap();
    assert_eq!(buffer.stdout(), "a\n");
}

#[tokio::test]
async fn s5_alligator_glob_concatenates_lexicographically() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("file2.md"), "two\n").unwrap();
    std::fs::write(dir.path().join("file1.md"), "one\n").unwrap();
    std::fs::write(dir.path().join("file3.md"), "three\n").unwrap();
    std::fs::write(dir.path().join("other.txt"), "nope\n").unwrap();

    let (interpreter, _) = interp_in(dir.path());
    let program = Program::from_directives(vec![Directive::new(DirectiveKind::Var)
        .value("identifier", vec![Node::text("files")])
        .value("value", vec![Node::load("file*.md")])]);
    interpreter.run_program(&program).await.unwrap();

    let files = interpreter.env().get_variable("files").unwrap();
    assert_eq!(files.value.as_text(), "one\ntwo\nthree\n");

    let items = files.value.as_items().unwrap();
    assert_eq!(items.len(), 3);
    let first = items[0].ctx();
    assert!(
        first.filename.as_deref().unwrap().ends_with("file1.md"),
        "{first:?}"
    );
}

#[tokio::test]
async fn s6_shell_pipe_in_cmd_suggests_sh() {
    let dir = tempfile::tempdir().unwrap();
    let (interpreter, _) = interp_in(dir.path());
    let program = Program::from_directives(vec![Directive::new(DirectiveKind::Exe)
        .value("identifier", vec![Node::text("bad")])
        .value("command", vec![Node::text("ls | wc -l")])]);
    let err = interpreter.run_program(&program).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ShellPipeInCmd);
    assert_eq!(err.exit_code(), 2);
    assert!(err.render().contains("sh {"), "{}", err.render());
}

#[test]
fn scope_rules_var_let_and_child_isolation() {
    use mlld_core::{StructuredValue, Variable, VariableKind};
    let env = Environment::root(Arc::new(BufferedEffects::new()));

    // var at module scope is fine; let is not.
    env.declare(
        BindingKind::Var,
        Variable::new("a", StructuredValue::text("1"), VariableKind::Text),
    )
    .unwrap();
    let err = env
        .declare(
            BindingKind::Let,
            Variable::new("b", StructuredValue::text("1"), VariableKind::Text),
        )
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::LetAtModuleScope);

    // The inverse inside a block.
    let child = env.create_child();
    let err = child
        .declare(
            BindingKind::Var,
            Variable::new("c", StructuredValue::text("1"), VariableKind::Text),
        )
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::VarInsideBlock);
    child
        .declare(
            BindingKind::Let,
            Variable::new("c", StructuredValue::text("1"), VariableKind::Text),
        )
        .unwrap();

    // Child writes never leak.
    assert!(!env.has_variable("c"));
    assert!(child.has_variable("a"));
}

#[tokio::test]
async fn run_command_output_becomes_program_output() {
    let dir = tempfile::tempdir().unwrap();
    let (interpreter, buffer) = interp_in(dir.path());
    let program = Program::from_directives(vec![Directive::new(DirectiveKind::Run)
        .value("command", vec![Node::text("printf 'from-shell'")])]);
    interpreter.run_program(&program).await.unwrap();
    assert_eq!(buffer.stdout(), "from-shell\n");
}

#[tokio::test]
async fn run_nonzero_exit_is_fatal_outside_pipelines() {
    let dir = tempfile::tempdir().unwrap();
    let (interpreter, _) = interp_in(dir.path());
    let program = Program::from_directives(vec![Directive::new(DirectiveKind::Run)
        .value("command", vec![Node::text("exit 4")])]);
    let err = interpreter.run_program(&program).await.unwrap_err();
    assert_eq!(err.exit_code(), 1);
    assert!(err.to_string().contains("code 4"), "{err}");
}

#[tokio::test]
async fn loaded_values_carry_file_taint() {
    use mlld_core::security::TaintSource;
    let dir = tempfile::tempdir().unwrap();
    let (interpreter, _) = interp_in(dir.path());
    std::fs::write(dir.path().join("x.md"), "content").unwrap();
    let program = Program::from_directives(vec![Directive::new(DirectiveKind::Var)
        .value("identifier", vec![Node::text("doc")])
        .value("value", vec![Node::load("x.md")])]);
    interpreter.run_program(&program).await.unwrap();
    let doc = interpreter.env().get_variable("doc").unwrap();
    assert!(doc.value.security.has_taint(&TaintSource::File));
    assert!(doc
        .value
        .security
        .sources
        .iter()
        .any(|s| s.starts_with("file:")));
}

#[tokio::test]
async fn guard_for_label_transforms_arguments() {
    let dir = tempfile::tempdir().unwrap();
    let (interpreter, buffer) = interp_in(dir.path());
    let program = Program::from_directives(vec![
        // exe @echo(x) = template "@x"
        Directive::new(DirectiveKind::Exe)
            .value("identifier", vec![Node::text("echo")])
            .value("params", vec![Node::text("x")])
            .value("template", vec![Node::var("x")]),
        // guard @scrub for pii = "allow [redacted]"
        Directive::new(DirectiveKind::Guard)
            .value("name", vec![Node::text("scrub")])
            .meta_attr("form", serde_json::json!("for"))
            .meta_attr("label", serde_json::json!("pii"))
            .value("body", vec![Node::text("allow [redacted]")]),
        // var @ssn = "123-45-6789" with labels [pii]
        Directive::new(DirectiveKind::Var)
            .value("identifier", vec![Node::text("ssn")])
            .value("value", vec![Node::text("123-45-6789")])
            .meta_attr("labels", serde_json::json!(["pii"])),
        // show @echo(@ssn)
        Directive::new(DirectiveKind::Show).value(
            "value",
            vec![Node::exec(
                mlld_core::ast::ExecInvocation::new("echo").arg(vec![Node::var("ssn")]),
            )],
        ),
    ]);
    interpreter.run_program(&program).await.unwrap();
    assert_eq!(buffer.stdout(), "[redacted]\n");
}

#[tokio::test]
async fn circular_imports_are_detected() {
    let dir = tempfile::tempdir().unwrap();
    let a_path = dir.path().join("a.json");
    let b_path = dir.path().join("b.json");

    let a = Program {
        file_path: Some(a_path.display().to_string()),
        nodes: vec![mlld_core::ast::ProgramNode::Directive(
            Directive::new(DirectiveKind::Import).value("path", vec![Node::text("b.json")]),
        )],
        ..Program::default()
    };
    let b = Program {
        file_path: Some(b_path.display().to_string()),
        nodes: vec![mlld_core::ast::ProgramNode::Directive(
            Directive::new(DirectiveKind::Import).value("path", vec![Node::text("a.json")]),
        )],
        ..Program::default()
    };
    std::fs::write(&a_path, serde_json::to_string(&a).unwrap()).unwrap();
    std::fs::write(&b_path, serde_json::to_string(&b).unwrap()).unwrap();

    let (interpreter, _) = interp_in(dir.path());
    let err = interpreter.run_program(&a).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::CircularImport);
}

#[tokio::test]
async fn import_brings_module_bindings_into_scope() {
    let dir = tempfile::tempdir().unwrap();
    let module_path = dir.path().join("module.json");
    let module = Program {
        file_path: Some(module_path.display().to_string()),
        nodes: vec![
            mlld_core::ast::ProgramNode::Directive(
                Directive::new(DirectiveKind::Var)
                    .value("identifier", vec![Node::text("greeting")])
                    .value("value", vec![Node::text("hello from module")]),
            ),
            mlld_core::ast::ProgramNode::Directive(
                Directive::new(DirectiveKind::Export)
                    .value("names", vec![Node::text("greeting")]),
            ),
        ],
        ..Program::default()
    };
    std::fs::write(&module_path, serde_json::to_string(&module).unwrap()).unwrap();

    let (interpreter, buffer) = interp_in(dir.path());
    let program = Program::from_directives(vec![
        Directive::new(DirectiveKind::Import)
            .value("path", vec![Node::text("module.json")]),
        Directive::new(DirectiveKind::Show).value("value", vec![Node::var("greeting")]),
    ]);
    interpreter.run_program(&program).await.unwrap();
    assert_eq!(buffer.stdout(), "hello from module\n");
}
