// SPDX-License-Identifier: MIT OR Apache-2.0
//! CLI exit-code contract: 0 ok, 1 runtime error, 2 validation error.

use assert_cmd::Command;
use mlld_core::ast::{Directive, DirectiveKind, Node, Program};
use predicates::prelude::*;

fn write_program(dir: &std::path::Path, name: &str, program: &Program) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, serde_json::to_string(program).unwrap()).unwrap();
    path
}

#[test]
fn run_prints_program_output_and_exits_zero() {
    let dir = tempfile::tempdir().unwrap();
    let program = Program::from_directives(vec![Directive::new(DirectiveKind::Show)
        .value("value", vec![Node::text("hello")])]);
    let path = write_program(dir.path(), "ok.json", &program);

    Command::cargo_bin("mlld")
        .unwrap()
        .arg("run")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("hello"));
}

#[test]
fn bare_file_argument_is_run_shorthand() {
    let dir = tempfile::tempdir().unwrap();
    let program = Program::from_directives(vec![Directive::new(DirectiveKind::Show)
        .value("value", vec![Node::text("shorthand")])]);
    let path = write_program(dir.path(), "ok.json", &program);

    Command::cargo_bin("mlld")
        .unwrap()
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("shorthand"));
}

#[test]
fn validation_errors_exit_two() {
    let dir = tempfile::tempdir().unwrap();
    let program = Program::from_directives(vec![Directive::new(DirectiveKind::Exe)
        .value("identifier", vec![Node::text("bad")])
        .value("command", vec![Node::text("ls | wc -l")])]);
    let path = write_program(dir.path(), "bad.json", &program);

    Command::cargo_bin("mlld")
        .unwrap()
        .arg("run")
        .arg(&path)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("MLD-V003"));
}

#[test]
fn runtime_errors_exit_one() {
    let dir = tempfile::tempdir().unwrap();
    let program = Program::from_directives(vec![Directive::new(DirectiveKind::Run)
        .value("command", vec![Node::text("exit 9")])]);
    let path = write_program(dir.path(), "fail.json", &program);

    Command::cargo_bin("mlld")
        .unwrap()
        .arg("run")
        .arg(&path)
        .assert()
        .code(1);
}

#[test]
fn malformed_program_files_exit_two() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.json");
    std::fs::write(&path, "this is not a program").unwrap();

    Command::cargo_bin("mlld")
        .unwrap()
        .arg("validate")
        .arg(&path)
        .assert()
        .code(2);
}

#[test]
fn validate_accepts_a_well_formed_program() {
    let dir = tempfile::tempdir().unwrap();
    let program = Program::from_directives(vec![Directive::new(DirectiveKind::Show)
        .value("value", vec![Node::text("x")])]);
    let path = write_program(dir.path(), "ok.json", &program);

    Command::cargo_bin("mlld")
        .unwrap()
        .arg("validate")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("ok"));
}

#[test]
fn output_flag_writes_the_file_instead_of_stdout() {
    let dir = tempfile::tempdir().unwrap();
    let program = Program::from_directives(vec![Directive::new(DirectiveKind::Show)
        .value("value", vec![Node::text("to-file")])]);
    let path = write_program(dir.path(), "ok.json", &program);
    let out = dir.path().join("result.md");

    Command::cargo_bin("mlld")
        .unwrap()
        .arg("run")
        .arg(&path)
        .arg("--output")
        .arg(&out)
        .assert()
        .success();
    let written = std::fs::read_to_string(&out).unwrap();
    assert_eq!(written, "to-file\n");
}
