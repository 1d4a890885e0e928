use assert_cmd::Command;
use lua_dec_rs::chunk::{Constant, Instruction, Operand, Prototype, Upvalue};
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn hello_chunk() -> Prototype {
    let mut proto = Prototype::new(
        vec![
            Instruction::GetTabUp {
                a: 0,
                upvalue: 0,
                key: Operand::Constant(0),
            },
            Instruction::LoadK { a: 1, constant: 1 },
            Instruction::Call {
                a: 0,
                args: Some(1),
                results: Some(0),
            },
            Instruction::Return { a: 0, count: Some(0) },
        ],
        vec![
            Constant::String("print".into()),
            Constant::String("hi".into()),
        ],
        2,
    );
    proto.upvalues = vec![Upvalue {
        in_stack: true,
        index: 0,
        name: Some("_ENV".to_string()),
    }];
    proto
}

fn broken_chunk() -> Prototype {
    let mut proto = Prototype::new(
        vec![
            Instruction::Jmp { offset: 1 },
            Instruction::LoadInt { a: 0, value: 1 },
            Instruction::Return { a: 0, count: Some(0) },
        ],
        vec![],
        1,
    );
    proto.upvalues = hello_chunk().upvalues;
    proto
}

/// `f = function() return 7 end`
fn closure_chunk() -> Prototype {
    let mut proto = Prototype::new(
        vec![
            Instruction::Closure { a: 0, proto: 0 },
            Instruction::SetTabUp {
                upvalue: 0,
                key: Operand::Constant(0),
                value: Operand::Register(0),
            },
            Instruction::Return { a: 0, count: Some(0) },
        ],
        vec![Constant::String("f".into())],
        1,
    );
    proto.upvalues = hello_chunk().upvalues;
    proto.prototypes.push(Prototype::new(
        vec![
            Instruction::LoadInt { a: 0, value: 7 },
            Instruction::Return { a: 0, count: Some(1) },
            Instruction::Return { a: 0, count: Some(0) },
        ],
        vec![],
        1,
    ));
    proto
}

fn write_chunk(dir: &Path, name: &str, proto: &Prototype) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, serde_json::to_string(proto).unwrap()).unwrap();
    path
}

fn bin() -> Command {
    Command::cargo_bin("lua-dec-rs").unwrap()
}

#[test]
fn test_decompile_to_stdout() {
    let dir = TempDir::new().unwrap();
    let input = write_chunk(dir.path(), "hello.json", &hello_chunk());
    bin()
        .arg("decompile")
        .arg(&input)
        .assert()
        .success()
        .stdout(predicate::str::contains("print(\"hi\")"));
}

#[test]
fn test_decompile_to_file() {
    let dir = TempDir::new().unwrap();
    let input = write_chunk(dir.path(), "hello.json", &hello_chunk());
    let output = dir.path().join("hello.lua");
    bin()
        .arg("decompile")
        .arg(&input)
        .arg("-o")
        .arg(&output)
        .arg("--sequential")
        .assert()
        .success();
    let text = std::fs::read_to_string(&output).unwrap();
    assert_eq!(text, "print(\"hi\")\n");
}

#[test]
fn test_failures_are_warnings_unless_strict() {
    let dir = TempDir::new().unwrap();
    let input = write_chunk(dir.path(), "broken.json", &broken_chunk());
    bin()
        .arg("decompile")
        .arg(&input)
        .assert()
        .success()
        .stderr(predicate::str::contains("warning: main"));
    bin()
        .arg("decompile")
        .arg(&input)
        .arg("--strict")
        .assert()
        .failure();
}

#[test]
fn test_tags_for_lua54() {
    bin()
        .args(["tags", "--version", "5.4"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"long_string\""));
}

#[test]
fn test_tags_reject_unknown_version() {
    bin().args(["tags", "--version", "6.0"]).assert().failure();
}

#[test]
fn test_blocks_dump() {
    let dir = TempDir::new().unwrap();
    let input = write_chunk(dir.path(), "hello.json", &hello_chunk());
    bin()
        .arg("blocks")
        .arg(&input)
        .assert()
        .success()
        .stdout(predicate::str::contains("-- main\nfunction [0, 4)"));
}

#[test]
fn test_decompile_single_function() {
    let dir = TempDir::new().unwrap();
    let input = write_chunk(dir.path(), "closure.json", &closure_chunk());
    bin()
        .args(["decompile", "--function", "main/0", "--indent", "2"])
        .arg(&input)
        .assert()
        .success()
        .stdout("function main_0()\n  return 7\nend\n");
    bin()
        .args(["decompile", "--function", "main/5"])
        .arg(&input)
        .assert()
        .failure()
        .stderr(predicate::str::contains("no function main/5"));
}

#[test]
fn test_blocks_dot_graph() {
    let dir = TempDir::new().unwrap();
    let input = write_chunk(dir.path(), "hello.json", &hello_chunk());
    bin()
        .args(["blocks", "--dot"])
        .arg(&input)
        .assert()
        .success()
        .stdout(predicate::str::contains("// main\ndigraph {"));
    bin()
        .args(["blocks", "--dot", "--json"])
        .arg(&input)
        .assert()
        .failure();
}

#[test]
fn test_blocks_reject_malformed_function_path() {
    let dir = TempDir::new().unwrap();
    let input = write_chunk(dir.path(), "hello.json", &hello_chunk());
    bin()
        .args(["blocks", "--function", "main/x"])
        .arg(&input)
        .assert()
        .failure()
        .stderr(predicate::str::contains("malformed function path"));
}

#[test]
fn test_missing_input_fails() {
    bin()
        .args(["decompile", "does-not-exist.json"])
        .assert()
        .failure();
}
