//! End-to-end tests for the `tosalower` binary.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use tempfile::TempDir;
use tosalower_ir::ops::aten;
use tosalower_ir::{Arg, DType, ExportedProgram, Graph, StateDict, TosaOp, TosaProgram};

fn command(args: &[&str], home: &Path) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_tosalower"));
    command
        .args(args)
        .current_dir(home)
        .env("HOME", home)
        .env_remove("TOSALOWER_CONFIG")
        .env_remove("RUST_LOG");
    command
}

fn tosalower(args: &[&str], home: &Path) -> Output {
    command(args, home).output().unwrap()
}

/// Runs with TOSALOWER_CONFIG pointing at `config`.
fn tosalower_with_config(args: &[&str], home: &Path, config: &Path) -> Output {
    command(args, home).env("TOSALOWER_CONFIG", config).output().unwrap()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn add_relu_program() -> ExportedProgram {
    let mut graph = Graph::new();
    let a = graph.add_input("a", vec![2, 3], DType::Float32);
    let b = graph.add_input("b", vec![2, 3], DType::Float32);
    let add = graph.create_node(
        "add",
        aten::ADD,
        vec![Arg::Value(a), Arg::Value(b)],
        vec![2, 3],
        DType::Float32,
    );
    let sum = add.output();
    graph.push_node(add);
    let relu = graph.create_node(
        "relu",
        aten::RELU,
        vec![Arg::Value(sum)],
        vec![2, 3],
        DType::Float32,
    );
    let y = relu.output();
    graph.push_node(relu);
    graph.add_output(y);
    ExportedProgram::new(graph, StateDict::new())
}

#[test]
fn test_compile_writes_tosa_program() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("model.json");
    let out = dir.path().join("model.tosa.json");
    fs::write(&input, add_relu_program().to_json_pretty().unwrap()).unwrap();

    let output = tosalower(
        &[
            "--no-config",
            "compile",
            input.to_str().unwrap(),
            "-s",
            "TOSA-1.0+FP",
            "-o",
            out.to_str().unwrap(),
            "--validate-each-pass",
        ],
        dir.path(),
    );
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let tosa: TosaProgram = serde_json::from_str(&fs::read_to_string(&out).unwrap()).unwrap();
    assert_eq!(tosa.spec.to_string(), "TOSA-1.0+FP");
    assert_eq!(tosa.inputs, vec!["a", "b"]);
    assert_eq!(tosa.count(TosaOp::Add), 1);
    assert_eq!(tosa.outputs.len(), 1);
}

#[test]
fn test_compile_reports_invalid_spec() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("model.json");
    fs::write(&input, add_relu_program().to_json_pretty().unwrap()).unwrap();

    let output = tosalower(
        &["--no-config", "--no-color", "compile", input.to_str().unwrap(), "-s", "TOSA-9"],
        dir.path(),
    );
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Invalid target specification"));
}

#[test]
fn test_pipeline_lists_passes() {
    let dir = TempDir::new().unwrap();
    let output = tosalower(&["--no-color", "pipeline", "TOSA-0.80+BI+u55"], dir.path());
    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("tosa-int-restricted"));
    assert!(text.contains("CastToInt32Pass"));

    let output = tosalower(&["--no-color", "pipeline", "TOSA-1.1+FP"], dir.path());
    assert!(!output.status.success());
}

#[test]
fn test_visitors_are_listed_per_target() {
    let dir = TempDir::new().unwrap();
    let output = tosalower(&["--no-color", "visitors", "TOSA-1.0+FP"], dir.path());
    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains(aten::CONVOLUTION));
    assert!(!text.contains(aten::GELU));
}

#[test]
fn test_config_init_then_show() {
    let dir = TempDir::new().unwrap();
    let init = tosalower(&["--no-color", "config", "init"], dir.path());
    assert!(init.status.success(), "{}", String::from_utf8_lossy(&init.stderr));
    assert!(dir.path().join(".tosalowerrc").is_file());

    let again = tosalower(&["config", "init"], dir.path());
    assert!(!again.status.success());

    let show = tosalower(&["config", "show"], dir.path());
    assert!(stdout(&show).contains("spec = \"TOSA-1.0+INT\""));
}

#[test]
fn test_malformed_config_is_reported() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join(".tosalowerrc"), "spec = [").unwrap();
    let output = tosalower(&["--no-color", "pipeline", "TOSA-1.0+FP"], dir.path());
    assert!(!output.status.success());

    let output = tosalower(&["--no-config", "pipeline", "TOSA-1.0+FP"], dir.path());
    assert!(output.status.success());
}

#[test]
fn test_config_commands_follow_env_override() {
    let dir = TempDir::new().unwrap();
    let custom = dir.path().join("custom.toml");
    fs::write(dir.path().join(".tosalowerrc"), "spec = \"TOSA-1.0+FP\"\n").unwrap();
    fs::write(&custom, "spec = \"TOSA-0.80+MI\"\n").unwrap();

    let path = tosalower_with_config(&["config", "path"], dir.path(), &custom);
    assert!(path.status.success());
    assert_eq!(stdout(&path).trim(), custom.to_str().unwrap());

    let show = tosalower_with_config(&["config", "show"], dir.path(), &custom);
    assert!(stdout(&show).contains("spec = \"TOSA-0.80+MI\""));

    let init = tosalower_with_config(&["config", "init"], dir.path(), &custom);
    assert!(!init.status.success());
}

#[test]
fn test_config_init_writes_env_override_path() {
    let dir = TempDir::new().unwrap();
    let custom = dir.path().join("nested.toml");

    let init = tosalower_with_config(&["--no-color", "config", "init"], dir.path(), &custom);
    assert!(init.status.success(), "{}", String::from_utf8_lossy(&init.stderr));
    assert!(custom.is_file());
    assert!(!dir.path().join(".tosalowerrc").exists());
}

#[test]
fn test_config_show_honours_no_config() {
    let dir = TempDir::new().unwrap();
    let custom = dir.path().join("custom.toml");
    fs::write(&custom, "spec = \"TOSA-0.80+MI\"\n").unwrap();

    let show = tosalower_with_config(&["--no-config", "config", "show"], dir.path(), &custom);
    assert!(show.status.success());
    let text = stdout(&show);
    assert!(text.contains("spec = \"TOSA-1.0+INT\""));
    assert!(!text.contains("TOSA-0.80+MI"));
}
