use std::io::Write;
use std::process::{Command, Output};

use tempfile::NamedTempFile;

fn ndengine(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_ndengine"))
        .args(args)
        .env_remove("RUST_LOG")
        .env_remove("NDENGINE_CPU_WORKER_THREADS")
        .env_remove("NDENGINE_FAILURE_POLICY")
        .output()
        .expect("failed to run ndengine")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn demo_prints_each_stage() {
    let output = ndengine(&["--log-level", "warn", "demo"]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let lines: Vec<String> = stdout(&output).lines().map(str::to_string).collect();
    assert_eq!(
        lines,
        vec!["[1.0, 2.0, 3.0, 4.0, 5.0]", "[2.0, 3.0, 4.0, 5.0, 6.0]", "[3.0, 4.0, 5.0, 6.0, 7.0]"]
    );
}

#[test]
fn config_show_layers_file_and_flags() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        "[engine]\ncpu_worker_threads = 3\nbulk_size = 4\nfailure_policy = \"halt_lane\""
    )
    .unwrap();
    let path = file.path().to_str().unwrap();

    let output = ndengine(&["--config", path, "config", "show", "--format", "json"]);
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(json["engine"]["cpu_worker_threads"], 3);
    assert_eq!(json["engine"]["bulk_size"], 4);
    assert_eq!(json["engine"]["failure_policy"], "halt_lane");

    let output =
        ndengine(&["--config", path, "--threads", "7", "config", "show", "--format", "json"]);
    let json: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(json["engine"]["cpu_worker_threads"], 7);
}

#[test]
fn environment_overrides_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "[engine]\nbulk_size = 4").unwrap();
    let output = Command::new(env!("CARGO_BIN_EXE_ndengine"))
        .args(["--config", file.path().to_str().unwrap(), "config", "show"])
        .env("NDENGINE_BULK_SIZE", "9")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(stdout(&output).contains("bulk_size = 9"));
}

#[test]
fn default_config_file_is_picked_up_from_working_dir() {
    let dir = tempfile::tempdir().unwrap();
    let toml = "[engine]\ncopy_worker_threads = 5\n";
    std::fs::write(dir.path().join("ndengine.toml"), toml).unwrap();
    let output = Command::new(env!("CARGO_BIN_EXE_ndengine"))
        .args(["config", "show"])
        .current_dir(dir.path())
        .env_remove("NDENGINE_COPY_WORKER_THREADS")
        .output()
        .unwrap();
    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("[engine]"));
    assert!(text.contains("copy_worker_threads = 5"));
}

#[test]
fn invalid_config_is_reported() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "[engine]\ncpu_worker_threads = 0").unwrap();
    let output = ndengine(&["--config", file.path().to_str().unwrap(), "config", "show"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("cpu_worker_threads"));

    let output = ndengine(&["--config", "/nonexistent/ndengine.toml", "config", "show"]);
    assert!(!output.status.success());
}

#[test]
fn stress_run_reports_no_violations() {
    let output = ndengine(&[
        "--log-level",
        "warn",
        "--threads",
        "4",
        "stress",
        "--ops",
        "500",
        "--vars",
        "4",
        "--readers",
        "2",
        "--max-delay-us",
        "50",
        "--seed",
        "7",
        "--json",
    ]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let report: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(report["violations"], 0);
    assert_eq!(report["failed"], 0);
    assert_eq!(report["seed"], 7);
}
