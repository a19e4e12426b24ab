//! The `nanoalign` binary: stdout carries responses, logs go to stderr.

use std::process::Command;

fn nanoalign() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_nanoalign"));
    cmd.env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_json_logs_stay_off_stdout() {
    let root = tempfile::tempdir().unwrap();
    let output = nanoalign()
        .current_dir(root.path())
        .args(["--json-logs", "eval", "--model-dir", "tiny"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stdout.contains("Prompt: Predict next word: 'Where is the'\nResponse: "));
    assert!(
        stdout.lines().all(|line| !line.starts_with("{\"")),
        "JSON log line on stdout:\n{}",
        stdout
    );
    assert!(stderr.lines().any(|line| line.starts_with("{\"")), "{}", stderr);
}

#[test]
fn test_init_config_writes_loadable_toml() {
    let root = tempfile::tempdir().unwrap();
    let path = root.path().join("nanoalign.toml");
    let status = nanoalign()
        .args(["init-config", "--output"])
        .arg(&path)
        .status()
        .unwrap();
    assert!(status.success());
    let config = nanoalign_core::PipelineConfig::from_file(&path).unwrap();
    assert_eq!(config.model.name, nanoalign_core::PipelineConfig::default().model.name);
}
