// Integration tests for the operator CLI binary. Only commands that need
// no reputation API are exercised here.

use std::process::Command;
use tempfile::TempDir;

fn resistnet() -> Command {
    Command::new(env!("CARGO_BIN_EXE_resistnet"))
}

#[test]
fn test_cli_help() {
    let output = resistnet().arg("--help").output().unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in ["score", "stamp", "permissions", "init-config", "version"] {
        assert!(stdout.contains(command), "help is missing {}", command);
    }
}

#[test]
fn test_cli_version() {
    let output = resistnet().arg("version").output().unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_cli_init_config() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");

    let output = resistnet()
        .args(["init-config", "--config"])
        .arg(&path)
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(path.exists());

    // Second run refuses to clobber the file
    let output = resistnet()
        .args(["init-config", "--config"])
        .arg(&path)
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[test]
fn test_cli_score_without_credentials_fails() {
    let dir = TempDir::new().unwrap();
    let output = resistnet()
        .args(["score", "0xalice", "--config"])
        .arg(dir.path().join("none.toml"))
        .env_remove("PASSPORT_API_KEY")
        .env_remove("PASSPORT_SCORER_ID")
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("not set"));
}
