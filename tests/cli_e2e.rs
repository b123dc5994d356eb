//! End-to-end CLI tests for the harvester binary.

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Writes a config whose indexes live under `dir`, plus any extra TOML.
fn write_config(dir: &Path, extra: &str) -> std::path::PathBuf {
    let path = dir.join("harvester.toml");
    let body = format!(
        "index_dir = \"{}\"\n\n[retrieval]\npage_delay_ms = 0\nattempt_delay_ms = 0\n{extra}",
        dir.join("indexes").display()
    );
    std::fs::write(&path, body).unwrap();
    path
}

fn harvester(config: &Path) -> Command {
    let mut cmd = Command::cargo_bin("harvester").unwrap();
    cmd.arg("--config").arg(config).env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_binary_help_displays_usage() {
    Command::cargo_bin("harvester")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Retrieve and deduplicate images"));
}

#[test]
fn test_binary_version_displays_version() {
    Command::cargo_bin("harvester")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("harvester"));
}

#[test]
fn test_binary_invalid_flag_returns_error() {
    Command::cargo_bin("harvester")
        .unwrap()
        .arg("--invalid-flag")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

#[test]
fn test_processors_lists_builtins() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "");
    harvester(&config)
        .arg("processors")
        .assert()
        .success()
        .stdout(predicate::str::contains("danbooru\tDanbooru\tbuilt-in"))
        .stdout(predicate::str::contains("gelbooru"))
        .stdout(predicate::str::contains("sankaku"));
}

#[test]
fn test_unknown_processor_fails_with_suggestion() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "");
    harvester(&config)
        .args(["retrieve", "cats", "-p", "gelboru"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown processor 'gelboru'"))
        .stderr(predicate::str::contains("did you mean 'gelbooru'"));
}

#[test]
fn test_invalid_config_value_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.toml");
    std::fs::write(&path, "[retrieval]\npage_attempts = 0\n").unwrap();
    harvester(&path)
        .arg("processors")
        .assert()
        .failure()
        .stderr(predicate::str::contains("retrieval.page_attempts"));
}

#[test]
fn test_index_on_fresh_store_is_empty() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "");
    harvester(&config)
        .args(["index", "cats", "-p", "danbooru"])
        .assert()
        .success()
        .stdout(predicate::str::contains("stored = false"))
        .stdout(predicate::str::contains("entries = 0"));
}

#[cfg(unix)]
#[test]
fn test_plugin_retrieval_is_deduplicated_across_runs() {
    let dir = TempDir::new().unwrap();
    let manifest = dir.path().join("plugins.toml");
    std::fs::write(
        &manifest,
        r#"version = "1"

[[processors]]
id = "local"
name = "Local Fixture"
command = "sh"
hosts = ["img.example.org"]
args = ["-c", '''
if [ "$2" = "1" ]; then
  echo '{"status":"ok","items":[{"source":"https://img.example.org/aa01.jpg","hash":"aa01"}]}'
else
  echo '{"status":"ok","items":[]}'
fi
''', "plugin"]
"#,
    )
    .unwrap();
    let config = write_config(dir.path(), "\n[[plugins]]\nmanifest = \"plugins.toml\"\n");

    harvester(&config)
        .arg("processors")
        .assert()
        .success()
        .stdout(predicate::str::contains("local\tLocal Fixture\tplugin"));

    harvester(&config)
        .args(["retrieve", "cats", "-p", "local"])
        .assert()
        .success()
        .stdout(predicate::str::diff("https://img.example.org/aa01.jpg\n"));

    harvester(&config)
        .args(["retrieve", "cats", "-p", "local"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty());

    harvester(&config)
        .args(["index", "cats", "-p", "local", "--entries"])
        .assert()
        .success()
        .stdout(predicate::str::contains("owner = local"))
        .stdout(predicate::str::contains("entries = 1"))
        .stdout(predicate::str::contains("aa01\thttps://img.example.org/aa01.jpg"));
}
