use std::fs;
use std::path::Path;
use assert_cmd::Command;

use predicates::str::contains;
use tempfile::TempDir;

fn filesync_cmd(home: &Path) -> Command {
    let mut cmd = Command::cargo_bin("filesync").expect("filesync binary");
    cmd.env("HOME", home)
        .env("XDG_CONFIG_HOME", home.join(".config"))
        .env("RUST_LOG", "off");
    cmd
}

// ---------------------------------------------------------------------------
// hash-password
// ---------------------------------------------------------------------------

#[test]
fn hash_password_prints_salted_sha256() {
    let home = TempDir::new().expect("home");
    filesync_cmd(home.path())
        .args(["hash-password", "abc"])
        .assert()
        .success()
        .stdout("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad\n");
}

#[test]
fn hash_password_reads_stdin_and_applies_salt() {
    let home = TempDir::new().expect("home");
    let from_arg = filesync_cmd(home.path())
        .args(["hash-password", "--salt", "ab", "c"])
        .output()
        .expect("run");
    filesync_cmd(home.path())
        .args(["hash-password", "--salt", "a"])
        .write_stdin("bc\n")
        .assert()
        .success()
        .stdout(String::from_utf8(from_arg.stdout).expect("utf8"));
}

#[test]
fn empty_password_is_refused() {
    let home = TempDir::new().expect("home");
    filesync_cmd(home.path())
        .args(["hash-password"])
        .write_stdin("\n")
        .assert()
        .failure()
        .stderr(contains("empty password"));
}

// ---------------------------------------------------------------------------
// config-template / check-config
// ---------------------------------------------------------------------------

#[test]
fn server_template_lists_defaults() {
    let home = TempDir::new().expect("home");
    filesync_cmd(home.path())
        .args(["config-template", "server"])
        .assert()
        .success()
        .stdout(contains("0.0.0.0:7425"))
        .stdout(contains("password_salt"))
        .stdout(contains("max_connections_per_user"));
}

#[test]
fn template_is_written_once() {
    let home = TempDir::new().expect("home");
    let out = home.path().join("conf/client.yaml");
    filesync_cmd(home.path())
        .args(["config-template", "client", "--output"])
        .arg(&out)
        .assert()
        .success();
    let written = fs::read_to_string(&out).expect("template");
    assert!(written.contains("reconnect_delay_secs: 10"));

    filesync_cmd(home.path())
        .args(["config-template", "client", "--output"])
        .arg(&out)
        .assert()
        .failure()
        .stderr(contains("already exists"));
}

#[test]
fn check_config_reports_client_settings() {
    let home = TempDir::new().expect("home");
    let root = home.path().join("sync");
    fs::create_dir(&root).expect("root");
    let config = home.path().join("client.yaml");
    fs::write(
        &config,
        format!("login: alice\nroot: {}\n", root.display()),
    )
    .expect("config");

    filesync_cmd(home.path())
        .args(["check-config", "client", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(contains("alice"))
        .stdout(contains("127.0.0.1:7425"));
}

#[test]
fn check_config_rejects_missing_root() {
    let home = TempDir::new().expect("home");
    let config = home.path().join("server.yaml");
    fs::write(&config, "root: /definitely/not/here\n").expect("config");

    filesync_cmd(home.path())
        .args(["check-config", "server", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(contains("unusable root directory"));
}

#[test]
fn default_config_location_is_under_config_dir() {
    let home = TempDir::new().expect("home");
    filesync_cmd(home.path())
        .args(["check-config", "client"])
        .assert()
        .failure()
        .stderr(contains("client.yaml"));
}

// ---------------------------------------------------------------------------
// server / client startup
// ---------------------------------------------------------------------------

#[test]
fn server_with_unusable_root_fails_before_serving() {
    let home = TempDir::new().expect("home");
    let config = home.path().join("server.yaml");
    fs::write(
        &config,
        format!(
            "listen: 127.0.0.1:0\nroot: {}\nstaging: {}\ncatalog: {}\n",
            home.path().join("missing").display(),
            home.path().join("staging").display(),
            home.path().join("catalog.json").display(),
        ),
    )
    .expect("config");

    filesync_cmd(home.path())
        .args(["server", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(contains("server exited with error"));
}

#[test]
fn client_with_unreadable_config_fails() {
    let home = TempDir::new().expect("home");
    filesync_cmd(home.path())
        .args(["client", "--config"])
        .arg(home.path().join("nope.yaml"))
        .assert()
        .failure()
        .stderr(contains("client exited with error"));
}
