use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::io::Write;

/// A vmfork invocation confined to `home`, using the file key store so no
/// OS keychain is touched.
fn vmfork(home: &tempfile::TempDir) -> assert_cmd::Command {
    let mut cmd: assert_cmd::Command = cargo_bin_cmd!("vmfork").into();
    cmd.env("VMFORK_HOME", home.path()).env_remove("RUST_LOG");
    cmd
}

fn home() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let mut f = std::fs::File::create(dir.path().join("config.toml")).unwrap();
    write!(
        f,
        r#"
[secrets]
key_store = "file"
"#
    )
    .unwrap();
    dir
}

#[test]
fn help_works() {
    let home = home();
    vmfork(&home)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Disposable VMs"));
}

#[test]
fn secrets_round_trip_with_scopes() {
    let home = home();
    vmfork(&home)
        .args(["secret", "set", "TOKEN", "global-value"])
        .assert()
        .success();
    vmfork(&home)
        .args(["secret", "set", "TOKEN", "web-value", "--project", "web"])
        .assert()
        .success();

    vmfork(&home)
        .args(["secret", "get", "TOKEN"])
        .assert()
        .success()
        .stdout("global-value\n");
    vmfork(&home)
        .args(["secret", "get", "TOKEN", "-p", "web"])
        .assert()
        .success()
        .stdout("web-value\n");
}

#[test]
fn secret_value_can_come_from_stdin() {
    let home = home();
    vmfork(&home)
        .args(["secret", "set", "MULTI"])
        .write_stdin("line one\nline two\n")
        .assert()
        .success();
    vmfork(&home)
        .args(["secret", "get", "MULTI"])
        .assert()
        .success()
        .stdout("line one\nline two\n");
}

#[test]
fn secret_list_prints_names_only() {
    let home = home();
    for name in ["B_KEY", "A_KEY"] {
        vmfork(&home)
            .args(["secret", "set", name, "hidden-value"])
            .assert()
            .success();
    }
    vmfork(&home)
        .args(["secret", "list"])
        .assert()
        .success()
        .stdout("A_KEY\nB_KEY\n");
    vmfork(&home)
        .args(["--json", "secret", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"A_KEY\"").and(predicate::str::contains("hidden-value").not()));
}

#[test]
fn removed_secret_is_gone() {
    let home = home();
    vmfork(&home)
        .args(["secret", "set", "TOKEN", "x"])
        .assert()
        .success();
    vmfork(&home)
        .args(["secret", "rm", "TOKEN"])
        .assert()
        .success();
    vmfork(&home)
        .args(["secret", "get", "TOKEN"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("secret 'TOKEN' not found"));
}

#[test]
fn secret_names_must_be_shell_identifiers() {
    let home = home();
    vmfork(&home)
        .args(["secret", "set", "NOT-VALID", "x"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("shell identifier"));
}

#[test]
fn deleting_unknown_project_fails() {
    let home = home();
    vmfork(&home)
        .args(["project", "delete", "ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("project 'ghost' not found"));
}

#[test]
fn empty_registry_lists_nothing() {
    let home = home();
    vmfork(&home)
        .args(["task", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No tasks."));
    vmfork(&home)
        .args(["--json", "project", "list"])
        .assert()
        .success()
        .stdout("[]\n");
}

#[test]
fn checkpoint_of_unknown_target_fails() {
    let home = home();
    vmfork(&home)
        .args(["checkpoint", "ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no project or task named 'ghost'"));
}

#[test]
fn missing_explicit_config_shows_error() {
    let home = home();
    vmfork(&home)
        .args(["--config", "/nonexistent/vmfork.toml", "task", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load config"));
}

#[test]
fn unknown_provider_in_config_is_rejected() {
    let home = home();
    std::fs::write(home.path().join("config.toml"), "provider = \"virtualbox\"\n").unwrap();
    vmfork(&home)
        .args(["task", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown provider 'virtualbox'"));
}

#[test]
fn convert_without_a_format_hint_fails() {
    let home = home();
    let src = home.path().join("base.img");
    std::fs::write(&src, "x").unwrap();
    vmfork(&home)
        .args([
            "image",
            "convert",
            src.to_str().unwrap(),
            home.path().join("out.bin").to_str().unwrap(),
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--format"));
}
