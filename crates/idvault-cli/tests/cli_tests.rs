use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::{tempdir, TempDir};

/// Config with cheap key derivation so every invocation stays fast.
fn write_config(dir: &TempDir) -> PathBuf {
    write_config_with_autosave(dir, true)
}

fn write_config_with_autosave(dir: &TempDir, autosave: bool) -> PathBuf {
    let path = dir.path().join("idvault.json");
    let config = serde_json::json!({
        "autosave": autosave,
        "kdf": { "memory_kib": 1024, "time_cost": 1, "parallelism": 1 },
        "unlock_deadline_secs": 30
    });
    std::fs::write(&path, serde_json::to_vec(&config).unwrap()).unwrap();
    path
}

fn idvault(config: &Path, store: &Path, passphrase: &str) -> Command {
    let mut cmd = Command::cargo_bin("idvault").unwrap();
    cmd.arg("--config")
        .arg(config)
        .arg("--store")
        .arg(store)
        .env("IDVAULT_PASSPHRASE", passphrase)
        .env_remove("IDVAULT_NEW_PASSPHRASE")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn set_then_get() {
    let dir = tempdir().unwrap();
    let config = write_config(&dir);
    let store = dir.path().join("nested").join("store.bin");

    idvault(&config, &store, "pw1")
        .args(["set", "id1", "alice"])
        .assert()
        .success();
    assert!(store.exists());

    idvault(&config, &store, "pw1")
        .args(["get", "id1"])
        .assert()
        .success()
        .stdout("alice\n");
}

#[test]
fn set_persists_with_autosave_disabled() {
    let dir = tempdir().unwrap();
    let config = write_config_with_autosave(&dir, false);
    let store = dir.path().join("store.bin");

    idvault(&config, &store, "pw1")
        .args(["set", "id1", "alice"])
        .assert()
        .success()
        .stderr(predicate::str::contains("discarded").not());
    idvault(&config, &store, "pw1")
        .args(["set", "id2", "bob"])
        .assert()
        .success();

    idvault(&config, &store, "pw1")
        .args(["get", "id1"])
        .assert()
        .success()
        .stdout("alice\n");
    idvault(&config, &store, "pw1")
        .args(["get", "id2"])
        .assert()
        .success()
        .stdout("bob\n");
}

#[test]
fn wrong_passphrase_exits_3() {
    let dir = tempdir().unwrap();
    let config = write_config(&dir);
    let store = dir.path().join("store.bin");

    idvault(&config, &store, "pw1")
        .args(["set", "id1", "alice"])
        .assert()
        .success();

    idvault(&config, &store, "wrong")
        .args(["get", "id1"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("error"));
}

#[test]
fn corrupt_store_exits_4() {
    let dir = tempdir().unwrap();
    let config = write_config(&dir);
    let store = dir.path().join("store.bin");
    std::fs::write(&store, b"definitely not a store").unwrap();

    idvault(&config, &store, "pw1")
        .arg("list")
        .assert()
        .code(4);
}

#[test]
fn missing_store_for_read_exits_4() {
    let dir = tempdir().unwrap();
    let config = write_config(&dir);
    let store = dir.path().join("absent.bin");

    idvault(&config, &store, "pw1")
        .args(["get", "id1"])
        .assert()
        .code(4)
        .stderr(predicate::str::contains("no store"));
    assert!(!store.exists());
}

#[test]
fn unreachable_network_exits_5_and_writes_nothing() {
    let dir = tempdir().unwrap();
    let config = write_config(&dir);
    let store = dir.path().join("store.bin");

    idvault(&config, &store, "pw1")
        .args([
            "create-identity",
            "--network",
            "testchain",
            "--endpoint",
            "http://127.0.0.1:1",
        ])
        .assert()
        .code(5);

    idvault(&config, &store, "pw1")
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("[]"));
}

#[test]
fn create_show_and_list_identity() {
    let dir = tempdir().unwrap();
    let config = write_config(&dir);
    let store = dir.path().join("store.bin");

    let output = idvault(&config, &store, "pw1")
        .args(["create-identity", "--username", "alice", "--network", "local"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let created: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(created["username"], "alice");
    assert_eq!(created["network_binding"]["network"], "local");
    assert!(created.get("secret_key").is_none());
    let id = created["id"].as_str().unwrap().to_string();

    idvault(&config, &store, "pw1")
        .args(["show", id.as_str()])
        .assert()
        .success()
        .stdout(predicate::str::contains(id.as_str()));

    let output = idvault(&config, &store, "pw1").arg("list").output().unwrap();
    let listed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);
}

#[test]
fn show_rejects_bad_id() {
    let dir = tempdir().unwrap();
    let config = write_config(&dir);
    let store = dir.path().join("store.bin");

    idvault(&config, &store, "pw1")
        .args(["set", "k", "v"])
        .assert()
        .success();
    idvault(&config, &store, "pw1")
        .args(["show", "not-a-uuid"])
        .assert()
        .code(1);
}

#[test]
fn passwd_rekeys_store() {
    let dir = tempdir().unwrap();
    let config = write_config(&dir);
    let store = dir.path().join("store.bin");

    idvault(&config, &store, "pw1")
        .args(["set", "id1", "alice"])
        .assert()
        .success();
    idvault(&config, &store, "pw1")
        .arg("passwd")
        .env("IDVAULT_NEW_PASSPHRASE", "pw2")
        .assert()
        .success();

    idvault(&config, &store, "pw1")
        .args(["get", "id1"])
        .assert()
        .code(3);
    idvault(&config, &store, "pw2")
        .args(["get", "id1"])
        .assert()
        .success()
        .stdout("alice\n");
}
