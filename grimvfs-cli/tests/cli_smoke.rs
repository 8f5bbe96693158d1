use assert_cmd::prelude::*;
use assert_fs::prelude::*;
use predicates::prelude::*;
use std::process::Command;

fn grimvfs() -> Command {
    Command::cargo_bin("grimvfs").unwrap()
}

#[test]
fn pack_list_extract_roundtrip() {
    let td = assert_fs::TempDir::new().unwrap();
    let data = td.child("data");
    data.create_dir_all().unwrap();
    data.child("hello.txt").write_str("hello from the cli").unwrap();
    data.child("sub/nested.bin").write_binary(&[7u8; 4096]).unwrap();

    // pack
    grimvfs()
        .current_dir(td.path())
        .args(["pack", "data", "out.grim", "--compress", "zlib"])
        .assert()
        .success()
        .stdout(predicate::str::contains("2 entries"));

    // list
    grimvfs()
        .current_dir(td.path())
        .args(["list", "out.grim"])
        .assert()
        .success()
        .stdout(predicate::str::contains("/hello.txt"))
        .stdout(predicate::str::contains("/sub/nested.bin"));

    // info
    grimvfs()
        .current_dir(td.path())
        .args(["info", "out.grim"])
        .assert()
        .success()
        .stdout(predicate::str::contains("mode:            Archive"));

    // extract and compare
    grimvfs()
        .current_dir(td.path())
        .args(["extract", "out.grim", "restored"])
        .assert()
        .success();
    td.child("restored/hello.txt").assert("hello from the cli");
    td.child("restored/sub/nested.bin").assert(&[7u8; 4096][..]);
}

#[test]
fn manifest_verify_detects_tampering() {
    let td = assert_fs::TempDir::new().unwrap();
    let data = td.child("data");
    data.create_dir_all().unwrap();
    data.child("a.txt").write_str("original").unwrap();

    grimvfs()
        .current_dir(td.path())
        .args(["manifest", "data", "files.grim"])
        .assert()
        .success();

    grimvfs()
        .current_dir(td.path())
        .args(["verify", "files.grim", "data"])
        .assert()
        .success()
        .stdout(predicate::str::contains("OK"));

    data.child("a.txt").write_str("tampered").unwrap();
    grimvfs()
        .current_dir(td.path())
        .args(["verify", "files.grim", "data"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("1 mismatched"));
}

#[test]
fn convert_then_verify_extracted_tree() {
    let td = assert_fs::TempDir::new().unwrap();
    let data = td.child("data");
    data.create_dir_all().unwrap();
    data.child("x.bin").write_binary(b"payload bytes").unwrap();

    grimvfs()
        .current_dir(td.path())
        .args(["pack", "data", "full.grim"])
        .assert()
        .success();
    grimvfs()
        .current_dir(td.path())
        .args(["convert", "full.grim", "slim.grim"])
        .assert()
        .success();
    grimvfs()
        .current_dir(td.path())
        .args(["extract", "full.grim", "restored"])
        .assert()
        .success();
    grimvfs()
        .current_dir(td.path())
        .args(["verify", "slim.grim", "restored"])
        .assert()
        .success()
        .stdout(predicate::str::contains("OK"));
}

#[test]
fn encrypted_index_needs_the_key_for_listing() {
    let td = assert_fs::TempDir::new().unwrap();
    let data = td.child("data");
    data.create_dir_all().unwrap();
    data.child("secret.txt").write_str("hush").unwrap();

    grimvfs()
        .current_dir(td.path())
        .args(["pack", "data", "sealed.grim", "--xor-key", "opensesame"])
        .assert()
        .success();

    // Without the key listing fails; hashes remain visible.
    grimvfs()
        .current_dir(td.path())
        .args(["list", "sealed.grim"])
        .assert()
        .failure();
    grimvfs()
        .current_dir(td.path())
        .args(["list", "sealed.grim", "--hashes"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0x"));

    grimvfs()
        .current_dir(td.path())
        .args(["list", "sealed.grim", "--xor-key", "opensesame"])
        .assert()
        .success()
        .stdout(predicate::str::contains("/secret.txt"));
}

#[test]
fn to_json_dumps_entries() {
    let td = assert_fs::TempDir::new().unwrap();
    let data = td.child("data");
    data.create_dir_all().unwrap();
    data.child("doc.txt").write_str("json me").unwrap();

    grimvfs()
        .current_dir(td.path())
        .args(["manifest", "data", "files.grim"])
        .assert()
        .success();
    grimvfs()
        .current_dir(td.path())
        .args(["to-json", "files.grim", "files.json"])
        .assert()
        .success();

    let json = std::fs::read_to_string(td.child("files.json").path()).unwrap();
    let doc: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(doc["mode"], "Manifest");
    assert_eq!(doc["entry_count"], 1);
    assert_eq!(doc["entries"][0]["path"], "/doc.txt");
}
