//! Option-surface tests for the `tar2sqfs` binary itself, driven through `assert_cmd`.

mod common;

use assert_cmd::Command;

#[test]
fn rejects_non_power_of_two_block_size() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.sqfs");

    Command::cargo_bin("tar2sqfs")
        .unwrap()
        .arg(&out)
        .arg("--block-size")
        .arg("5000")
        .write_stdin(common::empty_tar())
        .assert()
        .failure();
}

#[test]
fn writes_a_valid_image_from_stdin() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.sqfs");

    Command::cargo_bin("tar2sqfs")
        .unwrap()
        .arg(&out)
        .write_stdin(common::tar_with_files(&[("a.txt", b"hello")]))
        .assert()
        .success();

    let sb = common::read_superblock(&std::fs::read(&out).unwrap());
    assert_eq!(sb.magic, 0x73717368);
}

#[test]
fn refuses_to_overwrite_without_force() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.sqfs");
    std::fs::write(&out, b"existing").unwrap();

    Command::cargo_bin("tar2sqfs")
        .unwrap()
        .arg(&out)
        .write_stdin(common::tar_with_files(&[("a.txt", b"hello")]))
        .assert()
        .failure();

    Command::cargo_bin("tar2sqfs")
        .unwrap()
        .arg(&out)
        .arg("--force")
        .write_stdin(common::tar_with_files(&[("a.txt", b"hello")]))
        .assert()
        .success();
}
