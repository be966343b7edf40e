//! Smoke tests for the binary's CLI surface. These exercise only clap's
//! argument parsing path (`--help`, missing-argument errors), which exits
//! before any queue/store connection is attempted, so they need no live
//! infrastructure.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn help_lists_all_subcommands() {
    Command::cargo_bin("ci-sentinel")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("parser-worker"))
        .stdout(predicate::str::contains("detector-worker"))
        .stdout(predicate::str::contains("detector-api"))
        .stdout(predicate::str::contains("train"));
}

#[test]
fn train_without_csv_path_is_rejected_by_clap() {
    Command::cargo_bin("ci-sentinel")
        .unwrap()
        .arg("train")
        .assert()
        .failure()
        .stderr(predicate::str::contains("csv_path").or(predicate::str::contains("required")));
}

#[test]
fn unknown_subcommand_is_rejected() {
    Command::cargo_bin("ci-sentinel")
        .unwrap()
        .arg("not-a-real-subcommand")
        .assert()
        .failure();
}
