use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::str::contains;
use tempfile::tempdir;

fn heidi() -> Command {
    Command::cargo_bin("heidi").expect("binary")
}

/// Drive a collect run on an empty dataset and return the run root.
fn run_collect(out_dir: &Path, run_id: &str) -> std::path::PathBuf {
    heidi()
        .args(["run", "--mode", "collect"])
        .env("OUT_DIR", out_dir)
        .env("RUN_ID", run_id)
        .env("ROUNDS", "1")
        .env("HEIDI_MOCK_SUBPROCESSES", "1")
        .assert()
        .success()
        .stdout(contains("finished in state IDLE"));
    out_dir.join(run_id)
}

#[test]
fn run_collect_parks_idle_and_writes_artifacts() {
    let td = tempdir().expect("tempdir");
    let run_root = run_collect(td.path(), "cli-collect");

    assert!(run_root.join("events.jsonl").exists());
    assert!(run_root.join("state.json").exists());
    assert!(run_root.join("pending").is_dir());
    assert!(run_root.join("actions").is_dir());
}

#[test]
fn run_refuses_run_id_collision() {
    let td = tempdir().expect("tempdir");
    run_collect(td.path(), "cli-collide");

    heidi()
        .args(["run", "--mode", "collect"])
        .env("OUT_DIR", td.path())
        .env("RUN_ID", "cli-collide")
        .env("HEIDI_MOCK_SUBPROCESSES", "1")
        .assert()
        .failure()
        .stderr(contains("collision"));
}

#[test]
fn replay_verifies_a_fresh_journal() {
    let td = tempdir().expect("tempdir");
    let run_root = run_collect(td.path(), "cli-replay");

    heidi()
        .args([
            "replay",
            "--journal",
            run_root.join("events.jsonl").to_str().expect("utf8"),
            "--run-id",
            "cli-replay",
        ])
        .assert()
        .success()
        .stdout(contains("final_hash:"))
        .stdout(contains("manifest:    none"));
}

#[test]
fn replay_exits_nonzero_on_tampered_journal() {
    let td = tempdir().expect("tempdir");
    let run_root = run_collect(td.path(), "cli-tamper");

    let journal = run_root.join("events.jsonl");
    let content = fs::read_to_string(&journal).expect("read");
    let tampered = content.replacen("pipeline starting", "pipeline starring", 1);
    assert_ne!(content, tampered);
    fs::write(&journal, tampered).expect("write");

    heidi()
        .args([
            "replay",
            "--journal",
            journal.to_str().expect("utf8"),
            "--run-id",
            "cli-tamper",
        ])
        .assert()
        .code(2)
        .stderr(contains("chain break"));
}

#[test]
fn status_prints_the_snapshot() {
    let td = tempdir().expect("tempdir");
    let run_root = run_collect(td.path(), "cli-status");

    heidi()
        .args(["status", "--root", run_root.to_str().expect("utf8")])
        .assert()
        .success()
        .stdout(contains("\"status\":\"IDLE\""))
        .stdout(contains("cli-status"));
}

#[test]
fn train_now_sets_the_latch() {
    let td = tempdir().expect("tempdir");
    let run_root = run_collect(td.path(), "cli-latch");

    heidi()
        .args([
            "train-now",
            "--root",
            run_root.to_str().expect("utf8"),
            "--run-id",
            "cli-latch",
        ])
        .assert()
        .success();

    assert!(run_root.join("actions/train_now.cli-latch").exists());
    assert!(run_root.join("actions/train_now.latest").exists());
}

#[test]
fn stop_and_pause_latches_round_trip() {
    let td = tempdir().expect("tempdir");
    let run_root = run_collect(td.path(), "cli-latches");
    let root = run_root.to_str().expect("utf8");

    heidi().args(["stop", "--root", root]).assert().success();
    assert!(run_root.join("actions/stop_requested").exists());

    heidi().args(["pause", "--root", root]).assert().success();
    assert!(run_root.join("actions/pause_requested").exists());

    heidi().args(["resume", "--root", root]).assert().success();
    assert!(!run_root.join("actions/pause_requested").exists());
}

#[test]
fn doctor_fails_without_signing_key() {
    let td = tempdir().expect("tempdir");
    heidi()
        .arg("doctor")
        .env("OUT_DIR", td.path())
        .env_remove("HEIDI_SIGNING_KEY")
        .env_remove("HEIDI_KEYSTORE_PATH")
        .assert()
        .failure()
        .stdout(contains("signing_key"))
        .stdout(contains("not ready"));
}

#[test]
fn doctor_passes_with_key_and_keystore() {
    let td = tempdir().expect("tempdir");
    let keystore = td.path().join("keystore.json");
    fs::write(&keystore, "{}").expect("write keystore");

    heidi()
        .arg("doctor")
        .env("OUT_DIR", td.path())
        .env("HEIDI_SIGNING_KEY", "cli-secret")
        .env("HEIDI_KEYSTORE_PATH", keystore.to_str().expect("utf8"))
        .assert()
        .success()
        .stdout(contains("environment is ready"));
}

#[test]
fn run_rejects_unknown_mode() {
    let td = tempdir().expect("tempdir");
    heidi()
        .args(["run", "--mode", "yolo"])
        .env("OUT_DIR", td.path())
        .env("RUN_ID", "cli-badmode")
        .assert()
        .failure()
        .stderr(contains("unknown mode"));
}

#[test]
fn full_run_with_key_completes_and_replay_verifies_manifest() {
    let td = tempdir().expect("tempdir");
    let out = td.path();

    // An empty dataset exercises the train-skip path end to end.
    heidi()
        .args(["run", "--mode", "full"])
        .env("OUT_DIR", out)
        .env("RUN_ID", "cli-full")
        .env("ROUNDS", "1")
        .env("HEIDI_MOCK_SUBPROCESSES", "1")
        .env("HEIDI_SIGNING_KEY", "cli-full-secret")
        .assert()
        .success()
        .stdout(contains("finished in state COMPLETED"));

    let journal = out.join("cli-full/events.jsonl");
    let content = fs::read_to_string(&journal).expect("read");
    assert!(content.contains("stage_skip"));

    heidi()
        .args(["replay", "--journal", journal.to_str().expect("utf8")])
        .env("HEIDI_SIGNING_KEY", "cli-full-secret")
        .assert()
        .success();
}
