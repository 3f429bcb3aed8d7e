use assert_cmd::Command;
use predicates::prelude::*;

/// Minimal encampment on disk: marker config plus one registered warband.
fn scaffold() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("warchief")).unwrap();
    std::fs::write(
        dir.path().join("warchief/encampment.json"),
        r#"{"name": "the-wastes"}"#,
    )
    .unwrap();
    std::fs::write(
        dir.path().join("warchief/warbands.json"),
        r#"{"warbands": [{"name": "horde"}]}"#,
    )
    .unwrap();
    dir
}

fn hd(dir: &tempfile::TempDir) -> Command {
    let mut cmd = Command::cargo_bin("hd").unwrap();
    cmd.current_dir(dir.path());
    for key in [
        "HD_ROLE",
        "HD_WARBAND",
        "HD_RAIDER",
        "HD_CLAN",
        "HD_ENCAMPMENT",
        "HD_ROLE_HOME",
    ] {
        cmd.env_remove(key);
    }
    cmd
}

#[test]
fn help_lists_core_commands() {
    let mut cmd = Command::cargo_bin("hd").unwrap();
    cmd.arg("--help");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("charge"))
        .stdout(predicate::str::contains("callbacks"))
        .stdout(predicate::str::contains("shaman"));
}

#[test]
fn charge_requires_a_spec() {
    let mut cmd = Command::cargo_bin("hd").unwrap();
    cmd.arg("charge");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("required arguments were not provided"));
}

#[test]
fn whoami_outside_encampment_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mut cmd = Command::cargo_bin("hd").unwrap();
    cmd.current_dir(dir.path());
    cmd.env_remove("HD_ENCAMPMENT");
    cmd.env_remove("HD_ROLE");
    cmd.arg("whoami");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("not inside an encampment"));
}

#[test]
fn whoami_at_root_is_warchief() {
    let dir = scaffold();
    hd(&dir)
        .arg("whoami")
        .assert()
        .success()
        .stdout(predicate::str::contains("warchief"));
}

#[test]
fn role_show_reports_env_mismatch() {
    let dir = scaffold();
    let worker = dir.path().join("horde/raiders/Toast/warband");
    std::fs::create_dir_all(&worker).unwrap();

    let mut cmd = Command::cargo_bin("hd").unwrap();
    cmd.current_dir(&worker);
    for key in ["HD_WARBAND", "HD_RAIDER", "HD_CLAN", "HD_ENCAMPMENT", "HD_ROLE_HOME"] {
        cmd.env_remove(key);
    }
    cmd.env("HD_ROLE", "warchief");
    cmd.args(["role", "show"]);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("role:      warchief"))
        .stdout(predicate::str::contains("source:    env"))
        .stdout(predicate::str::contains("mismatch:  true"))
        .stdout(predicate::str::contains("cwd role:  raider"));
}

#[test]
fn mail_roundtrip() {
    let dir = scaffold();
    hd(&dir)
        .args([
            "mail",
            "send",
            "warchief",
            "--subject",
            "scout report",
            "-m",
            "all quiet",
        ])
        .assert()
        .success();

    hd(&dir)
        .args(["mail", "inbox"])
        .assert()
        .success()
        .stdout(predicate::str::contains("scout report"));

    hd(&dir)
        .args(["mail", "search", "quiet", "--body-only"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1 match(es)"));
}

#[test]
fn activity_emit_appends_to_feed() {
    let dir = scaffold();
    hd(&dir)
        .args(["activity", "emit", "patrol", "--field", "kind=test"])
        .assert()
        .success();

    let feed = std::fs::read_to_string(dir.path().join(".events.jsonl")).unwrap();
    assert!(feed.contains(r#""type":"patrol""#));
    assert!(feed.contains(r#""kind":"test""#));
}

#[test]
fn agents_fix_reports_zero_when_clean() {
    let dir = scaffold();
    hd(&dir)
        .args(["agents", "fix"])
        .assert()
        .success()
        .stdout(predicate::str::contains("removed 0 stale lock(s)"));
}

#[test]
fn callbacks_process_forwards_help_and_is_idempotent() {
    let dir = scaffold();
    hd(&dir)
        .args([
            "mail",
            "send",
            "warchief",
            "--subject",
            "HELP: stuck on merge",
            "-m",
            "details",
        ])
        .assert()
        .success();

    hd(&dir)
        .args(["callbacks", "process"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1 processed, 1 archived"));

    // Forwarded copy landed with the overseer.
    let overseer = dir.path().join(".mail/overseer/inbox.jsonl");
    let forwarded = std::fs::read_to_string(overseer).unwrap();
    assert!(forwarded.contains("HELP: stuck on merge"));
    assert!(forwarded.contains(r#""priority":"high""#));

    // Drained inbox: rerun is a no-op.
    hd(&dir)
        .args(["callbacks", "process"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0 processed, 0 archived"));
}

#[test]
fn callbacks_dry_run_archives_nothing() {
    let dir = scaffold();
    hd(&dir)
        .args([
            "mail",
            "send",
            "warchief",
            "--subject",
            "ESCALATION: prod down",
        ])
        .assert()
        .success();

    hd(&dir)
        .args(["callbacks", "process", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1 processed, 0 archived"));

    assert!(!dir.path().join(".mail/overseer/inbox.jsonl").exists());
}

#[test]
fn hook_show_with_no_store_reports_empty() {
    let dir = scaffold();
    hd(&dir)
        .arg("hook")
        .assert()
        .success()
        .stdout(predicate::str::contains("Hook:     empty"));
}

#[test]
fn shaman_pause_blocks_stale_hooks() {
    let dir = scaffold();
    hd(&dir).args(["shaman", "pause"]).assert().success();
    hd(&dir)
        .args(["shaman", "stale-hooks", "--dry-run"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("paused"));
    hd(&dir).args(["shaman", "resume"]).assert().success();
}
