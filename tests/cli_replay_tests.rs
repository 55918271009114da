//! End-to-end tests of the calltrace binary replaying event scripts
#![allow(deprecated)] // Command::cargo_bin is deprecated but still functional

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

const MALLOC_SCRIPT: &str = r#"
{"kind":"module_load","module":"libc.so.6"}
{"kind":"entry","tid":1,"module":"libc.so.6","function":"malloc","args":["0x20"],"ret":"pointer"}
{"kind":"entry","tid":2,"module":"libc.so.6","function":"free","args":["0x5000"]}
{"kind":"exit","tid":1,"module":"libc.so.6","function":"malloc","value":20480}
{"kind":"exit","tid":2,"module":"libc.so.6","function":"free","value":0}
"#;

fn write_script(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_replay_to_stderr_grepable() {
    let temp_dir = TempDir::new().unwrap();
    let script = write_script(&temp_dir, "events.jsonl", MALLOC_SCRIPT);

    let mut cmd = Command::cargo_bin("calltrace").unwrap();
    cmd.arg("--grepable")
        .arg(&script)
        .assert()
        .success()
        .stderr(predicate::str::contains(
            "~~1~~ libc.so.6!malloc {0: 0x20} = 0x5000",
        ))
        .stderr(predicate::str::contains("~~2~~ libc.so.6!free {0: 0x5000} = 0x0"));
}

#[test]
fn test_replay_to_log_file_human_readable() {
    let temp_dir = TempDir::new().unwrap();
    let script = write_script(&temp_dir, "events.jsonl", MALLOC_SCRIPT);
    let log = temp_dir.path().join("trace.log");

    let mut cmd = Command::cargo_bin("calltrace").unwrap();
    cmd.arg("-o").arg(&log).arg(&script).assert().success();

    let text = fs::read_to_string(&log).unwrap();
    assert!(text.contains("~~1~~ libc.so.6!malloc\n    arg 0: 0x20\n    ret: 0x5000\n"));
    assert!(text.contains("~~2~~ libc.so.6!free\n    arg 0: 0x5000\n    ret: 0x0\n"));
}

#[test]
fn test_filter_file_whitelist() {
    let temp_dir = TempDir::new().unwrap();
    let script = write_script(&temp_dir, "events.jsonl", MALLOC_SCRIPT);
    let filter = write_script(&temp_dir, "rules.filter", "[whitelist]\nlibc.so.6!malloc\n");
    let log = temp_dir.path().join("trace.log");

    let mut cmd = Command::cargo_bin("calltrace").unwrap();
    cmd.arg("--grepable")
        .arg("-f")
        .arg(&filter)
        .arg("-o")
        .arg(&log)
        .arg(&script)
        .assert()
        .success();

    let text = fs::read_to_string(&log).unwrap();
    assert!(text.contains("libc.so.6!malloc"));
    assert!(!text.contains("libc.so.6!free {"));
    // The untraced free() exit has no record to match
    assert!(text.contains("ERROR: failed to find cache entry for [~~2~~ libc.so.6!free]"));
}

#[test]
fn test_string_return_from_script_memory() {
    let temp_dir = TempDir::new().unwrap();
    let script = write_script(
        &temp_dir,
        "events.jsonl",
        r#"
{"kind":"memory","addr":8192,"bytes":"2f686f6d652f7573657200"}
{"kind":"entry","tid":5,"module":"libc.so.6","function":"getenv","args":["HOME"],"ret":"c_string"}
{"kind":"exit","tid":5,"module":"libc.so.6","function":"getenv","value":8192}
{"kind":"entry","tid":5,"module":"libc.so.6","function":"getenv","args":["NOPE"],"ret":"c_string"}
{"kind":"exit","tid":5,"module":"libc.so.6","function":"getenv","value":0}
"#,
    );

    let mut cmd = Command::cargo_bin("calltrace").unwrap();
    cmd.arg("--grepable")
        .arg(&script)
        .assert()
        .success()
        .stderr(predicate::str::contains(
            "~~5~~ libc.so.6!getenv {0: HOME} = 0x2000:\"/home/user\"",
        ))
        .stderr(predicate::str::contains("~~5~~ libc.so.6!getenv {0: NOPE} = <NULL>"));
}

#[test]
fn test_max_cache_size_flushes_pending() {
    let temp_dir = TempDir::new().unwrap();
    let script = write_script(
        &temp_dir,
        "events.jsonl",
        r#"
{"kind":"entry","tid":1,"module":"libc.so.6","function":"a"}
{"kind":"entry","tid":1,"module":"libc.so.6","function":"b"}
{"kind":"entry","tid":1,"module":"libc.so.6","function":"c"}
{"kind":"exit","tid":1,"module":"libc.so.6","function":"a","value":1}
"#,
    );

    let mut cmd = Command::cargo_bin("calltrace").unwrap();
    cmd.arg("--grepable")
        .arg("--max-cache-size")
        .arg("2")
        .arg(&script)
        .assert()
        .success()
        .stderr(predicate::str::contains("~~1~~ libc.so.6!a = ?"))
        .stderr(predicate::str::contains("~~1~~ libc.so.6!b = ?"))
        .stderr(predicate::str::contains("~~1~~ libc.so.6!c = ?"))
        .stderr(predicate::str::contains("ERROR").not());
}

#[test]
fn test_config_file() {
    let temp_dir = TempDir::new().unwrap();
    let script = write_script(&temp_dir, "events.jsonl", MALLOC_SCRIPT);
    let log = temp_dir.path().join("from-config.log");
    let config = write_script(
        &temp_dir,
        "calltrace.toml",
        &format!("grepable = true\noutput = {:?}\n", log.display().to_string()),
    );

    let mut cmd = Command::cargo_bin("calltrace").unwrap();
    cmd.arg("--config").arg(&config).arg(&script).assert().success();

    let text = fs::read_to_string(&log).unwrap();
    assert!(text.contains("~~1~~ libc.so.6!malloc {0: 0x20} = 0x5000"));
}

#[test]
fn test_check_decision() {
    let temp_dir = TempDir::new().unwrap();
    let filter = write_script(&temp_dir, "rules.filter", "[blacklist]\nlibc.so.6!free\nlibm.so.6\n");

    let mut cmd = Command::cargo_bin("calltrace").unwrap();
    cmd.arg("-f")
        .arg(&filter)
        .arg("--check")
        .arg("libc.so.6!free")
        .assert()
        .success()
        .stdout(predicate::str::contains("libc.so.6!free: filtered"));

    let mut cmd = Command::cargo_bin("calltrace").unwrap();
    cmd.arg("-f")
        .arg(&filter)
        .arg("--check")
        .arg("libc.so.6!malloc")
        .assert()
        .success()
        .stdout(predicate::str::contains("libc.so.6!malloc: traced"));

    let mut cmd = Command::cargo_bin("calltrace").unwrap();
    cmd.arg("-f")
        .arg(&filter)
        .arg("--check")
        .arg("libm.so.6!sin")
        .assert()
        .success()
        .stdout(predicate::str::contains("module not instrumented"));
}

#[test]
fn test_missing_script_fails() {
    let mut cmd = Command::cargo_bin("calltrace").unwrap();
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Must specify an event script"));
}

#[test]
fn test_zero_capacity_fails() {
    let temp_dir = TempDir::new().unwrap();
    let script = write_script(&temp_dir, "events.jsonl", MALLOC_SCRIPT);

    let mut cmd = Command::cargo_bin("calltrace").unwrap();
    cmd.arg("--cache-capacity")
        .arg("0")
        .arg(&script)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to create return value cache"));
}

#[test]
fn test_unallocatable_capacity_fails() {
    let temp_dir = TempDir::new().unwrap();
    let script = write_script(&temp_dir, "events.jsonl", MALLOC_SCRIPT);

    let mut cmd = Command::cargo_bin("calltrace").unwrap();
    cmd.arg("--cache-capacity")
        .arg(usize::MAX.to_string())
        .arg(&script)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to create return value cache"))
        .stderr(predicate::str::contains("Failed to allocate return value cache"));
}

#[test]
fn test_malformed_script_fails() {
    let temp_dir = TempDir::new().unwrap();
    let script = write_script(&temp_dir, "events.jsonl", "{\"kind\":\"entry\",\"tid\":1}\n");

    let mut cmd = Command::cargo_bin("calltrace").unwrap();
    cmd.arg(&script)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid event on line 1"));
}
