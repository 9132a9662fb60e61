use std::path::Path;
use std::process::{Command, Output};

use blink_monitor::{BlinkMonitorConfig, store::SqliteStore};

/// Run the binary. Console log output goes to stdout, at `rust_log` level.
fn blink_monitor(rust_log: &str, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_blink-monitor"))
        .args(args)
        .env("RUST_LOG", rust_log)
        .output()
        .unwrap()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// A config using the simulated camera, a fast console refresh and a store
/// and log file next to the config file.
fn write_config(dir: &Path) -> std::path::PathBuf {
    let fname = dir.join("blink-monitor.toml");
    std::fs::write(
        &fname,
        "[camera]\n\
         backend = \"simulated\"\n\
         width = 32\n\
         height = 24\n\
         \n\
         [intervals]\n\
         stream_msec = 100\n\
         persist_msec = 100\n\
         presentation_msec = 100\n\
         \n\
         [store]\n\
         path = \"blinks.db\"\n\
         \n\
         [logging]\n\
         file = \"blink-monitor.log\"\n",
    )
    .unwrap();
    fname
}

#[test]
fn example_config_is_valid() {
    let output = blink_monitor("warn", &["print-example-config"]);
    assert!(output.status.success());
    let text = stdout(&output);
    assert_eq!(
        BlinkMonitorConfig::from_toml_str(&text).unwrap(),
        BlinkMonitorConfig::default()
    );
}

#[test]
fn run_stops_after_duration_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let output = blink_monitor(
        "info",
        &[
            "run",
            "--config",
            config.to_str().unwrap(),
            "--duration",
            "0.6",
        ],
    );
    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(stdout(&output).contains("Total blinks:"));

    let log = std::fs::read_to_string(dir.path().join("blink-monitor.log")).unwrap();
    assert!(log.contains("pipeline started"));
    assert!(log.contains("pipeline stopped"));

    let store = SqliteStore::open(&dir.path().join("blinks.db"), "user1").unwrap();
    assert!(store.row_count().unwrap() >= 1);

    let output = blink_monitor("warn", &["history", "--config", config.to_str().unwrap()]);
    assert!(output.status.success());
    let text = stdout(&output);
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("timestamp,blinkcount"));
    assert_eq!(lines.count() as u64, store.row_count().unwrap());
}

#[test]
fn negative_duration_is_rejected() {
    let output = blink_monitor("warn", &["run", "--duration=-1"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("--duration"));
}
