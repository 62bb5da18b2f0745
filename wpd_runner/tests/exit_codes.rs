use std::fs;
use std::path::Path;
use std::process::{Command, Output};

fn run(args: &[&Path]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_wpd_runner"))
        .args(args)
        .env("RUST_LOG", "error")
        .env_remove("WPD_OUTPUT_DIR")
        .env_remove("WPD_WORKERS")
        .env_remove("WPD_MODE")
        .output()
        .expect("spawn wpd_runner")
}

#[test]
fn missing_arguments_exit_with_usage() {
    let output = run(&[]);
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Usage: wpd_runner"));

    let dir = tempfile::tempdir().expect("tempdir");
    assert_eq!(run(&[dir.path(), dir.path()]).status.code(), Some(2));
}

#[test]
fn empty_aoi_directory_exits_with_one() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (aoi, frames, out) = (dir.path().join("aoi"), dir.path().join("frames"), dir.path().join("out"));
    fs::create_dir_all(&aoi).expect("aoi dir");
    fs::create_dir_all(&frames).expect("frame dir");
    fs::write(frames.join("plan_L1_0900.pfm"), "Pf\n1 1\n-1.0\n\0\0\0\0").expect("frame");

    let output = run(&[&aoi, &frames, &out]);
    assert_eq!(output.status.code(), Some(1));
    assert!(!out.exists());
}

#[test]
fn missing_frame_directory_exits_with_one() {
    let dir = tempfile::tempdir().expect("tempdir");
    let aoi = dir.path().join("aoi");
    fs::create_dir_all(&aoi).expect("aoi dir");

    let output = run(&[&aoi, &dir.path().join("nope"), &dir.path().join("out")]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn unreadable_config_file_exits_with_one() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = dir.path().join("config.json");
    fs::write(&config, "{ not json").expect("config");

    let output = run(&[dir.path(), dir.path(), &dir.path().join("out"), &config]);
    assert_eq!(output.status.code(), Some(1));
}
