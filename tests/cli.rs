//! CLI test cases.
//!
//! Most of these use the `echo` engine, which needs no external tools. Tests
//! which need `tesseract` (with the `fra` and `eng` language packs) are
//! ignored by default.

use std::{fs, path::Path, process::Command};

use assert_cmd::prelude::*;
use image::{GrayImage, ImageFormat, Luma};
use predicates::prelude::*;
use serde_json::Value;

/// Create a new `Command` with our binary.
fn cmd() -> Command {
    Command::cargo_bin("docscan-ocr").unwrap()
}

/// Write a blank page to `path`.
fn write_blank_png(path: &Path) {
    GrayImage::from_pixel(400, 300, Luma([255]))
        .save_with_format(path, ImageFormat::Png)
        .unwrap();
}

/// Parse JSONL output.
fn parse_jsonl(stdout: &[u8]) -> Vec<Value> {
    String::from_utf8_lossy(stdout)
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[test]
fn test_help() {
    cmd().arg("--help").assert().success();
}

#[test]
fn test_version() {
    cmd().arg("--version").assert().success();
}

#[test]
fn test_schema() {
    for schema_type in ["OcrInput", "OcrOutput", "PipelineConfig"] {
        cmd()
            .arg("schema")
            .arg(schema_type)
            .assert()
            .success()
            .stdout(predicate::str::contains("\"properties\""));
    }
}

#[test]
fn test_schema_rejects_unknown_types() {
    cmd().arg("schema").arg("ChatPrompt").assert().failure();
}

#[test]
fn test_ocr_jsonl_input_echo() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("page.png");
    write_blank_png(&image);
    let input = dir.path().join("input.jsonl");
    fs::write(
        &input,
        format!(
            "{}\n{}\n",
            serde_json::json!({ "id": 1, "path": image }),
            serde_json::json!({ "id": "two", "path": image, "languages": "eng" }),
        ),
    )
    .unwrap();

    let output = cmd()
        .arg("ocr")
        .arg(&input)
        .args(["--engine", "echo", "--marker", "tsh"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{output:?}");

    let records = parse_jsonl(&output.stdout);
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["id"], 1);
    assert_eq!(records[0]["status"], "ok");
    assert_eq!(records[0]["raw_text"], "page 1 (fra+eng)");
    assert_eq!(records[0]["result"]["pages"][0]["status"], "recognized");
    assert_eq!(records[0]["marker"]["error"], "TSH_NOT_FOUND");
    assert_eq!(records[1]["id"], "two");
    assert_eq!(records[1]["raw_text"], "page 1 (eng)");
}

#[test]
fn test_ocr_csv_input_echo() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("page.png");
    write_blank_png(&image);
    let input = dir.path().join("input.csv");
    fs::write(
        &input,
        format!("id,path,languages\na,{},\nb,{},eng+fra\n", image.display(), image.display()),
    )
    .unwrap();
    let out = dir.path().join("output.jsonl");

    cmd()
        .arg("ocr")
        .arg(&input)
        .args(["--engine", "echo", "--no-preprocess", "-o"])
        .arg(&out)
        .assert()
        .success();

    let records = parse_jsonl(&fs::read(&out).unwrap());
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["raw_text"], "page 1 (fra+eng)");
    assert_eq!(records[1]["raw_text"], "page 1 (eng+fra)");
}

#[test]
fn test_ocr_failures_respect_allowed_failure_rate() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.jsonl");
    fs::write(
        &input,
        format!(
            "{}\n",
            serde_json::json!({ "id": 1, "path": dir.path().join("missing.png") })
        ),
    )
    .unwrap();

    cmd()
        .arg("ocr")
        .arg(&input)
        .args(["--engine", "echo"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("of documents failed"));

    let output = cmd()
        .arg("ocr")
        .arg(&input)
        .args(["--engine", "echo", "--allowed-failure-rate", "1.0"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{output:?}");
    let records = parse_jsonl(&output.stdout);
    assert_eq!(records[0]["status"], "failed");
    assert!(records[0].get("result").is_none());
}

#[test]
fn test_ocr_rejects_unsupported_documents() {
    let dir = tempfile::tempdir().unwrap();
    let text = dir.path().join("notes.txt");
    fs::write(&text, "not an image").unwrap();
    let input = dir.path().join("input.jsonl");
    fs::write(&input, format!("{}\n", serde_json::json!({ "id": 1, "path": text }))).unwrap();

    let output = cmd()
        .arg("ocr")
        .arg(&input)
        .args(["--engine", "echo", "--allowed-failure-rate", "1.0"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{output:?}");
    let records = parse_jsonl(&output.stdout);
    assert_eq!(records[0]["errors"][0]["kind"], "unsupported_format");
}

#[test]
fn test_ocr_rejects_bad_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("config.toml");
    fs::write(&config, "concurrency = 0\n").unwrap();
    cmd()
        .arg("ocr")
        .args(["--engine", "echo", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("concurrency"));
}

#[test]
#[ignore = "Needs tesseract installed"]
fn test_languages_tesseract() {
    cmd()
        .arg("languages")
        .assert()
        .success()
        .stdout(predicate::str::contains("eng"));
}

#[test]
#[ignore = "Needs tesseract installed"]
fn test_ocr_blank_page_tesseract() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("page.png");
    write_blank_png(&image);
    let input = dir.path().join("input.jsonl");
    fs::write(&input, format!("{}\n", serde_json::json!({ "id": 1, "path": image }))).unwrap();

    let output = cmd().arg("ocr").arg(&input).output().unwrap();
    assert!(output.status.success(), "{output:?}");
    let records = parse_jsonl(&output.stdout);
    assert_eq!(records[0]["status"], "ok");
    assert_eq!(records[0]["result"]["pages"][0]["status"], "empty");
}
