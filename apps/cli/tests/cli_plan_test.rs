//! Integration tests for `tandem plan`.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn write_config(dir: &Path, trainer_extra: &str) -> PathBuf {
    let path = dir.join("run.toml");
    let content = format!(
        r#"
[trainer]
global_batch_size = 4
max_epochs = 2
val_check_interval = 2
{trainer_extra}

[data]
eos_id = 2
seq_length = 64

[sampler]
kind = "random"
seed = 1
"#
    );
    std::fs::write(&path, content).unwrap();
    path
}

fn write_pairs(dir: &Path, name: &str, n: usize) -> PathBuf {
    let path = dir.join(name);
    let lines: Vec<String> = (0..n)
        .map(|i| {
            serde_json::json!({
                "prompt_ids": [1, 2],
                "chosen_ids": [1, 2, 10 + i],
                "rejected_ids": [1, 2, 9]
            })
            .to_string()
        })
        .collect();
    std::fs::write(&path, lines.join("\n")).unwrap();
    path
}

#[test]
fn test_plan_json() {
    let temp = TempDir::new().unwrap();
    let config = write_config(temp.path(), "save_interval = 4");
    let train = write_pairs(temp.path(), "train.jsonl", 10);
    let val = write_pairs(temp.path(), "val.jsonl", 8);

    let output = Command::cargo_bin("tandem")
        .unwrap()
        .args(["plan", "--json", "--config"])
        .arg(&config)
        .arg("--train")
        .arg(&train)
        .arg("--val")
        .arg(&val)
        .output()
        .unwrap();
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let plan: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(plan["train_examples"], 10);
    assert_eq!(plan["steps_per_epoch"], 2);
    assert_eq!(plan["max_steps"], 4);
    assert_eq!(plan["val_check_interval"], 2);
    assert_eq!(plan["limit_val_batches"], 2);
    assert_eq!(plan["train_fingerprint"].as_str().map(str::len), Some(64));
}

#[test]
fn test_plan_human_output() {
    let temp = TempDir::new().unwrap();
    let config = write_config(temp.path(), "");
    let train = write_pairs(temp.path(), "train.jsonl", 8);

    Command::cargo_bin("tandem")
        .unwrap()
        .arg("plan")
        .arg("--config")
        .arg(&config)
        .arg("--train")
        .arg(&train)
        .assert()
        .success()
        .stdout(predicate::str::contains("Training Plan"))
        .stdout(predicate::str::contains("Max steps"))
        .stdout(predicate::str::contains("disabled"));
}

#[test]
fn test_plan_rejects_misaligned_save_interval() {
    let temp = TempDir::new().unwrap();
    let config = write_config(temp.path(), "save_interval = 3");
    let train = write_pairs(temp.path(), "train.jsonl", 8);
    let val = write_pairs(temp.path(), "val.jsonl", 4);

    Command::cargo_bin("tandem")
        .unwrap()
        .arg("plan")
        .arg("--config")
        .arg(&config)
        .arg("--train")
        .arg(&train)
        .arg("--val")
        .arg(&val)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("save_interval"));
}

#[test]
fn test_plan_missing_dataset() {
    let temp = TempDir::new().unwrap();
    let config = write_config(temp.path(), "");

    Command::cargo_bin("tandem")
        .unwrap()
        .arg("plan")
        .arg("--config")
        .arg(&config)
        .arg("--train")
        .arg(temp.path().join("missing.jsonl"))
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Failed to load train dataset"));
}

#[test]
fn test_plan_missing_config() {
    let temp = TempDir::new().unwrap();
    let train = write_pairs(temp.path(), "train.jsonl", 8);

    Command::cargo_bin("tandem")
        .unwrap()
        .arg("plan")
        .arg("--config")
        .arg(temp.path().join("nope.toml"))
        .arg("--train")
        .arg(&train)
        .assert()
        .failure()
        .stderr(predicate::str::contains("configuration file not found"));
}
