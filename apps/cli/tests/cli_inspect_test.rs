//! Integration tests for `tandem inspect`.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn write_config(dir: &Path, variant: &str) -> PathBuf {
    let path = dir.join("run.toml");
    let content = format!(
        r#"
[trainer]
global_batch_size = 2

[data]
variant = "{variant}"
eos_id = 2
seq_length = 64

[sampler]
kind = "sequential"
data_parallel_size = 1
"#
    );
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_inspect_packed_rows() {
    let temp = TempDir::new().unwrap();
    let config = write_config(temp.path(), "packed");
    let data = temp.path().join("packed.jsonl");
    std::fs::write(
        &data,
        concat!(
            r#"{"input_ids": [1, 2, 3, 4, 5, 6], "labels": [1, 2, 3, 4, 5, 6], "#,
            r#""seq_boundaries": [0, 3, 6], "lengths": [3, 3], "reward": [1.0, 0.0]}"#,
            "\n",
            r#"{"input_ids": [7, 8, 9, 10, 11], "labels": [7, 8, 9, 10, 11], "#,
            r#""seq_boundaries": [0, 5], "lengths": [5], "reward": [0.5]}"#,
            "\n",
        ),
    )
    .unwrap();

    let output = Command::cargo_bin("tandem")
        .unwrap()
        .args(["inspect", "--json", "--config"])
        .arg(&config)
        .arg(&data)
        .output()
        .unwrap();
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["examples"], 2);
    let batch = &report["batches"][0];
    assert_eq!(batch["variant"], "packed");
    assert_eq!(batch["rows"], 2);
    assert_eq!(batch["seq_len"], 16);
    assert_eq!(batch["segments_per_row"], serde_json::json!([2, 1]));
    assert_eq!(batch["padding_tokens"], 24);
}

#[test]
fn test_inspect_pairs_table() {
    let temp = TempDir::new().unwrap();
    let config = write_config(temp.path(), "unpacked");
    let data = temp.path().join("pairs.jsonl");
    let lines: Vec<String> = (0..4)
        .map(|i| {
            serde_json::json!({
                "prompt_ids": [1],
                "chosen_ids": [1, 10 + i],
                "rejected_ids": [1, 7, 8]
            })
            .to_string()
        })
        .collect();
    std::fs::write(&data, lines.join("\n")).unwrap();

    Command::cargo_bin("tandem")
        .unwrap()
        .arg("inspect")
        .arg(&data)
        .arg("--config")
        .arg(&config)
        .arg("--batches")
        .arg("5")
        .assert()
        .success()
        .stdout(predicate::str::contains("Batches (2 from 4 examples)"))
        .stdout(predicate::str::contains("pairs"));
}

#[test]
fn test_inspect_text_records_without_tokenizer() {
    let temp = TempDir::new().unwrap();
    let config = write_config(temp.path(), "unpacked");
    let data = temp.path().join("text.jsonl");
    std::fs::write(
        &data,
        "{\"prompt\": \"a\", \"chosen_response\": \"b\", \"rejected_response\": \"c\"}\n\
         {\"prompt\": \"d\", \"chosen_response\": \"e\", \"rejected_response\": \"f\"}\n",
    )
    .unwrap();

    Command::cargo_bin("tandem")
        .unwrap()
        .arg("inspect")
        .arg(&data)
        .arg("--config")
        .arg(&config)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Failed to produce examples for batch 0"))
        .stderr(predicate::str::contains("no tokenizer"));
}

#[test]
fn test_inspect_overlength_packed_row_fails() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("run.toml");
    std::fs::write(
        &path,
        concat!(
            "[trainer]\nglobal_batch_size = 1\n\n",
            "[data]\nvariant = \"packed\"\neos_id = 2\nseq_length = 4\n\n",
            "[sampler]\nkind = \"sequential\"\n",
        ),
    )
    .unwrap();
    let data = temp.path().join("long.jsonl");
    std::fs::write(
        &data,
        concat!(
            r#"{"input_ids": [1, 2, 3, 4, 5, 6, 7], "labels": [1, 2, 3, 4, 5, 6, 7], "#,
            r#""seq_boundaries": [0, 7], "lengths": [7], "reward": [1.0]}"#,
        ),
    )
    .unwrap();

    Command::cargo_bin("tandem")
        .unwrap()
        .arg("inspect")
        .arg(&data)
        .arg("--config")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to collate batch 0"));
}
