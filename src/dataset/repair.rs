//! Recovery of JSON objects from damaged line-delimited files
//!
//! Agents appended records from several processes, so data-point files can
//! contain objects split across lines, trailing commas or half-written
//! records. [`repair`] tries each [`RecoveryStrategy`] in turn and keeps the
//! first one that applies.

use serde_json::Value;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{DatagenError, Result};

/// Objects recovered by one strategy
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Recovery {
    pub objects: Vec<Value>,
    /// Candidates that looked like objects but failed to parse
    pub discarded: usize,
}

pub trait RecoveryStrategy {
    fn name(&self) -> &'static str;

    /// `None` when the strategy does not apply to this buffer
    fn recover(&self, raw: &str) -> Option<Recovery>;
}

/// Whole buffer parsed as the body of a JSON array
#[derive(Debug, Clone, Copy, Default)]
pub struct WholeArray;

impl RecoveryStrategy for WholeArray {
    fn name(&self) -> &'static str {
        "whole_array"
    }

    fn recover(&self, raw: &str) -> Option<Recovery> {
        let parsed: Value = serde_json::from_str(&format!("[{}]", raw)).ok()?;
        let items = match parsed {
            Value::Array(items) => items,
            _ => return None,
        };
        if !items.iter().all(Value::is_object) {
            return None;
        }
        Some(Recovery {
            objects: items,
            discarded: 0,
        })
    }
}

/// Brace-depth scanner: every top-level `{ ... }` is a candidate object
#[derive(Debug, Clone, Copy, Default)]
pub struct BraceDepth;

impl BraceDepth {
    fn candidates(raw: &str) -> (Vec<String>, bool) {
        let mut candidates = Vec::new();
        let mut current = String::new();
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;

        for ch in raw.chars() {
            if depth == 0 {
                if ch == '{' {
                    current.push(ch);
                    depth = 1;
                }
                continue;
            }

            current.push(ch);

            if in_string {
                match ch {
                    _ if escaped => escaped = false,
                    '\\' => escaped = true,
                    '"' => in_string = false,
                    // A literal newline never belongs to a valid JSON string
                    '\n' => in_string = false,
                    _ => {}
                }
                continue;
            }

            match ch {
                '"' => in_string = true,
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        candidates.push(std::mem::take(&mut current));
                    }
                }
                _ => {}
            }
        }

        (candidates, depth > 0)
    }
}

impl RecoveryStrategy for BraceDepth {
    fn name(&self) -> &'static str {
        "brace_depth"
    }

    fn recover(&self, raw: &str) -> Option<Recovery> {
        let (candidates, unterminated) = Self::candidates(raw);
        let mut recovery = Recovery::default();

        for candidate in candidates {
            match serde_json::from_str::<Value>(&candidate) {
                Ok(value) => recovery.objects.push(value),
                Err(e) => {
                    let err = DatagenError::MalformedRecord(e.to_string());
                    warn!(error = %err, chars = candidate.len(), "Discarding unparsable object");
                    recovery.discarded += 1;
                }
            }
        }
        if unterminated {
            warn!("Discarding unterminated trailing object");
            recovery.discarded += 1;
        }

        Some(recovery)
    }
}

/// Result of [`repair`]
#[derive(Debug, Clone, PartialEq)]
pub struct RepairReport {
    pub objects: Vec<Value>,
    pub discarded: usize,
    pub strategy: &'static str,
}

/// Recover every JSON object in `raw`
pub fn repair(raw: &str) -> RepairReport {
    let strategies: [&dyn RecoveryStrategy; 2] = [&WholeArray, &BraceDepth];

    for strategy in strategies {
        if let Some(recovery) = strategy.recover(raw) {
            debug!(
                strategy = strategy.name(),
                objects = recovery.objects.len(),
                discarded = recovery.discarded,
                "Buffer repaired"
            );
            return RepairReport {
                objects: recovery.objects,
                discarded: recovery.discarded,
                strategy: strategy.name(),
            };
        }
    }

    RepairReport {
        objects: Vec::new(),
        discarded: 0,
        strategy: "none",
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RepairSummary {
    pub output_dir: PathBuf,
    pub files_written: usize,
    pub files_skipped: usize,
    pub objects: usize,
    pub discarded: usize,
}

/// `<input>_fixed` next to the input directory
pub fn fixed_dir_for(input: &Path) -> PathBuf {
    let name = input
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "data_points".to_string());
    input.with_file_name(format!("{}_fixed", name))
}

/// `*.jsonl` files of a directory, sorted by name
pub fn jsonl_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !dir.is_dir() {
        return Ok(files);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_jsonl = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("jsonl"))
            .unwrap_or(false);
        if path.is_file() && is_jsonl {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Recursively order object keys
pub fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, sort_keys(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

/// Rewrite every JSONL file as one compact, key-sorted object per line
pub fn repair_directory(input: &Path, output: Option<&Path>) -> Result<RepairSummary> {
    let output_dir = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| fixed_dir_for(input));
    fs::create_dir_all(&output_dir)?;

    let mut summary = RepairSummary {
        output_dir: output_dir.clone(),
        files_written: 0,
        files_skipped: 0,
        objects: 0,
        discarded: 0,
    };

    for path in jsonl_files(input)? {
        let raw = fs::read_to_string(&path)?;
        let report = repair(&raw);
        summary.discarded += report.discarded;

        if report.objects.is_empty() {
            warn!(file = %path.display(), "No recoverable objects, skipping file");
            summary.files_skipped += 1;
            continue;
        }

        let Some(file_name) = path.file_name() else {
            continue;
        };
        let target = output_dir.join(file_name);
        let mut writer = BufWriter::new(File::create(&target)?);
        for object in &report.objects {
            serde_json::to_writer(&mut writer, &sort_keys(object.clone()))?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;

        debug!(
            file = %path.display(),
            strategy = report.strategy,
            objects = report.objects.len(),
            "Repaired file written"
        );
        summary.files_written += 1;
        summary.objects += report.objects.len();
    }

    info!(
        output = %summary.output_dir.display(),
        files = summary.files_written,
        objects = summary.objects,
        discarded = summary.discarded,
        "🔧 JSONL repair complete"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("datagen_repair_{}_{}", name, uuid::Uuid::new_v4()))
    }

    #[test]
    fn comma_separated_objects_parse_as_array() {
        let raw = "{\"a\": 1},\n{\"a\": 2}\n";
        let report = repair(raw);
        assert_eq!(report.strategy, "whole_array");
        assert_eq!(report.objects, vec![json!({"a": 1}), json!({"a": 2})]);
    }

    #[test]
    fn newline_delimited_objects_fall_back_to_scanner() {
        let raw = "{\"a\": 1}\n{\"a\": 2}\n";
        let report = repair(raw);
        assert_eq!(report.strategy, "brace_depth");
        assert_eq!(report.objects.len(), 2);
        assert_eq!(report.discarded, 0);
    }

    #[test]
    fn objects_split_across_lines_are_rejoined() {
        let raw = "{\"chat_history\": [\n  {\"role\": \"system\", \"content\": \"x\"}\n],\n \"score\": 1.5}\n{\"score\": 2}";
        let report = repair(raw);
        assert_eq!(report.objects.len(), 2);
        assert_eq!(report.objects[0]["score"], 1.5);
    }

    #[test]
    fn braces_inside_strings_do_not_split_objects() {
        let raw = "{\"content\": \"use {braces} and \\\"}\\\" freely\"}\n{\"n\": 2}";
        let report = repair(raw);
        assert_eq!(report.objects.len(), 2);
        assert_eq!(report.objects[0]["content"], "use {braces} and \"}\" freely");
    }

    #[test]
    fn broken_and_truncated_objects_are_discarded() {
        let raw = "{\"ok\": 1}\n{\"bad\": tru}\n{\"ok\": 2}\n{\"cut\": ";
        let report = repair(raw);
        assert_eq!(report.objects, vec![json!({"ok": 1}), json!({"ok": 2})]);
        assert_eq!(report.discarded, 2);
    }

    #[test]
    fn repair_directory_is_idempotent() {
        let input = temp_dir("input");
        fs::create_dir_all(&input).unwrap();
        fs::write(
            input.join("points.jsonl"),
            "{\"z\": 1, \"a\": {\"k\": [1, 2]}}\n{\"score\": 3.5, \"chat_history\": []}\n",
        )
        .unwrap();
        fs::write(input.join("garbage.jsonl"), "not json at all").unwrap();
        fs::write(input.join("notes.txt"), "{\"ignored\": true}").unwrap();

        let first = repair_directory(&input, None).unwrap();
        assert_eq!(first.output_dir, fixed_dir_for(&input));
        assert_eq!(first.files_written, 1);
        assert_eq!(first.files_skipped, 1);
        assert_eq!(first.objects, 2);

        let once = fs::read_to_string(first.output_dir.join("points.jsonl")).unwrap();
        assert_eq!(once.lines().next().unwrap(), "{\"a\":{\"k\":[1,2]},\"z\":1}");

        let second_out = temp_dir("second");
        repair_directory(&first.output_dir, Some(&second_out)).unwrap();
        let twice = fs::read_to_string(second_out.join("points.jsonl")).unwrap();
        assert_eq!(once, twice);

        let _ = fs::remove_dir_all(&input);
        let _ = fs::remove_dir_all(&first.output_dir);
        let _ = fs::remove_dir_all(&second_out);
    }
}
