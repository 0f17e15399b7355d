//! GRPO dataset merge
//!
//! Per-example files are recovered with [`repair`](super::repair), reformatted
//! into `{prompt, response, reward, metadata}` records with the XML
//! chain-of-thought response layout, and written as one JSON array.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::repair::repair;
use super::TrainingExample;
use crate::error::{DatagenError, Result};
use crate::reward::RewardComponents;
use crate::types::PromptMessage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrpoMetadata {
    pub reward_components: RewardComponents,
    #[serde(with = "rust_decimal::serde::float")]
    pub portfolio_change: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Training-ready record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrpoRecord {
    pub prompt: Vec<PromptMessage>,
    pub response: String,
    pub reward: f64,
    pub metadata: GrpoMetadata,
}

impl From<&TrainingExample> for GrpoRecord {
    fn from(example: &TrainingExample) -> Self {
        Self {
            prompt: example.prompt.clone(),
            response: format_response(
                example.reasoning.as_deref().unwrap_or_default(),
                &example.response.content,
            ),
            reward: example.reward,
            metadata: GrpoMetadata {
                reward_components: example.reward_components.clone(),
                portfolio_change: example.portfolio_after.total_value_usd
                    - example.portfolio_before.total_value_usd,
                timestamp: example.produced_at,
            },
        }
    }
}

pub fn format_response(reasoning: &str, answer: &str) -> String {
    format!(
        "<reasoning>\n{}\n</reasoning>\n<answer>\n{}\n</answer>",
        reasoning, answer
    )
}

/// Reward statistics of a merged dataset
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct DatasetStats {
    pub count: usize,
    pub mean_reward: f64,
    pub min_reward: f64,
    pub max_reward: f64,
}

impl DatasetStats {
    pub fn from_rewards(rewards: &[f64]) -> Self {
        if rewards.is_empty() {
            return Self::default();
        }
        let sum: f64 = rewards.iter().sum();
        Self {
            count: rewards.len(),
            mean_reward: sum / rewards.len() as f64,
            min_reward: rewards.iter().copied().fold(f64::INFINITY, f64::min),
            max_reward: rewards.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        }
    }
}

/// Examples recovered from a directory of `grpo_example_*.json` files
#[derive(Debug, Clone, Default)]
pub struct LoadedExamples {
    pub examples: Vec<TrainingExample>,
    pub files_read: usize,
    pub skipped: usize,
}

pub fn load_examples(dir: &Path) -> Result<LoadedExamples> {
    let mut loaded = LoadedExamples::default();
    if !dir.is_dir() {
        warn!(dir = %dir.display(), "Examples directory missing");
        return Ok(loaded);
    }

    let mut files: Vec<PathBuf> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with("grpo_example_") && n.ends_with(".json"))
            .unwrap_or(false);
        if matches && path.is_file() {
            files.push(path);
        }
    }
    files.sort();

    for path in files {
        let raw = fs::read_to_string(&path)?;
        let report = repair(&raw);
        loaded.files_read += 1;
        loaded.skipped += report.discarded;

        for object in report.objects {
            match serde_json::from_value::<TrainingExample>(object) {
                Ok(example) => loaded.examples.push(example),
                Err(e) => {
                    let err = DatagenError::MalformedRecord(e.to_string());
                    warn!(file = %path.display(), error = %err, "Skipping example");
                    loaded.skipped += 1;
                }
            }
        }
    }

    Ok(loaded)
}

pub fn merge_examples(examples: &[TrainingExample]) -> (Vec<GrpoRecord>, DatasetStats) {
    let records: Vec<GrpoRecord> = examples.iter().map(GrpoRecord::from).collect();
    let rewards: Vec<f64> = records.iter().map(|r| r.reward).collect();
    (records, DatasetStats::from_rewards(&rewards))
}

/// `grpo_dataset_<name>_<YYYYMMDD>.json` under `dir`
pub fn write_dataset(
    dir: &Path,
    name: &str,
    date: NaiveDate,
    records: &[GrpoRecord],
) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("grpo_dataset_{}_{}.json", name, date.format("%Y%m%d")));

    let mut writer = BufWriter::new(File::create(&path)?);
    serde_json::to_writer_pretty(&mut writer, records)?;
    writer.flush()?;

    info!(path = %path.display(), examples = records.len(), "💾 GRPO dataset saved");
    Ok(path)
}
