//! Training example assembly
//!
//! A [`TrainingExample`] joins a truncated decision cycle with the reward
//! earned by the decision. Examples are written one per file for the GRPO
//! merge and mirrored as [`DataPoint`] lines for the preference stage.

pub mod grpo;
pub mod repair;

pub use grpo::{load_examples, merge_examples, write_dataset, DatasetStats, GrpoMetadata, GrpoRecord};
pub use repair::{repair, repair_directory, RecoveryStrategy, RepairReport, RepairSummary};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::cycles::SentinelRule;
use crate::error::{DatagenError, Result};
use crate::reward::{RewardComponents, RewardOutcome};
use crate::snapshots::WalletChange;
use crate::types::{DecisionCycle, PortfolioSnapshot, PromptMessage};

/// One GRPO training example, as stored in `grpo_example_*.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingExample {
    pub session_id: String,
    /// System and user messages only
    pub prompt: Vec<PromptMessage>,
    pub response: PromptMessage,
    /// Strategy description behind the decision
    #[serde(default)]
    pub reasoning: Option<String>,
    pub reward: f64,
    pub reward_components: RewardComponents,
    #[serde(rename = "portfolio_start")]
    pub portfolio_before: PortfolioSnapshot,
    #[serde(rename = "portfolio_end")]
    pub portfolio_after: PortfolioSnapshot,
    /// When the decision was logged
    pub decided_at: DateTime<Utc>,
    #[serde(rename = "timestamp")]
    pub produced_at: DateTime<Utc>,
    /// Ranking value for preference pairing (percentage wallet change)
    #[serde(default)]
    pub score: f64,
}

/// Everything the reward side contributes to an example
#[derive(Debug, Clone)]
pub struct RewardData {
    pub outcome: RewardOutcome,
    pub change: WalletChange,
    pub reasoning: Option<String>,
    pub decided_at: DateTime<Utc>,
}

/// `{chat_history, response, score}` line consumed by the preference stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub chat_history: Vec<PromptMessage>,
    pub response: PromptMessage,
    #[serde(default)]
    pub score: f64,
}

impl TrainingExample {
    pub fn data_point(&self) -> DataPoint {
        DataPoint {
            chat_history: self.prompt.clone(),
            response: self.response.clone(),
            score: self.score,
        }
    }
}

/// Combine a cycle with its reward into a training example
pub fn assemble(
    cycle: &DecisionCycle,
    rule: &SentinelRule,
    reward: RewardData,
    produced_at: DateTime<Utc>,
) -> Result<TrainingExample> {
    let sample = rule.split(cycle).ok_or_else(|| {
        DatagenError::MalformedRecord(format!(
            "cycle of session {} starting {} has fewer than two messages",
            cycle.session_id, cycle.start_timestamp
        ))
    })?;

    let score = reward.change.score();
    Ok(TrainingExample {
        session_id: sample.session_id,
        prompt: sample.prompt,
        response: sample.response,
        reasoning: reward.reasoning,
        reward: reward.outcome.reward,
        reward_components: reward.outcome.components,
        portfolio_before: reward.change.before,
        portfolio_after: reward.change.after,
        decided_at: reward.decided_at,
        produced_at,
        score,
    })
}

/// Writes per-example files and data-point batches
#[derive(Debug, Clone)]
pub struct ExampleWriter {
    examples_dir: PathBuf,
    data_points_dir: PathBuf,
}

impl ExampleWriter {
    pub fn new(examples_dir: impl Into<PathBuf>, data_points_dir: impl Into<PathBuf>) -> Result<Self> {
        let examples_dir = examples_dir.into();
        let data_points_dir = data_points_dir.into();
        fs::create_dir_all(&examples_dir)?;
        fs::create_dir_all(&data_points_dir)?;
        Ok(Self {
            examples_dir,
            data_points_dir,
        })
    }

    pub fn examples_dir(&self) -> &Path {
        &self.examples_dir
    }

    /// `grpo_example_<decided_at>_<strategy_id>.json`, pretty-printed.
    /// The name depends only on the decision, so re-runs overwrite it.
    pub fn write_example(&self, example: &TrainingExample, strategy_id: i64) -> Result<PathBuf> {
        let path = self.examples_dir.join(format!(
            "grpo_example_{}_{}.json",
            example.decided_at.format("%Y%m%d_%H%M%S"),
            strategy_id
        ));
        let mut writer = BufWriter::new(File::create(&path)?);
        serde_json::to_writer_pretty(&mut writer, example)?;
        writer.flush()?;

        debug!(path = %path.display(), reward = example.reward, "Saved training example");
        Ok(path)
    }

    /// One JSONL batch named after the first and last decision times
    pub fn write_data_points(&self, examples: &[TrainingExample]) -> Result<Option<PathBuf>> {
        let first = examples.iter().map(|e| e.decided_at).min();
        let last = examples.iter().map(|e| e.decided_at).max();
        let (Some(first), Some(last)) = (first, last) else {
            return Ok(None);
        };

        let path = self.data_points_dir.join(format!(
            "data_points_file_{}_to_{}.jsonl",
            first.format("%y_%m_%d_%H_%M"),
            last.format("%y_%m_%d_%H_%M")
        ));
        let mut writer = BufWriter::new(File::create(&path)?);
        for example in examples {
            serde_json::to_writer(&mut writer, &example.data_point())?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;

        info!(path = %path.display(), points = examples.len(), "📝 Data points written");
        Ok(Some(path))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycles::CycleSegmenter;
    use crate::reward::RewardCalculator;
    use crate::types::{ChatMessage, Role};
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn temp_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("datagen_dataset_{}_{}", name, uuid::Uuid::new_v4()))
    }

    fn cycle() -> DecisionCycle {
        let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let msg = |id: i64, role: Role, content: &str| ChatMessage {
            sequence_id: id,
            session_id: "agent_007".to_string(),
            role,
            content: content.to_string(),
            timestamp: t0 + Duration::seconds(id),
        };
        let segmenter = CycleSegmenter::new(vec![
            msg(1, Role::System, "you trade"),
            msg(2, Role::User, "prices up"),
            msg(3, Role::Assistant, "buy ETH"),
        ]);
        segmenter.segment("agent_007", t0 + Duration::seconds(10)).unwrap()
    }

    fn reward_data() -> RewardData {
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let change = WalletChange::between(
            fixtures::snapshot(dec!(1000), at),
            fixtures::snapshot(dec!(1100), at + Duration::hours(1)),
        );
        RewardData {
            outcome: RewardCalculator::default().compute_reward(&change.before, &change.after),
            change,
            reasoning: Some("trend".to_string()),
            decided_at: at,
        }
    }

    #[test]
    fn assemble_splits_prompt_and_response() {
        let rule = SentinelRule::new("You just learnt the following information", false);
        let example = assemble(&cycle(), &rule, reward_data(), Utc::now()).unwrap();

        assert_eq!(example.prompt.len(), 2);
        assert_eq!(example.response.content, "buy ETH");
        assert!((example.score - 10.0).abs() < 1e-9);
        assert_eq!(example.reasoning.as_deref(), Some("trend"));
    }

    #[test]
    fn stored_example_uses_portfolio_start_and_end_keys() {
        let example = fixtures::example("sys", "buy", dec!(1000), dec!(1100));
        let json = serde_json::to_value(&example).unwrap();
        assert!(json.get("portfolio_start").is_some());
        assert!(json.get("portfolio_end").is_some());
        assert!(json.get("timestamp").is_some());

        let back: TrainingExample = serde_json::from_value(json).unwrap();
        assert_eq!(back, example);
    }

    #[test]
    fn writes_example_and_data_point_files() {
        let root = temp_dir("writer");
        let writer = ExampleWriter::new(root.join("grpo"), root.join("data_points")).unwrap();
        let example = fixtures::example("sys", "buy", dec!(1000), dec!(1100));

        let path = writer.write_example(&example, 0).unwrap();
        assert_eq!(
            path.file_name().unwrap().to_string_lossy(),
            "grpo_example_20250301_120000_0.json"
        );

        let points = writer
            .write_data_points(&[example.clone(), example])
            .unwrap()
            .unwrap();
        assert_eq!(
            points.file_name().unwrap().to_string_lossy(),
            "data_points_file_25_03_01_12_00_to_25_03_01_12_00.jsonl"
        );
        let content = fs::read_to_string(&points).unwrap();
        assert_eq!(content.lines().count(), 2);
        let first: DataPoint = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(first.response.content, "buy");

        assert!(writer.write_data_points(&[]).unwrap().is_none());
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn rewriting_an_example_reuses_its_file() {
        let root = temp_dir("rewrite");
        let writer = ExampleWriter::new(root.join("grpo"), root.join("data_points")).unwrap();
        let mut example = fixtures::example("sys", "buy", dec!(1000), dec!(1100));

        let first = writer.write_example(&example, 7).unwrap();
        example.produced_at = example.produced_at + Duration::minutes(5);
        let second = writer.write_example(&example, 7).unwrap();

        assert_eq!(first, second);
        assert_eq!(fs::read_dir(root.join("grpo")).unwrap().count(), 1);
        let stored: TrainingExample =
            serde_json::from_str(&fs::read_to_string(&second).unwrap()).unwrap();
        assert_eq!(stored.produced_at, example.produced_at);

        let _ = fs::remove_dir_all(&root);
    }
}
