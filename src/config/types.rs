//! Enumerated configuration values

use serde::Deserialize;
use std::fmt;

/// Stages of the batch job, run in the configured order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    /// Value the configured wallet and append a snapshot row
    Snapshot,
    /// Build training examples from strategies, cycles and snapshots
    Collect,
    /// Merge per-example files into the GRPO dataset
    Merge,
    /// Repair data points and emit the DPO preference pairs
    Dpo,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStage::Snapshot => write!(f, "snapshot"),
            PipelineStage::Collect => write!(f, "collect"),
            PipelineStage::Merge => write!(f, "merge"),
            PipelineStage::Dpo => write!(f, "dpo"),
        }
    }
}

/// Which examples may be paired against each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingScope {
    /// Cascade separately inside each group of identical prompts
    #[default]
    PerPrompt,
    /// One cascade over every example regardless of prompt
    Global,
}
