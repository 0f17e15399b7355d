//! Agent Datagen Library
//!
//! Offline synthesis of GRPO and DPO training data from trading agent logs

pub mod clock;
pub mod config;
pub mod cycles;
pub mod dataset;
pub mod error;
pub mod oracle;
pub mod persistence;
pub mod pipeline;
pub mod preference;
pub mod reward;
pub mod snapshots;
pub mod types;
pub mod wallet;

pub use error::{DatagenError, Result};
