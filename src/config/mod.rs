//! Configuration management for the datagen batch job
//!
//! Defaults in code, optional TOML files, then environment variables
//! (`DATAGEN__SECTION__KEY`) loaded on top of `.env`.

mod types;

pub use types::*;

use anyhow::{bail, Context, Result};
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Upper bound for every time window setting (one year)
pub const MAX_WINDOW_SECS: i64 = 365 * 24 * 3600;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub data: DataConfig,
    pub oracle: OracleConfig,
    pub wallet: WalletConfig,
    pub cycles: CyclesConfig,
    pub matching: MatchingConfig,
    pub reward: RewardConfig,
    pub grpo: GrpoConfig,
    pub dpo: DpoConfig,
    pub logging: LoggingConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataConfig {
    /// Directory holding the exported log tables
    pub data_dir: String,
    /// Agent whose logs are processed (also the chat session id)
    pub agent_id: String,
    pub chat_file: String,
    pub strategies_file: String,
    pub snapshots_file: String,
    /// Raw wallet balances for the snapshot stage
    pub holdings_file: String,
    /// Root for every generated artifact
    pub output_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OracleConfig {
    /// Asset priced for the native wallet balance
    pub native_asset: String,
    /// Providers in priority order
    pub providers: Vec<String>,
    pub max_retries: u32,
    pub request_timeout_secs: u64,
    /// Cache hits younger than this skip the network entirely
    pub cache_ttl_secs: i64,
    /// Maximum cache age accepted when every provider failed
    pub stale_fallback_secs: i64,
    pub backoff_base_secs: f64,
    /// Base delay after an HTTP 429
    pub rate_limit_backoff_base_secs: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    pub native_decimals: u32,
    /// Native amount held back for gas (reported, not deducted)
    pub native_reserve: f64,
    pub token_max_retries: u32,
    pub token_backoff_base_secs: f64,
    pub token_price_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CyclesConfig {
    /// Phrase marking the user message that closes a training sample
    pub sentinel: String,
    /// Also keep the message right after the sentinel
    pub keep_sentinel_reply: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MatchingConfig {
    pub tolerance_secs: i64,
    /// Offset from strategy creation to the "after" snapshot target
    pub reward_horizon_secs: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RewardConfig {
    /// Percentage return the agent is expected to beat
    pub market_baseline: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GrpoConfig {
    pub dataset_name: String,
    pub examples_dir: String,
    pub data_points_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DpoConfig {
    pub pairing_scope: PairingScope,
    pub output_file: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// JSON lines instead of human-readable output
    pub json: bool,
    /// Fallback filter when RUST_LOG is unset
    pub filter: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub stages: Vec<PipelineStage>,
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Self::with_defaults()?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (DATAGEN__*)
            .add_source(
                Environment::with_prefix("DATAGEN")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("pipeline.stages")
                    .with_list_parse_key("oracle.providers"),
            )
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        Ok(app_config)
    }

    /// Configuration built from the in-code defaults alone
    pub fn defaults() -> Result<Self> {
        Self::with_defaults()?
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    fn with_defaults() -> Result<ConfigBuilder<DefaultState>> {
        let builder = Config::builder()
            // Data defaults
            .set_default("data.data_dir", "./data")?
            .set_default("data.agent_id", "agent_007")?
            .set_default("data.chat_file", "chat_history.csv")?
            .set_default("data.strategies_file", "strategies.csv")?
            .set_default("data.snapshots_file", "wallet_snapshots.csv")?
            .set_default("data.holdings_file", "holdings.json")?
            .set_default("data.output_dir", "./data/output")?
            // Oracle defaults
            .set_default("oracle.native_asset", "ETH")?
            .set_default(
                "oracle.providers",
                vec!["coingecko", "binance", "kraken", "huobi"],
            )?
            .set_default("oracle.max_retries", 3)?
            .set_default("oracle.request_timeout_secs", 10)?
            .set_default("oracle.cache_ttl_secs", 60)?
            .set_default("oracle.stale_fallback_secs", 60)?
            .set_default("oracle.backoff_base_secs", 1.0)?
            .set_default("oracle.rate_limit_backoff_base_secs", 2.0)?
            // Wallet defaults
            .set_default("wallet.native_decimals", 18)?
            .set_default("wallet.native_reserve", 0.01)?
            .set_default("wallet.token_max_retries", 3)?
            .set_default("wallet.token_backoff_base_secs", 1.0)?
            .set_default(
                "wallet.token_price_url",
                "https://api.coingecko.com/api/v3/simple/token_price/ethereum",
            )?
            // Cycle defaults
            .set_default(
                "cycles.sentinel",
                "You just learnt the following information",
            )?
            .set_default("cycles.keep_sentinel_reply", false)?
            // Matching defaults
            .set_default("matching.tolerance_secs", 60)?
            .set_default("matching.reward_horizon_secs", 3600)?
            // Reward defaults
            .set_default("reward.market_baseline", 0.5)?
            // Dataset defaults
            .set_default("grpo.dataset_name", "trading")?
            .set_default("grpo.examples_dir", "grpo")?
            .set_default("grpo.data_points_dir", "data_points")?
            .set_default("dpo.pairing_scope", "per_prompt")?
            .set_default("dpo.output_file", "dpo/preference_pairs.jsonl")?
            // Logging defaults
            .set_default("logging.json", false)?
            .set_default("logging.filter", "info,agent_datagen=debug")?
            // Pipeline defaults
            .set_default("pipeline.stages", vec!["collect", "merge", "dpo"])?;

        Ok(builder)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let stages_need_logs = self
            .pipeline
            .stages
            .iter()
            .any(|s| matches!(s, PipelineStage::Collect | PipelineStage::Snapshot));
        if stages_need_logs && !Path::new(&self.data.data_dir).is_dir() {
            bail!("Data directory {} does not exist", self.data.data_dir);
        }
        if self.pipeline.stages.is_empty() {
            bail!("pipeline.stages must name at least one stage");
        }
        if self.oracle.providers.is_empty() {
            bail!("oracle.providers must list at least one price provider");
        }
        if self.oracle.max_retries == 0 || self.wallet.token_max_retries == 0 {
            bail!("retry counts must be at least 1");
        }
        let windows = [
            ("matching.tolerance_secs", self.matching.tolerance_secs),
            ("matching.reward_horizon_secs", self.matching.reward_horizon_secs),
            ("oracle.cache_ttl_secs", self.oracle.cache_ttl_secs),
            ("oracle.stale_fallback_secs", self.oracle.stale_fallback_secs),
        ];
        for (key, secs) in windows {
            if !(0..=MAX_WINDOW_SECS).contains(&secs) {
                bail!("{} must be between 0 and {} seconds, got {}", key, MAX_WINDOW_SECS, secs);
            }
        }
        if self.cycles.sentinel.trim().is_empty() {
            bail!("cycles.sentinel must not be empty");
        }
        Ok(())
    }

    pub fn output_path(&self, relative: &str) -> PathBuf {
        Path::new(&self.data.output_dir).join(relative)
    }

    /// Generate a one-line digest of the config for logging
    pub fn digest(&self) -> String {
        format!(
            "agent={} data_dir={} stages={:?} providers={:?} tolerance={}s horizon={}s pairing={:?}",
            self.data.agent_id,
            self.data.data_dir,
            self.pipeline.stages,
            self.oracle.providers,
            self.matching.tolerance_secs,
            self.matching.reward_horizon_secs,
            self.dpo.pairing_scope
        )
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}
