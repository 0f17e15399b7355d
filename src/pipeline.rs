//! Batch job orchestration
//!
//! Runs the configured stages in order. Each stage reads what earlier runs
//! left on disk, so stages can also be run one at a time.

use anyhow::{Context, Result};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{AppConfig, PipelineStage};
use crate::cycles::{CycleSegmenter, SentinelRule};
use crate::dataset::{self, assemble, ExampleWriter, RewardData};
use crate::oracle::sources::{build_providers, CoinGeckoTokenPrices, HttpFetcher};
use crate::oracle::{PriceCache, PriceOracle, RetryPolicy};
use crate::persistence::CsvLogStore;
use crate::preference;
use crate::reward::RewardCalculator;
use crate::snapshots::SnapshotMatcher;
use crate::wallet::{ValuationSettings, WalletValuator};

/// Outcome of one stage
#[derive(Debug, Clone, PartialEq)]
pub struct StageReport {
    pub stage: PipelineStage,
    /// Records written (examples, dataset rows, pairs, snapshots)
    pub produced: usize,
    /// Input records dropped along the way
    pub skipped: usize,
    pub output: Option<PathBuf>,
}

impl StageReport {
    fn new(stage: PipelineStage) -> Self {
        Self {
            stage,
            produced: 0,
            skipped: 0,
            output: None,
        }
    }
}

impl fmt::Display for StageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: produced={} skipped={}",
            self.stage, self.produced, self.skipped
        )?;
        if let Some(path) = &self.output {
            write!(f, " output={}", path.display())?;
        }
        Ok(())
    }
}

pub struct Pipeline {
    config: AppConfig,
    clock: Arc<dyn Clock>,
}

impl Pipeline {
    pub fn new(config: AppConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    pub async fn run(&self) -> Result<Vec<StageReport>> {
        let mut reports = Vec::with_capacity(self.config.pipeline.stages.len());
        for stage in &self.config.pipeline.stages {
            info!(stage = %stage, "▶️ Stage started");
            let report = self.run_stage(*stage).await?;
            info!(
                stage = %stage,
                produced = report.produced,
                skipped = report.skipped,
                "✅ Stage finished"
            );
            reports.push(report);
        }
        Ok(reports)
    }

    pub async fn run_stage(&self, stage: PipelineStage) -> Result<StageReport> {
        let result = match stage {
            PipelineStage::Snapshot => self.snapshot().await,
            PipelineStage::Collect => self.collect(),
            PipelineStage::Merge => self.merge(),
            PipelineStage::Dpo => self.dpo(),
        };
        result.with_context(|| format!("Stage {} failed", stage))
    }

    fn examples_dir(&self) -> PathBuf {
        self.config.output_path(&self.config.grpo.examples_dir)
    }

    fn data_points_dir(&self) -> PathBuf {
        self.config.output_path(&self.config.grpo.data_points_dir)
    }

    /// Value the wallet once and append the snapshot row
    async fn snapshot(&self) -> Result<StageReport> {
        let oracle_cfg = &self.config.oracle;
        let wallet_cfg = &self.config.wallet;

        let http = HttpFetcher::new(Duration::from_secs(oracle_cfg.request_timeout_secs))?;
        let providers = build_providers(&oracle_cfg.providers, &http)?;
        let cache = Arc::new(PriceCache::new(
            self.clock.clone(),
            window("oracle.cache_ttl_secs", oracle_cfg.cache_ttl_secs)?,
        ));
        let oracle = PriceOracle::new(
            providers,
            cache,
            RetryPolicy {
                max_retries: oracle_cfg.max_retries,
                backoff_base_secs: oracle_cfg.backoff_base_secs,
                rate_limit_backoff_base_secs: oracle_cfg.rate_limit_backoff_base_secs,
            },
        )
        .with_stale_fallback(window(
            "oracle.stale_fallback_secs",
            oracle_cfg.stale_fallback_secs,
        )?);

        let valuator = WalletValuator::new(
            Arc::new(oracle),
            Box::new(CoinGeckoTokenPrices::new(http, &wallet_cfg.token_price_url)),
            self.clock.clone(),
            ValuationSettings {
                native_asset: oracle_cfg.native_asset.clone(),
                native_decimals: wallet_cfg.native_decimals,
                native_reserve: Decimal::from_f64(wallet_cfg.native_reserve)
                    .unwrap_or(Decimal::ZERO),
                token_retry: RetryPolicy {
                    max_retries: wallet_cfg.token_max_retries,
                    backoff_base_secs: wallet_cfg.token_backoff_base_secs,
                    rate_limit_backoff_base_secs: wallet_cfg.token_backoff_base_secs,
                },
            },
        );

        let store = CsvLogStore::new(&self.config.data);
        let holdings = store.load_holdings()?;
        let snapshot = valuator
            .value_wallet(&holdings.address, &holdings)
            .await
            .context("Wallet valuation failed")?;
        let path = store.append_snapshot(&self.config.data.agent_id, &snapshot)?;

        let mut report = StageReport::new(PipelineStage::Snapshot);
        report.produced = 1;
        report.skipped = snapshot
            .token_balances
            .iter()
            .filter(|t| t.price_usd.is_none())
            .count();
        report.output = Some(path);
        Ok(report)
    }

    /// One training example per strategy with a cycle and both snapshots
    fn collect(&self) -> Result<StageReport> {
        let agent_id = &self.config.data.agent_id;
        let store = CsvLogStore::new(&self.config.data);
        let messages = store.load_chat_messages()?;
        let strategies = store.load_strategies(agent_id)?;
        let snapshots = store.load_snapshots(agent_id)?;

        let mut report = StageReport::new(PipelineStage::Collect);
        report.skipped = messages.skipped + strategies.skipped + snapshots.skipped;

        let segmenter = CycleSegmenter::new(messages.records);
        let matcher = SnapshotMatcher::new(agent_id.clone(), snapshots.records);
        let calculator = RewardCalculator::new(self.config.reward.market_baseline);
        let rule = SentinelRule::new(
            self.config.cycles.sentinel.clone(),
            self.config.cycles.keep_sentinel_reply,
        );
        let writer = ExampleWriter::new(self.examples_dir(), self.data_points_dir())?;
        let tolerance = self.config.matching.tolerance_secs;
        let horizon = window(
            "matching.reward_horizon_secs",
            self.config.matching.reward_horizon_secs,
        )?;

        let mut examples = Vec::new();
        for strategy in &strategies.records {
            // The agent's chat session is keyed by its id
            let Some(cycle) = segmenter.segment(agent_id, strategy.created_at) else {
                debug!(strategy = strategy.id, "No decision cycle before strategy");
                report.skipped += 1;
                continue;
            };

            let Some(after_target) = strategy.created_at.checked_add_signed(horizon) else {
                warn!(strategy = strategy.id, "Reward horizon overflows the decision time");
                report.skipped += 1;
                continue;
            };
            let change = match matcher.compare(strategy.created_at, after_target, tolerance) {
                Ok(change) => change,
                Err(e) if e.is_skippable() => {
                    warn!(strategy = strategy.id, error = %e, "Skipping strategy");
                    report.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let outcome = calculator.compute_with_execution(
                &change.before,
                &change.after,
                strategy.execution_succeeded(),
            );
            let reward = RewardData {
                outcome,
                change,
                reasoning: strategy.reasoning().map(str::to_string),
                decided_at: strategy.created_at,
            };

            match assemble(&cycle, &rule, reward, self.clock.now()) {
                Ok(example) => {
                    writer.write_example(&example, strategy.id)?;
                    examples.push(example);
                }
                Err(e) if e.is_skippable() => {
                    warn!(strategy = strategy.id, error = %e, "Skipping strategy");
                    report.skipped += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        writer.write_data_points(&examples)?;
        report.produced = examples.len();
        report.output = Some(writer.examples_dir().to_path_buf());
        Ok(report)
    }

    /// Merge per-example files into the GRPO dataset
    fn merge(&self) -> Result<StageReport> {
        let loaded = dataset::load_examples(&self.examples_dir())?;
        let mut report = StageReport::new(PipelineStage::Merge);
        report.skipped = loaded.skipped;

        if loaded.examples.is_empty() {
            warn!(dir = %self.examples_dir().display(), "No examples found, nothing to merge");
            return Ok(report);
        }

        let (records, stats) = dataset::merge_examples(&loaded.examples);
        let path = dataset::write_dataset(
            &PathBuf::from(&self.config.data.output_dir),
            &self.config.grpo.dataset_name,
            self.clock.now().date_naive(),
            &records,
        )?;

        info!(
            files = loaded.files_read,
            examples = stats.count,
            mean_reward = stats.mean_reward,
            min_reward = stats.min_reward,
            max_reward = stats.max_reward,
            "📊 Dataset statistics"
        );

        report.produced = records.len();
        report.output = Some(path);
        Ok(report)
    }

    /// Repair data points, then cascade them into preference pairs
    fn dpo(&self) -> Result<StageReport> {
        let repaired = dataset::repair_directory(&self.data_points_dir(), None)?;
        let (items, skipped) = preference::load_data_items(&repaired.output_dir)?;
        let pairs = preference::build_pairs_scoped(&items, self.config.dpo.pairing_scope);

        let path = self.config.output_path(&self.config.dpo.output_file);
        preference::write_pairs(&path, &pairs)?;

        info!(
            items = items.len(),
            pairs = pairs.len(),
            scope = ?self.config.dpo.pairing_scope,
            "Preference dataset built"
        );

        let mut report = StageReport::new(PipelineStage::Dpo);
        report.produced = pairs.len();
        report.skipped = repaired.discarded + skipped;
        report.output = Some(path);
        Ok(report)
    }
}

/// Configured window in seconds, rejected when chrono cannot represent it
fn window(key: &str, secs: i64) -> Result<chrono::Duration> {
    chrono::Duration::try_seconds(secs)
        .with_context(|| format!("{} out of range: {}", key, secs))
}
