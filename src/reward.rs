//! Reward scalar for a decision, from the wallet value before and after it

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{DatagenError, Result};
use crate::types::PortfolioSnapshot;

const WEIGHT_ABSOLUTE: f64 = 0.3;
const WEIGHT_PERCENTAGE: f64 = 0.4;
const WEIGHT_OUTPERFORMANCE: f64 = 0.2;
const WEIGHT_RISK: f64 = 0.1;
const RISK_SCALE: f64 = 10.0;

const RISK_DIVERSIFIED: f64 = 1.0;
const RISK_CONCENTRATED: f64 = 0.8;

/// Multiplier applied when the strategy did not execute cleanly
pub const EXECUTION_PENALTY: f64 = 0.5;

/// Breakdown stored next to each reward
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RewardComponents {
    Computed {
        absolute_change: f64,
        percentage_change: f64,
        market_outperformance: f64,
        risk_factor: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        execution_penalty: Option<f64>,
    },
    Failed {
        error: String,
    },
}

impl RewardComponents {
    pub fn is_failed(&self) -> bool {
        matches!(self, RewardComponents::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardOutcome {
    pub reward: f64,
    pub components: RewardComponents,
}

#[derive(Debug, Clone, Copy)]
pub struct RewardCalculator {
    market_baseline: f64,
}

impl Default for RewardCalculator {
    fn default() -> Self {
        Self {
            market_baseline: 0.5,
        }
    }
}

impl RewardCalculator {
    pub fn new(market_baseline: f64) -> Self {
        Self { market_baseline }
    }

    /// Reward for a successfully executed decision
    pub fn compute_reward(&self, before: &PortfolioSnapshot, after: &PortfolioSnapshot) -> RewardOutcome {
        self.compute_with_execution(before, after, true)
    }

    /// Never fails: an error collapses to reward 0 with a single `error` component
    pub fn compute_with_execution(
        &self,
        before: &PortfolioSnapshot,
        after: &PortfolioSnapshot,
        execution_succeeded: bool,
    ) -> RewardOutcome {
        match self.try_compute(before, after) {
            Ok((reward, absolute, percentage, outperformance, risk)) => {
                let (reward, execution_penalty) = if execution_succeeded {
                    (reward, None)
                } else {
                    (reward * EXECUTION_PENALTY, Some(EXECUTION_PENALTY))
                };
                debug!(
                    reward,
                    absolute_change = absolute,
                    percentage_change = percentage,
                    risk_factor = risk,
                    penalized = !execution_succeeded,
                    "Reward computed"
                );
                RewardOutcome {
                    reward,
                    components: RewardComponents::Computed {
                        absolute_change: absolute,
                        percentage_change: percentage,
                        market_outperformance: outperformance,
                        risk_factor: risk,
                        execution_penalty,
                    },
                }
            }
            Err(e) => {
                warn!(error = %e, "Reward computation failed, scoring 0");
                RewardOutcome {
                    reward: 0.0,
                    components: RewardComponents::Failed {
                        error: e.to_string(),
                    },
                }
            }
        }
    }

    fn try_compute(
        &self,
        before: &PortfolioSnapshot,
        after: &PortfolioSnapshot,
    ) -> Result<(f64, f64, f64, f64, f64)> {
        let start = before.total_value_usd;
        let change = after
            .total_value_usd
            .checked_sub(start)
            .ok_or_else(|| DatagenError::RewardComputation("value change overflows".to_string()))?;

        let absolute = to_f64(change, "absolute change")?;
        let percentage = if start > Decimal::ZERO {
            let pct = change
                .checked_div(start)
                .and_then(|r| r.checked_mul(Decimal::ONE_HUNDRED))
                .ok_or_else(|| {
                    DatagenError::RewardComputation("percentage change overflows".to_string())
                })?;
            to_f64(pct, "percentage change")?
        } else {
            0.0
        };

        let outperformance = percentage - self.market_baseline;
        let risk = if after.distinct_token_count() > 1 {
            RISK_DIVERSIFIED
        } else {
            RISK_CONCENTRATED
        };

        let reward = WEIGHT_ABSOLUTE * absolute
            + WEIGHT_PERCENTAGE * percentage
            + WEIGHT_OUTPERFORMANCE * outperformance
            + WEIGHT_RISK * risk * RISK_SCALE;

        if !reward.is_finite() || !outperformance.is_finite() {
            return Err(DatagenError::RewardComputation(format!(
                "non-finite reward from change {}",
                change
            )));
        }

        Ok((reward, absolute, percentage, outperformance, risk))
    }
}

fn to_f64(value: Decimal, what: &str) -> Result<f64> {
    value
        .to_f64()
        .filter(|v| v.is_finite())
        .ok_or_else(|| DatagenError::RewardComputation(format!("{} {} is not representable", what, value)))
}
