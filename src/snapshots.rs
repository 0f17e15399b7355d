//! Tolerance-windowed snapshot matching

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::{DatagenError, Result};
use crate::types::{format_timestamp, PortfolioSnapshot};

/// Wallet snapshots of one agent, ordered by capture time
#[derive(Debug, Clone)]
pub struct SnapshotMatcher {
    agent_id: String,
    snapshots: Vec<PortfolioSnapshot>,
}

impl SnapshotMatcher {
    pub fn new(agent_id: impl Into<String>, mut snapshots: Vec<PortfolioSnapshot>) -> Self {
        snapshots.sort_by_key(|s| s.captured_at);
        Self {
            agent_id: agent_id.into(),
            snapshots,
        }
    }

    /// Closest snapshot inside `[target - tol, target + tol]`.
    ///
    /// Equal distances resolve to the earlier capture.
    pub fn nearest_snapshot(
        &self,
        target: DateTime<Utc>,
        tolerance_secs: i64,
    ) -> Result<&PortfolioSnapshot> {
        let not_found = || DatagenError::SnapshotNotFound {
            agent_id: self.agent_id.clone(),
            target: format_timestamp(&target),
            tolerance_secs,
        };
        let tolerance = Duration::try_seconds(tolerance_secs).ok_or_else(not_found)?;
        let lo = target
            .checked_sub_signed(tolerance)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let hi = target
            .checked_add_signed(tolerance)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        self.snapshots
            .iter()
            .filter(|s| s.captured_at >= lo && s.captured_at <= hi)
            .min_by_key(|s| ((s.captured_at - target).num_milliseconds().abs(), s.captured_at))
            .ok_or_else(not_found)
    }

    /// Match both ends of a decision and measure the wallet change
    pub fn compare(
        &self,
        before_target: DateTime<Utc>,
        after_target: DateTime<Utc>,
        tolerance_secs: i64,
    ) -> Result<WalletChange> {
        let before = self.nearest_snapshot(before_target, tolerance_secs)?;
        let after = self.nearest_snapshot(after_target, tolerance_secs)?;
        Ok(WalletChange::between(before.clone(), after.clone()))
    }
}

/// Difference between two matched snapshots
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WalletChange {
    pub before: PortfolioSnapshot,
    pub after: PortfolioSnapshot,
    pub absolute_change_usd: Decimal,
    /// Zero when the starting value is not positive
    pub percentage_change: Decimal,
    pub before_time: DateTime<Utc>,
    pub after_time: DateTime<Utc>,
}

impl WalletChange {
    pub fn between(before: PortfolioSnapshot, after: PortfolioSnapshot) -> Self {
        let absolute_change_usd = after.total_value_usd - before.total_value_usd;
        let percentage_change = if before.total_value_usd > Decimal::ZERO {
            absolute_change_usd
                .checked_div(before.total_value_usd)
                .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
                .unwrap_or(Decimal::ZERO)
        } else {
            Decimal::ZERO
        };

        Self {
            before_time: before.captured_at,
            after_time: after.captured_at,
            before,
            after,
            absolute_change_usd,
            percentage_change,
        }
    }

    /// Ranking score for preference pairing
    pub fn score(&self) -> f64 {
        self.percentage_change.to_f64().unwrap_or(0.0)
    }
}
