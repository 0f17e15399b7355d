//! Oracle module - Multi-source spot price resolution
//!
//! Tries price providers in priority order with per-provider retries and
//! exponential backoff, caches the last good quote per asset, and falls back
//! to a recent cached quote when every provider fails.

mod cache;
pub mod sources;

pub use cache::PriceCache;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{DatagenError, Result};
use sources::{PriceProvider, SourceError};

/// Accepted price for an asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub asset_symbol: String,
    pub price_usd: Decimal,
    pub source_name: String,
    pub fetched_at: DateTime<Utc>,
}

/// Retry budget and backoff bases for one lookup
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base_secs: f64,
    pub rate_limit_backoff_base_secs: f64,
}

impl RetryPolicy {
    /// `base * 2^attempt` after an ordinary failure
    pub fn backoff(&self, attempt: u32) -> Duration {
        Self::exponential(self.backoff_base_secs, attempt)
    }

    /// `rate_limit_base * 2^attempt` after an HTTP 429
    pub fn rate_limit_backoff(&self, attempt: u32) -> Duration {
        Self::exponential(self.rate_limit_backoff_base_secs, attempt)
    }

    fn exponential(base_secs: f64, attempt: u32) -> Duration {
        let secs = base_secs.max(0.0) * 2f64.powi(attempt.min(16) as i32);
        Duration::from_secs_f64(secs)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_secs: 1.0,
            rate_limit_backoff_base_secs: 2.0,
        }
    }
}

/// Resilient spot price lookup over an ordered provider list
pub struct PriceOracle {
    providers: Vec<Box<dyn PriceProvider>>,
    cache: Arc<PriceCache>,
    policy: RetryPolicy,
    /// Oldest cached quote accepted once every provider failed
    stale_fallback: chrono::Duration,
}

impl PriceOracle {
    pub fn new(
        providers: Vec<Box<dyn PriceProvider>>,
        cache: Arc<PriceCache>,
        policy: RetryPolicy,
    ) -> Self {
        let stale_fallback = cache.ttl();
        Self {
            providers,
            cache,
            policy,
            stale_fallback,
        }
    }

    pub fn with_stale_fallback(mut self, max_age: chrono::Duration) -> Self {
        self.stale_fallback = max_age;
        self
    }

    /// USD price for an asset symbol
    pub async fn get_price(&self, asset: &str) -> Result<Decimal> {
        Ok(self.get_quote(asset).await?.price_usd)
    }

    /// Full quote for an asset symbol, served from cache while fresh
    pub async fn get_quote(&self, asset: &str) -> Result<PriceQuote> {
        let symbol = asset.trim().to_uppercase();

        if let Some(quote) = self.cache.fresh(&symbol) {
            debug!(asset = %symbol, source = %quote.source_name, "Price served from cache");
            return Ok(quote);
        }

        let mut errors: Vec<String> = Vec::new();

        for provider in &self.providers {
            for attempt in 0..self.policy.max_retries {
                let retry_follows = attempt + 1 < self.policy.max_retries;

                match self.try_provider(provider.as_ref(), &symbol).await {
                    Ok(price_usd) => {
                        let quote = PriceQuote {
                            asset_symbol: symbol.clone(),
                            price_usd,
                            source_name: provider.name().to_string(),
                            fetched_at: self.cache.now(),
                        };
                        self.cache.store(quote.clone());
                        debug!(
                            asset = %symbol,
                            source = provider.name(),
                            price = %price_usd,
                            attempt,
                            "Price accepted"
                        );
                        return Ok(quote);
                    }
                    Err(SourceError::RateLimited) => {
                        errors.push(format!("{}: {}", provider.name(), SourceError::RateLimited));
                        if retry_follows {
                            let wait = self.policy.rate_limit_backoff(attempt);
                            warn!(
                                source = provider.name(),
                                attempt,
                                wait_secs = wait.as_secs_f64(),
                                "Rate limited, backing off"
                            );
                            tokio::time::sleep(wait).await;
                        }
                    }
                    Err(e) => {
                        let failure = DatagenError::provider(provider.name(), e.to_string());
                        warn!(attempt, error = %failure, "Price lookup failed");
                        errors.push(format!("{}: {}", provider.name(), e));
                        if retry_follows {
                            tokio::time::sleep(self.policy.backoff(attempt)).await;
                        }
                    }
                }
            }
        }

        if let Some(quote) = self.cache.within(&symbol, self.stale_fallback) {
            info!(
                asset = %symbol,
                fetched_at = %quote.fetched_at,
                "Using cached price as fallback"
            );
            return Ok(quote);
        }

        Err(DatagenError::AllProvidersFailed(errors.join("; ")))
    }

    async fn try_provider(
        &self,
        provider: &dyn PriceProvider,
        symbol: &str,
    ) -> std::result::Result<Decimal, SourceError> {
        let body = provider.fetch(symbol).await?;
        let price = provider.extract(symbol, &body)?;
        validate_price(price)
    }
}

/// Accept only finite, strictly positive prices
pub fn validate_price(price: f64) -> std::result::Result<Decimal, SourceError> {
    if !price.is_finite() || price <= 0.0 {
        return Err(SourceError::InvalidPrice(price));
    }
    // Values below Decimal's precision round to zero
    match Decimal::from_f64(price) {
        Some(d) if d > Decimal::ZERO => Ok(d),
        _ => Err(SourceError::InvalidPrice(price)),
    }
}
