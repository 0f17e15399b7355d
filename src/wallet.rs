//! Wallet valuation
//!
//! Turns raw on-chain balances into a [`PortfolioSnapshot`]: the native
//! balance is priced through the [`PriceOracle`], every token is priced on
//! its own with a bounded retry loop. All money is `Decimal`.

use ethers::types::Address;
use ethers::utils::to_checksum;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{DatagenError, Result};
use crate::oracle::sources::TokenPriceSource;
use crate::oracle::{validate_price, PriceOracle, RetryPolicy};
use crate::types::{PortfolioSnapshot, TokenBalance};

/// Raw balance data for one wallet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletHoldings {
    pub address: String,
    /// Native balance in base units (wei)
    #[serde(deserialize_with = "de_raw_amount")]
    pub native_balance_raw: u128,
    #[serde(default)]
    pub tokens: Vec<RawTokenHolding>,
}

/// ERC-20 balance in base units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTokenHolding {
    pub address: String,
    pub symbol: String,
    #[serde(deserialize_with = "de_raw_amount")]
    pub raw_balance: u128,
    pub decimals: u32,
}

/// Raw amounts exceed u64, so they usually travel as strings
fn de_raw_amount<'de, D>(deserializer: D) -> std::result::Result<u128, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawAmount {
        Text(String),
        Int(u64),
    }

    match RawAmount::deserialize(deserializer)? {
        RawAmount::Int(n) => Ok(n as u128),
        RawAmount::Text(s) => s
            .trim()
            .parse::<u128>()
            .map_err(|e| serde::de::Error::custom(format!("invalid raw amount {:?}: {}", s, e))),
    }
}

/// Scale a base-unit integer by its decimal exponent
pub fn scale_raw_amount(raw: u128, decimals: u32) -> Option<Decimal> {
    let mantissa = i128::try_from(raw).ok()?;
    Decimal::try_from_i128_with_scale(mantissa, decimals)
        .ok()
        .map(|d| d.normalize())
}

/// Checksummed (EIP-55) form of a hex address
pub fn checksum_address(address: &str) -> Option<String> {
    address
        .trim()
        .parse::<Address>()
        .ok()
        .map(|addr| to_checksum(&addr, None))
}

#[derive(Debug, Clone)]
pub struct ValuationSettings {
    pub native_asset: String,
    pub native_decimals: u32,
    pub native_reserve: Decimal,
    pub token_retry: RetryPolicy,
}

pub struct WalletValuator {
    oracle: Arc<PriceOracle>,
    token_prices: Box<dyn TokenPriceSource>,
    clock: Arc<dyn Clock>,
    settings: ValuationSettings,
}

impl WalletValuator {
    pub fn new(
        oracle: Arc<PriceOracle>,
        token_prices: Box<dyn TokenPriceSource>,
        clock: Arc<dyn Clock>,
        settings: ValuationSettings,
    ) -> Self {
        Self {
            oracle,
            token_prices,
            clock,
            settings,
        }
    }

    /// Value a wallet; fails only when the native price is unavailable
    pub async fn value_wallet(
        &self,
        address: &str,
        holdings: &WalletHoldings,
    ) -> Result<PortfolioSnapshot> {
        let checksummed = checksum_address(address).ok_or_else(|| {
            DatagenError::MalformedRecord(format!("invalid wallet address {:?}", address))
        })?;

        let native_balance =
            scale_raw_amount(holdings.native_balance_raw, self.settings.native_decimals)
                .ok_or_else(|| {
                    DatagenError::MalformedRecord(format!(
                        "native balance {} not representable",
                        holdings.native_balance_raw
                    ))
                })?;

        let native_price = self.oracle.get_price(&self.settings.native_asset).await?;
        let mut total_value_usd = checked_mul(native_balance, native_price)?;

        debug!(
            wallet = %checksummed,
            native_balance = %native_balance,
            native_price = %native_price,
            "Native balance valued"
        );

        let mut token_balances = Vec::with_capacity(holdings.tokens.len());
        for token in &holdings.tokens {
            let Some(balance) = scale_raw_amount(token.raw_balance, token.decimals) else {
                warn!(
                    token = %token.address,
                    raw_balance = %token.raw_balance,
                    decimals = token.decimals,
                    "Token balance not representable, skipping"
                );
                continue;
            };
            if balance.is_zero() {
                continue;
            }

            let address = checksum_address(&token.address).unwrap_or_else(|| token.address.clone());
            let price_usd = self.token_price(&token.address).await;
            let value_usd = match price_usd {
                Some(price) => {
                    let value = checked_mul(balance, price)?;
                    total_value_usd = total_value_usd
                        .checked_add(value)
                        .ok_or_else(|| overflow("total value"))?;
                    Some(value)
                }
                None => None,
            };

            token_balances.push(TokenBalance {
                address,
                symbol: token.symbol.clone(),
                balance,
                price_usd,
                value_usd,
            });
        }

        let priced = token_balances.iter().filter(|t| t.price_usd.is_some()).count();
        info!(
            wallet = %checksummed,
            total_value_usd = %total_value_usd,
            tokens = token_balances.len(),
            priced_tokens = priced,
            "💼 Wallet valued"
        );

        Ok(PortfolioSnapshot {
            total_value_usd,
            token_balances,
            captured_at: self.clock.now(),
            native_balance,
            native_price_usd: Some(native_price),
            native_reserve: self.settings.native_reserve,
        })
    }

    /// Token price with its own retry loop; `None` once retries are exhausted
    async fn token_price(&self, contract: &str) -> Option<Decimal> {
        let policy = self.settings.token_retry;
        for attempt in 0..policy.max_retries {
            let outcome = self
                .token_prices
                .token_price_usd(contract)
                .await
                .and_then(validate_price);

            match outcome {
                Ok(price) => return Some(price),
                Err(e) => {
                    if attempt + 1 < policy.max_retries {
                        debug!(token = %contract, attempt, error = %e, "Token price retry");
                        tokio::time::sleep(policy.backoff(attempt)).await;
                    } else {
                        warn!(token = %contract, error = %e, "Failed to get token price");
                    }
                }
            }
        }
        None
    }
}

fn checked_mul(a: Decimal, b: Decimal) -> Result<Decimal> {
    a.checked_mul(b).ok_or_else(|| overflow("token value"))
}

fn overflow(what: &str) -> DatagenError {
    DatagenError::MalformedRecord(format!("{} overflows decimal range", what))
}
