//! Price source implementations (CoinGecko, Binance, Kraken, Huobi)

mod binance;
mod coingecko;
mod huobi;
mod kraken;

pub use binance::BinanceClient;
pub use coingecko::{CoinGeckoClient, CoinGeckoTokenPrices};
pub use huobi::HuobiClient;
pub use kraken::KrakenClient;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::{Client, StatusCode};
use std::fmt;
use std::time::Duration;

/// Why a single attempt against a source failed
#[derive(Debug, Clone, PartialEq)]
pub enum SourceError {
    /// HTTP 429
    RateLimited,
    /// Any other non-2xx status
    Status(u16),
    /// Timeout, connection or body read failure
    Transport(String),
    /// Body did not contain a usable price
    Extraction(String),
    /// Price was not a finite, strictly positive number
    InvalidPrice(f64),
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::RateLimited => write!(f, "rate limited (HTTP 429)"),
            SourceError::Status(code) => write!(f, "HTTP status {}", code),
            SourceError::Transport(e) => write!(f, "request failed: {}", e),
            SourceError::Extraction(e) => write!(f, "unexpected body: {}", e),
            SourceError::InvalidPrice(p) => write!(f, "rejected price {}", p),
        }
    }
}

/// Trait for spot price providers
///
/// `fetch` does the I/O, `extract` is a pure function of the body so each
/// provider's parsing can be tested without the network.
#[async_trait]
pub trait PriceProvider: Send + Sync {
    /// Get the source name
    fn name(&self) -> &'static str;

    /// Request the raw response body for an asset symbol (e.g. "ETH")
    async fn fetch(&self, asset: &str) -> std::result::Result<String, SourceError>;

    /// Pull the USD price out of a response body
    fn extract(&self, asset: &str, body: &str) -> std::result::Result<f64, SourceError>;
}

/// Per-token USD price lookup keyed by contract address
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenPriceSource: Send + Sync {
    async fn token_price_usd(&self, contract: &str) -> std::result::Result<f64, SourceError>;
}

/// Shared HTTP transport for the REST price sources
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client })
    }

    /// GET with query parameters, mapping 429 and non-2xx to [`SourceError`]
    pub async fn get_text(
        &self,
        url: &str,
        params: &[(&str, String)],
    ) -> std::result::Result<String, SourceError> {
        let response = self
            .client
            .get(url)
            .query(params)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| SourceError::Transport(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SourceError::RateLimited);
        }
        if !status.is_success() {
            return Err(SourceError::Status(status.as_u16()));
        }

        response
            .text()
            .await
            .map_err(|e| SourceError::Transport(e.to_string()))
    }
}

/// Read a JSON number or a numeric string
pub(crate) fn json_number(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

pub(crate) fn parse_body(body: &str) -> std::result::Result<serde_json::Value, SourceError> {
    serde_json::from_str(body).map_err(|e| SourceError::Extraction(e.to_string()))
}

/// Build providers from their configured names, keeping the given priority order
pub fn build_providers(names: &[String], http: &HttpFetcher) -> Result<Vec<Box<dyn PriceProvider>>> {
    let mut providers: Vec<Box<dyn PriceProvider>> = Vec::with_capacity(names.len());
    for name in names {
        let provider: Box<dyn PriceProvider> = match name.trim().to_lowercase().as_str() {
            "coingecko" => Box::new(CoinGeckoClient::new(http.clone())),
            "binance" => Box::new(BinanceClient::new(http.clone())),
            "kraken" => Box::new(KrakenClient::new(http.clone())),
            "huobi" => Box::new(HuobiClient::new(http.clone())),
            other => bail!("Unknown price provider: {}", other),
        };
        providers.push(provider);
    }
    Ok(providers)
}
