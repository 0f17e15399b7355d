//! Binance REST ticker client

use async_trait::async_trait;

use crate::oracle::sources::{json_number, parse_body, HttpFetcher, PriceProvider, SourceError};

const BINANCE_TICKER_URL: &str = "https://api.binance.com/api/v3/ticker/price";

#[derive(Debug, Clone)]
pub struct BinanceClient {
    http: HttpFetcher,
    endpoint: String,
}

impl BinanceClient {
    pub fn new(http: HttpFetcher) -> Self {
        Self {
            http,
            endpoint: BINANCE_TICKER_URL.to_string(),
        }
    }

    /// Get the trading pair for Binance (e.g., "ETHUSDT")
    fn trading_pair(asset: &str) -> String {
        format!("{}USDT", asset.to_uppercase())
    }
}

#[async_trait]
impl PriceProvider for BinanceClient {
    fn name(&self) -> &'static str {
        "Binance"
    }

    async fn fetch(&self, asset: &str) -> Result<String, SourceError> {
        let params = [("symbol", Self::trading_pair(asset))];
        self.http.get_text(&self.endpoint, &params).await
    }

    fn extract(&self, _asset: &str, body: &str) -> Result<f64, SourceError> {
        // {"symbol":"ETHUSDT","price":"3120.42000000"}
        let json = parse_body(body)?;
        json.get("price")
            .and_then(json_number)
            .ok_or_else(|| SourceError::Extraction("missing price".to_string()))
    }
}
