//! CoinGecko REST client
//!
//! Spot prices via `simple/price` and ERC-20 prices via `simple/token_price`.

use async_trait::async_trait;

use crate::oracle::sources::{
    json_number, parse_body, HttpFetcher, PriceProvider, SourceError, TokenPriceSource,
};

const COINGECKO_PRICE_URL: &str = "https://api.coingecko.com/api/v3/simple/price";

#[derive(Debug, Clone)]
pub struct CoinGeckoClient {
    http: HttpFetcher,
    endpoint: String,
}

impl CoinGeckoClient {
    pub fn new(http: HttpFetcher) -> Self {
        Self {
            http,
            endpoint: COINGECKO_PRICE_URL.to_string(),
        }
    }

    /// CoinGecko identifies coins by id rather than ticker
    fn coin_id(asset: &str) -> String {
        match asset.to_uppercase().as_str() {
            "ETH" => "ethereum".to_string(),
            "BTC" => "bitcoin".to_string(),
            "SOL" => "solana".to_string(),
            "XRP" => "ripple".to_string(),
            "MATIC" | "POL" => "matic-network".to_string(),
            other => other.to_lowercase(),
        }
    }
}

#[async_trait]
impl PriceProvider for CoinGeckoClient {
    fn name(&self) -> &'static str {
        "CoinGecko"
    }

    async fn fetch(&self, asset: &str) -> Result<String, SourceError> {
        let params = [
            ("ids", Self::coin_id(asset)),
            ("vs_currencies", "usd".to_string()),
        ];
        self.http.get_text(&self.endpoint, &params).await
    }

    fn extract(&self, asset: &str, body: &str) -> Result<f64, SourceError> {
        let json = parse_body(body)?;
        let id = Self::coin_id(asset);
        json.get(&id)
            .and_then(|coin| coin.get("usd"))
            .and_then(json_number)
            .ok_or_else(|| SourceError::Extraction(format!("missing {}.usd", id)))
    }
}

/// ERC-20 prices by contract address
#[derive(Debug, Clone)]
pub struct CoinGeckoTokenPrices {
    http: HttpFetcher,
    endpoint: String,
}

impl CoinGeckoTokenPrices {
    pub fn new(http: HttpFetcher, endpoint: &str) -> Self {
        Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }

    /// Response is keyed by the lowercase contract address
    pub fn extract_token_price(contract: &str, body: &str) -> Result<f64, SourceError> {
        let json = parse_body(body)?;
        let key = contract.to_lowercase();
        json.get(&key)
            .and_then(|entry| entry.get("usd"))
            .and_then(json_number)
            .ok_or_else(|| SourceError::Extraction(format!("no usd price for {}", key)))
    }
}

#[async_trait]
impl TokenPriceSource for CoinGeckoTokenPrices {
    async fn token_price_usd(&self, contract: &str) -> Result<f64, SourceError> {
        let params = [
            ("contract_addresses", contract.to_string()),
            ("vs_currencies", "usd".to_string()),
        ];
        let body = self.http.get_text(&self.endpoint, &params).await?;
        Self::extract_token_price(contract, &body)
    }
}
