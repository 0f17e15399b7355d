//! Kraken public ticker client

use async_trait::async_trait;

use crate::oracle::sources::{json_number, parse_body, HttpFetcher, PriceProvider, SourceError};

const KRAKEN_TICKER_URL: &str = "https://api.kraken.com/0/public/Ticker";

#[derive(Debug, Clone)]
pub struct KrakenClient {
    http: HttpFetcher,
    endpoint: String,
}

impl KrakenClient {
    pub fn new(http: HttpFetcher) -> Self {
        Self {
            http,
            endpoint: KRAKEN_TICKER_URL.to_string(),
        }
    }

    /// Kraken still calls bitcoin XBT
    fn pair(asset: &str) -> String {
        match asset.to_uppercase().as_str() {
            "BTC" => "XBTUSD".to_string(),
            other => format!("{}USD", other),
        }
    }
}

#[async_trait]
impl PriceProvider for KrakenClient {
    fn name(&self) -> &'static str {
        "Kraken"
    }

    async fn fetch(&self, asset: &str) -> Result<String, SourceError> {
        let params = [("pair", Self::pair(asset))];
        self.http.get_text(&self.endpoint, &params).await
    }

    fn extract(&self, _asset: &str, body: &str) -> Result<f64, SourceError> {
        // {"error":[],"result":{"XETHZUSD":{"c":["3120.42","0.1"],...}}}
        let json = parse_body(body)?;

        if let Some(errors) = json.get("error").and_then(|e| e.as_array()) {
            if !errors.is_empty() {
                let joined: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
                return Err(SourceError::Extraction(joined.join(", ")));
            }
        }

        // The result key is Kraken's internal pair name, so take the only entry
        json.get("result")
            .and_then(|r| r.as_object())
            .and_then(|r| r.values().next())
            .and_then(|ticker| ticker.get("c"))
            .and_then(|c| c.get(0))
            .and_then(json_number)
            .ok_or_else(|| SourceError::Extraction("missing result.*.c[0]".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn client() -> KrakenClient {
        KrakenClient::new(HttpFetcher::new(Duration::from_secs(1)).unwrap())
    }

    #[test]
    fn extracts_last_trade_close() {
        let body = r#"{"error":[],"result":{"XETHZUSD":{"a":["3121.0","1","1.0"],"c":["3120.42","0.1"]}}}"#;
        assert_eq!(client().extract("ETH", body), Ok(3120.42));
    }

    #[test]
    fn api_errors_are_surfaced() {
        let body = r#"{"error":["EQuery:Unknown asset pair"]}"#;
        let err = client().extract("ETH", body).unwrap_err();
        assert!(err.to_string().contains("Unknown asset pair"));
    }

    #[test]
    fn bitcoin_uses_xbt_pair() {
        assert_eq!(KrakenClient::pair("btc"), "XBTUSD");
        assert_eq!(KrakenClient::pair("ETH"), "ETHUSD");
    }
}
