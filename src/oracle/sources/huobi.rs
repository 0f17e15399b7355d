//! Huobi merged market detail client

use async_trait::async_trait;

use crate::oracle::sources::{json_number, parse_body, HttpFetcher, PriceProvider, SourceError};

const HUOBI_MERGED_URL: &str = "https://api.huobi.pro/market/detail/merged";

#[derive(Debug, Clone)]
pub struct HuobiClient {
    http: HttpFetcher,
    endpoint: String,
}

impl HuobiClient {
    pub fn new(http: HttpFetcher) -> Self {
        Self {
            http,
            endpoint: HUOBI_MERGED_URL.to_string(),
        }
    }
}

#[async_trait]
impl PriceProvider for HuobiClient {
    fn name(&self) -> &'static str {
        "Huobi"
    }

    async fn fetch(&self, asset: &str) -> Result<String, SourceError> {
        let params = [("symbol", format!("{}usdt", asset.to_lowercase()))];
        self.http.get_text(&self.endpoint, &params).await
    }

    fn extract(&self, _asset: &str, body: &str) -> Result<f64, SourceError> {
        let json = parse_body(body)?;

        if json.get("status").and_then(|s| s.as_str()) == Some("error") {
            let msg = json
                .get("err-msg")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error");
            return Err(SourceError::Extraction(msg.to_string()));
        }

        json.get("tick")
            .and_then(|t| t.get("close"))
            .and_then(json_number)
            .ok_or_else(|| SourceError::Extraction("missing tick.close".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn extracts_tick_close() {
        let client = HuobiClient::new(HttpFetcher::new(Duration::from_secs(1)).unwrap());
        let body = r#"{"status":"ok","tick":{"close":3120.42,"open":3100.0}}"#;
        assert_eq!(client.extract("ETH", body), Ok(3120.42));

        let err = r#"{"status":"error","err-msg":"invalid symbol"}"#;
        assert_eq!(
            client.extract("ETH", err),
            Err(SourceError::Extraction("invalid symbol".to_string()))
        );
    }
}
