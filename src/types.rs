//! Core records shared across the pipeline
//!
//! Chat messages, decision cycles, wallet snapshots and strategy rows. Rows
//! arrive untyped from the log sources and are validated into these structs
//! at the `persistence` boundary.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Author of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    /// Parse from the `message_type` column
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }

    /// Whether the role may appear in a training prompt
    pub fn is_prompt_role(&self) -> bool {
        matches!(self, Role::System | Role::User)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// One row of the agent chat log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Monotonic, unique per session
    pub sequence_id: i64,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// `{role, content}` pair as it appears in prompts and responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

impl From<&ChatMessage> for PromptMessage {
    fn from(msg: &ChatMessage) -> Self {
        Self {
            role: msg.role,
            content: msg.content.clone(),
        }
    }
}

/// Span of chat messages opened by a system prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionCycle {
    pub session_id: String,
    pub messages: Vec<ChatMessage>,
    pub start_timestamp: DateTime<Utc>,
    /// `None` while no later system prompt has closed the cycle
    pub end_timestamp: Option<DateTime<Utc>>,
}

/// Token position inside a wallet snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBalance {
    pub address: String,
    pub symbol: String,
    pub balance: Decimal,
    /// Absent when every price lookup for the token failed
    #[serde(default)]
    pub price_usd: Option<Decimal>,
    #[serde(default)]
    pub value_usd: Option<Decimal>,
}

/// Point-in-time valuation of a wallet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub total_value_usd: Decimal,
    #[serde(default)]
    pub token_balances: Vec<TokenBalance>,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub native_balance: Decimal,
    #[serde(default)]
    pub native_price_usd: Option<Decimal>,
    #[serde(default)]
    pub native_reserve: Decimal,
}

impl PortfolioSnapshot {
    /// Distinct tokens held, keyed by case-insensitive contract address
    pub fn distinct_token_count(&self) -> usize {
        let mut seen: Vec<String> = self
            .token_balances
            .iter()
            .map(|t| t.address.to_lowercase())
            .collect();
        seen.sort();
        seen.dedup();
        seen.len()
    }
}

/// Strategy decision logged by the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyRecord {
    pub id: i64,
    pub agent_id: String,
    pub summarized_desc: Option<String>,
    pub full_desc: Option<String>,
    pub strategy_result: Option<String>,
    pub parameters: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl StrategyRecord {
    /// Reasoning text used for the `<reasoning>` block
    pub fn reasoning(&self) -> Option<&str> {
        [self.full_desc.as_deref(), self.summarized_desc.as_deref()]
            .into_iter()
            .flatten()
            .find(|s| !s.trim().is_empty())
    }

    /// A recorded result mentioning failure or error marks the execution unsuccessful.
    pub fn execution_succeeded(&self) -> bool {
        match self.strategy_result.as_deref() {
            Some(result) => {
                let lower = result.to_lowercase();
                !(lower.starts_with("fail") || lower.contains("error"))
            }
            None => true,
        }
    }
}

const SQL_TIMESTAMP_FORMATS: [&str; 3] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
];

/// Parse a log timestamp: SQLite `YYYY-MM-DD HH:MM:SS` (UTC) or RFC 3339.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    SQL_TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Render a timestamp the way the log tables store it
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parses_sqlite_and_rfc3339_timestamps() {
        let a = parse_timestamp("2025-03-01 12:00:00").unwrap();
        let b = parse_timestamp("2025-03-01T12:00:00Z").unwrap();
        let c = parse_timestamp("2025-03-01T14:00:00+02:00").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn role_parsing_is_case_insensitive() {
        assert_eq!(Role::from_str("System"), Some(Role::System));
        assert_eq!(Role::from_str(" assistant "), Some(Role::Assistant));
        assert_eq!(Role::from_str("tool"), None);
        assert!(!Role::Assistant.is_prompt_role());
    }

    #[test]
    fn distinct_tokens_ignore_address_case() {
        let token = |addr: &str| TokenBalance {
            address: addr.to_string(),
            symbol: "USDT".to_string(),
            balance: dec!(1),
            price_usd: None,
            value_usd: None,
        };
        let snapshot = PortfolioSnapshot {
            total_value_usd: dec!(0),
            token_balances: vec![token("0xAbC"), token("0xabc"), token("0xdef")],
            captured_at: Utc::now(),
            native_balance: dec!(0),
            native_price_usd: None,
            native_reserve: dec!(0),
        };
        assert_eq!(snapshot.distinct_token_count(), 2);
    }

    #[test]
    fn strategy_failure_detection() {
        let mut record = StrategyRecord {
            id: 1,
            agent_id: "agent_007".to_string(),
            summarized_desc: Some("buy".to_string()),
            full_desc: None,
            strategy_result: None,
            parameters: None,
            created_at: Utc::now(),
        };
        assert!(record.execution_succeeded());
        assert_eq!(record.reasoning(), Some("buy"));

        record.strategy_result = Some("Failed: swap reverted".to_string());
        assert!(!record.execution_succeeded());

        record.strategy_result = Some("executed with error".to_string());
        assert!(!record.execution_succeeded());
    }
}
