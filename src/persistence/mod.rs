//! CSV Persistence Module
//!
//! Reads the agent log tables (chat history, strategies, wallet snapshots)
//! into typed records and appends new wallet snapshots. Rows that fail
//! validation are logged and counted, never fatal.

use anyhow::{Context, Result};
use chrono::SecondsFormat;
use csv::{ReaderBuilder, WriterBuilder};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::DataConfig;
use crate::error::DatagenError;
use crate::types::{
    parse_timestamp, ChatMessage, PortfolioSnapshot, Role, StrategyRecord,
    TokenBalance,
};
use crate::wallet::WalletHoldings;

/// Raw `chat_history.csv` row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRow {
    pub id: i64,
    pub session_id: String,
    pub message_type: String,
    pub content: String,
    pub timestamp: String,
}

/// Raw `strategies.csv` row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyRow {
    pub id: i64,
    pub agent_id: String,
    #[serde(default)]
    pub summarized_desc: Option<String>,
    #[serde(default)]
    pub full_desc: Option<String>,
    #[serde(default)]
    pub strategy_result: Option<String>,
    /// JSON blob
    #[serde(default)]
    pub parameters: Option<String>,
    pub created_at: String,
}

/// Raw `wallet_snapshots.csv` row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRow {
    #[serde(default)]
    pub id: Option<i64>,
    pub agent_id: String,
    pub total_value_usd: String,
    /// JSON blob: token list, or the full asset breakdown
    #[serde(default)]
    pub assets: Option<String>,
    pub snapshot_time: String,
}

/// Asset blob written next to each snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotAssets {
    #[serde(default)]
    pub token_balances: Vec<TokenBalance>,
    #[serde(default)]
    pub native_balance: Decimal,
    #[serde(default)]
    pub native_price_usd: Option<Decimal>,
    #[serde(default)]
    pub native_reserve: Decimal,
}

/// Older rows store a bare token list
#[derive(Deserialize)]
#[serde(untagged)]
enum AssetsBlob {
    Full(SnapshotAssets),
    Tokens(Vec<TokenBalance>),
}

impl TryFrom<ChatRow> for ChatMessage {
    type Error = DatagenError;

    fn try_from(row: ChatRow) -> std::result::Result<Self, Self::Error> {
        let role = Role::from_str(&row.message_type).ok_or_else(|| {
            DatagenError::MalformedRecord(format!(
                "chat row {}: unknown message_type {:?}",
                row.id, row.message_type
            ))
        })?;
        let timestamp = parse_timestamp(&row.timestamp).ok_or_else(|| {
            DatagenError::MalformedRecord(format!(
                "chat row {}: bad timestamp {:?}",
                row.id, row.timestamp
            ))
        })?;
        Ok(ChatMessage {
            sequence_id: row.id,
            session_id: row.session_id,
            role,
            content: row.content,
            timestamp,
        })
    }
}

impl TryFrom<StrategyRow> for StrategyRecord {
    type Error = DatagenError;

    fn try_from(row: StrategyRow) -> std::result::Result<Self, Self::Error> {
        let created_at = parse_timestamp(&row.created_at).ok_or_else(|| {
            DatagenError::MalformedRecord(format!(
                "strategy row {}: bad created_at {:?}",
                row.id, row.created_at
            ))
        })?;
        // Free-form parameters survive as a JSON string
        let parameters = row.parameters.filter(|p| !p.trim().is_empty()).map(|p| {
            serde_json::from_str(&p).unwrap_or(serde_json::Value::String(p))
        });
        Ok(StrategyRecord {
            id: row.id,
            agent_id: row.agent_id,
            summarized_desc: row.summarized_desc,
            full_desc: row.full_desc,
            strategy_result: row.strategy_result,
            parameters,
            created_at,
        })
    }
}

impl TryFrom<SnapshotRow> for PortfolioSnapshot {
    type Error = DatagenError;

    fn try_from(row: SnapshotRow) -> std::result::Result<Self, Self::Error> {
        let label = row.id.map(|id| id.to_string()).unwrap_or_else(|| "?".to_string());
        let total_value_usd: Decimal = row.total_value_usd.trim().parse().map_err(|e| {
            DatagenError::MalformedRecord(format!(
                "snapshot row {}: bad total_value_usd {:?}: {}",
                label, row.total_value_usd, e
            ))
        })?;
        let captured_at = parse_timestamp(&row.snapshot_time).ok_or_else(|| {
            DatagenError::MalformedRecord(format!(
                "snapshot row {}: bad snapshot_time {:?}",
                label, row.snapshot_time
            ))
        })?;

        let assets = match row.assets.as_deref().map(str::trim) {
            None | Some("") => SnapshotAssets::default(),
            Some(blob) => match serde_json::from_str::<AssetsBlob>(blob) {
                Ok(AssetsBlob::Full(assets)) => assets,
                Ok(AssetsBlob::Tokens(token_balances)) => SnapshotAssets {
                    token_balances,
                    ..SnapshotAssets::default()
                },
                Err(e) => {
                    return Err(DatagenError::MalformedRecord(format!(
                        "snapshot row {}: bad assets blob: {}",
                        label, e
                    )))
                }
            },
        };

        Ok(PortfolioSnapshot {
            total_value_usd,
            token_balances: assets.token_balances,
            captured_at,
            native_balance: assets.native_balance,
            native_price_usd: assets.native_price_usd,
            native_reserve: assets.native_reserve,
        })
    }
}

/// Records that passed validation plus the number of rejected rows
#[derive(Debug, Clone)]
pub struct Loaded<T> {
    pub records: Vec<T>,
    pub skipped: usize,
}

/// CSV-backed log tables
pub struct CsvLogStore {
    data_dir: PathBuf,
    chat_file: String,
    strategies_file: String,
    snapshots_file: String,
    holdings_file: String,
}

impl CsvLogStore {
    pub fn new(data: &DataConfig) -> Self {
        Self {
            data_dir: PathBuf::from(&data.data_dir),
            chat_file: data.chat_file.clone(),
            strategies_file: data.strategies_file.clone(),
            snapshots_file: data.snapshots_file.clone(),
            holdings_file: data.holdings_file.clone(),
        }
    }

    /// All chat messages, sorted by id
    pub fn load_chat_messages(&self) -> Result<Loaded<ChatMessage>> {
        let mut loaded = self.load_typed::<ChatRow, ChatMessage>(&self.chat_file, |_| true)?;
        loaded.records.sort_by_key(|m| m.sequence_id);
        Ok(loaded)
    }

    /// Strategies of one agent, oldest first
    pub fn load_strategies(&self, agent_id: &str) -> Result<Loaded<StrategyRecord>> {
        let mut loaded = self
            .load_typed::<StrategyRow, StrategyRecord>(&self.strategies_file, |r| {
                r.agent_id == agent_id
            })?;
        loaded.records.sort_by_key(|s| (s.created_at, s.id));
        Ok(loaded)
    }

    /// Wallet snapshots of one agent, oldest first
    pub fn load_snapshots(&self, agent_id: &str) -> Result<Loaded<PortfolioSnapshot>> {
        let mut loaded = self
            .load_typed::<SnapshotRow, PortfolioSnapshot>(&self.snapshots_file, |r| {
                r.agent_id == agent_id
            })?;
        loaded.records.sort_by_key(|s| s.captured_at);
        Ok(loaded)
    }

    pub fn load_holdings(&self) -> Result<WalletHoldings> {
        let path = self.data_dir.join(&self.holdings_file);
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read holdings file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse holdings file {}", path.display()))
    }

    /// Append one snapshot row, writing the header if the file is new or empty
    pub fn append_snapshot(&self, agent_id: &str, snapshot: &PortfolioSnapshot) -> Result<PathBuf> {
        let path = self.data_dir.join(&self.snapshots_file);
        let existing_rows = if path.exists() {
            ReaderBuilder::new()
                .has_headers(true)
                .from_path(&path)
                .map(|mut r| r.records().count())
                .unwrap_or(0)
        } else {
            0
        };

        let assets = SnapshotAssets {
            token_balances: snapshot.token_balances.clone(),
            native_balance: snapshot.native_balance,
            native_price_usd: snapshot.native_price_usd,
            native_reserve: snapshot.native_reserve,
        };
        let row = SnapshotRow {
            id: Some(existing_rows as i64 + 1),
            agent_id: agent_id.to_string(),
            total_value_usd: snapshot.total_value_usd.to_string(),
            assets: Some(serde_json::to_string(&assets).context("Failed to encode assets")?),
            // RFC 3339 keeps sub-second precision
            snapshot_time: snapshot
                .captured_at
                .to_rfc3339_opts(SecondsFormat::AutoSi, true),
        };

        let mut writer = Self::create_writer(&path)?;
        writer
            .serialize(&row)
            .context("Failed to write snapshot record")?;
        writer.flush().context("Failed to flush snapshot writer")?;

        info!(
            path = %path.display(),
            agent = agent_id,
            total_value_usd = %snapshot.total_value_usd,
            "Snapshot appended"
        );
        Ok(path)
    }

    fn create_writer(path: &Path) -> Result<csv::Writer<std::fs::File>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create data directory")?;
        }
        let file_has_data =
            path.exists() && fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .context("Failed to open CSV file")?;

        let writer = WriterBuilder::new()
            .has_headers(!file_has_data)
            .from_writer(file);

        Ok(writer)
    }

    fn load_typed<R, T>(&self, file: &str, keep: impl Fn(&R) -> bool) -> Result<Loaded<T>>
    where
        R: DeserializeOwned,
        T: TryFrom<R, Error = DatagenError>,
    {
        let path = self.data_dir.join(file);
        let file = std::fs::File::open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(file);

        let mut records = Vec::new();
        let mut skipped = 0usize;
        for (index, result) in reader.deserialize::<R>().enumerate() {
            let row = match result {
                Ok(row) => row,
                Err(e) => {
                    warn!(file = %path.display(), record = index + 1, error = %e, "Skipping unreadable record");
                    skipped += 1;
                    continue;
                }
            };
            if !keep(&row) {
                continue;
            }
            match T::try_from(row) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(file = %path.display(), record = index + 1, error = %e, "Skipping invalid record");
                    skipped += 1;
                }
            }
        }

        info!(
            file = %path.display(),
            loaded = records.len(),
            skipped,
            "Loaded log table"
        );
        Ok(Loaded { records, skipped })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use rust_decimal_macros::dec;
    use std::fs;

    fn temp_data_dir(test_name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "datagen_persistence_{}_{}",
            test_name,
            uuid::Uuid::new_v4()
        ))
    }

    fn store(dir: &Path) -> CsvLogStore {
        let mut cfg = AppConfig::defaults().unwrap();
        cfg.data.data_dir = dir.to_string_lossy().to_string();
        CsvLogStore::new(&cfg.data)
    }

    #[test]
    fn chat_rows_validate_role_and_timestamp() {
        let dir = temp_data_dir("chat");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("chat_history.csv"),
            "id,session_id,message_type,content,timestamp\n\
             2,agent_007,user,\"hello, world\",2025-03-01 12:00:01\n\
             1,agent_007,system,you trade,2025-03-01 12:00:00\n\
             3,agent_007,tool,ignored,2025-03-01 12:00:02\n\
             4,agent_007,assistant,ok,not a time\n\
             x,agent_007,assistant,ok,2025-03-01 12:00:03\n",
        )
        .unwrap();

        let loaded = store(&dir).load_chat_messages().unwrap();
        assert_eq!(loaded.records.len(), 2);
        assert_eq!(loaded.skipped, 3);
        assert_eq!(loaded.records[0].role, Role::System);
        assert_eq!(loaded.records[1].content, "hello, world");

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn strategies_filter_by_agent_and_keep_parameters() {
        let dir = temp_data_dir("strategies");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("strategies.csv"),
            "id,agent_id,summarized_desc,full_desc,strategy_result,parameters,created_at\n\
             1,agent_007,buy,Buy ETH on momentum,success,\"{\"\"size\"\": 0.1}\",2025-03-01 12:00:00\n\
             2,agent_008,sell,,,,2025-03-01 12:05:00\n\
             3,agent_007,hold,,failed,free text,2025-03-01T11:00:00Z\n",
        )
        .unwrap();

        let loaded = store(&dir).load_strategies("agent_007").unwrap();
        assert_eq!(loaded.records.len(), 2);
        assert_eq!(loaded.records[0].id, 3);
        assert_eq!(
            loaded.records[0].parameters,
            Some(serde_json::Value::String("free text".to_string()))
        );
        assert!(!loaded.records[0].execution_succeeded());
        assert_eq!(loaded.records[1].parameters.as_ref().unwrap()["size"], 0.1);
        assert_eq!(loaded.records[1].reasoning(), Some("Buy ETH on momentum"));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn snapshot_rows_accept_legacy_token_lists() {
        let dir = temp_data_dir("snapshots");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("wallet_snapshots.csv"),
            "id,agent_id,total_value_usd,assets,snapshot_time\n\
             1,agent_007,1000.50,\"[{\"\"address\"\":\"\"0xa\"\",\"\"symbol\"\":\"\"USDT\"\",\"\"balance\"\":\"\"10\"\"}]\",2025-03-01 12:00:00\n\
             2,agent_007,abc,,2025-03-01 12:01:00\n\
             3,agent_007,990,,2025-03-01 11:00:00\n",
        )
        .unwrap();

        let loaded = store(&dir).load_snapshots("agent_007").unwrap();
        assert_eq!(loaded.skipped, 1);
        assert_eq!(loaded.records.len(), 2);
        assert_eq!(loaded.records[0].total_value_usd, dec!(990));
        assert_eq!(loaded.records[1].token_balances.len(), 1);
        assert_eq!(loaded.records[1].token_balances[0].balance, dec!(10));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn appended_snapshot_reads_back() {
        let dir = temp_data_dir("append");
        let store = store(&dir);
        let captured_at = parse_timestamp("2025-03-01 12:00:00").unwrap();
        let snapshot = PortfolioSnapshot {
            total_value_usd: dec!(1239),
            token_balances: vec![TokenBalance {
                address: "0xdAC17F958D2ee523a2206206994597C13D831ec7".to_string(),
                symbol: "USDT".to_string(),
                balance: dec!(30),
                price_usd: Some(dec!(1)),
                value_usd: Some(dec!(30)),
            }],
            captured_at,
            native_balance: dec!(0.5),
            native_price_usd: Some(dec!(2400)),
            native_reserve: dec!(0.01),
        };

        let path = store.append_snapshot("agent_007", &snapshot).unwrap();
        store.append_snapshot("agent_007", &snapshot).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        assert_eq!(
            lines.next().unwrap_or_default(),
            "id,agent_id,total_value_usd,assets,snapshot_time"
        );
        assert_eq!(content.lines().count(), 3);

        let loaded = store.load_snapshots("agent_007").unwrap();
        assert_eq!(loaded.records.len(), 2);
        assert_eq!(loaded.records[0], snapshot);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn appended_snapshot_keeps_subsecond_time() {
        let dir = temp_data_dir("append_millis");
        let store = store(&dir);
        let captured_at = parse_timestamp("2025-03-01T12:00:00.250Z").unwrap();
        let snapshot = PortfolioSnapshot {
            total_value_usd: dec!(500),
            token_balances: Vec::new(),
            captured_at,
            native_balance: dec!(0.2),
            native_price_usd: Some(dec!(2500)),
            native_reserve: dec!(0.01),
        };

        let path = store.append_snapshot("agent_007", &snapshot).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("2025-03-01T12:00:00.250Z"));

        let loaded = store.load_snapshots("agent_007").unwrap();
        assert_eq!(loaded.records.len(), 1);
        assert_eq!(loaded.records[0].captured_at, captured_at);

        let _ = fs::remove_dir_all(&dir);
    }
}
