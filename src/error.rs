use thiserror::Error;

/// Error taxonomy for the data-synthesis pipeline
#[derive(Error, Debug)]
pub enum DatagenError {
    // Price data errors
    #[error("Provider {provider} failed: {reason}")]
    ProviderFailure { provider: String, reason: String },

    #[error("All providers failed: {0}")]
    AllProvidersFailed(String),

    // Matching errors
    #[error("No snapshot found for agent {agent_id} within {tolerance_secs} seconds of {target}")]
    SnapshotNotFound {
        agent_id: String,
        target: String,
        tolerance_secs: i64,
    },

    // Record-level errors
    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    #[error("Reward computation failed: {0}")]
    RewardComputation(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // IO / serialization errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl DatagenError {
    pub fn provider(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ProviderFailure {
            provider: provider.into(),
            reason: reason.into(),
        }
    }

    /// Record-level failures are skipped and counted; everything else aborts the stage.
    pub fn is_skippable(&self) -> bool {
        matches!(
            self,
            Self::SnapshotNotFound { .. }
                | Self::MalformedRecord(_)
                | Self::RewardComputation(_)
                | Self::ProviderFailure { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, DatagenError>;
