use crate::error::{CustodyError, Result};
use crate::token::Stage;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Wallet protocol the custody keys are derived under
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolId {
    pub security_level: u8,
    pub name: String,
}

impl Default for ProtocolId {
    fn default() -> Self {
        Self {
            security_level: 0,
            name: "medical prescription".to_string(),
        }
    }
}

/// Which wallet outputs are released once a transition is accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelinquishPolicy {
    /// Keep every output in its basket
    Never,
    /// Release the funding outputs consumed by the first-stage transition only
    #[default]
    OriginOnly,
    /// Release funding outputs and the spent token output of every transition
    Always,
}

/// Satoshi value of the token output at each spendable stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputValues {
    pub created: u64,
    pub presented: u64,
    pub dispensed: u64,
}

impl Default for OutputValues {
    fn default() -> Self {
        Self {
            created: 3,
            presented: 2,
            dispensed: 1,
        }
    }
}

impl OutputValues {
    pub fn for_stage(&self, stage: Stage) -> u64 {
        match stage {
            Stage::Created => self.created,
            Stage::Presented => self.presented,
            Stage::Dispensed => self.dispensed,
            // receipt markers carry no value
            Stage::Acknowledged => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    #[default]
    Sqlite,
    Rocksdb,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub path: PathBuf,
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: PathBuf::from("custody.db"),
            max_connections: 5,
        }
    }
}

/// Settings for a custody-chain deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CustodyConfig {
    pub protocol: ProtocolId,
    /// Basket custody-token outputs are created in
    pub token_basket: String,
    /// Basket funding outputs are relinquished from
    pub funding_basket: String,
    pub relinquish: RelinquishPolicy,
    pub output_values: OutputValues,
    pub store: StoreConfig,
    /// Broadcast journal file; in-memory when absent
    pub queue_journal: Option<PathBuf>,
}

impl Default for CustodyConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolId::default(),
            token_basket: "prescription".to_string(),
            funding_basket: "default".to_string(),
            relinquish: RelinquishPolicy::default(),
            output_values: OutputValues::default(),
            store: StoreConfig::default(),
            queue_journal: None,
        }
    }
}

impl CustodyConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: CustodyConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&text)
    }

    /// An in-memory setup, used by tests and ephemeral tooling
    pub fn in_memory() -> Self {
        Self {
            store: StoreConfig {
                backend: StoreBackend::Memory,
                ..StoreConfig::default()
            },
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if self.protocol.name.trim().is_empty() {
            return Err(CustodyError::Config("protocol name must not be empty".to_string()));
        }
        if self.token_basket.is_empty() || self.funding_basket.is_empty() {
            return Err(CustodyError::Config("basket names must not be empty".to_string()));
        }
        if self.store.max_connections == 0 {
            return Err(CustodyError::Config("store.max_connections must be positive".to_string()));
        }
        Ok(())
    }
}
