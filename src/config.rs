//! Configuration management for RelayChain

use crate::consensus::{EngineConfig, LcpoaConfig, PosConfig, ThrustedConfig};
use crate::error::ChainError;
use crate::network::RelayConfig;
use crate::transactor::TransactorConfig;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub database: DatabaseConfig,
    pub ledger: LedgerConfig,
    pub consensus: ConsensusConfig,
    pub lcpoa: LcpoaSection,
    pub pos: PosSection,
    pub thrusted: ThrustedSection,
    pub transactor: TransactorSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub p2p_port: u16,
    pub bus_address: String,
    /// `ws://host:port` urls dialed at start.
    pub bootstrap_peers: Vec<String>,
    pub relevancy_time_ms: i64,
    pub latency_slack_ms: i64,
    pub mutex_window_ms: u64,
    pub max_route_len: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file, or `:memory:`.
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub autofix: bool,
    pub verbose: bool,
    /// Holds the node key and the keyring file.
    pub work_dir: String,
    /// Every node of one network must agree on it.
    pub genesis_timestamp: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub active: String,
    pub validators: Vec<String>,
    pub generate_empty_block_delay_ms: i64,
    pub empty_block_interval_ms: u64,
    pub key_emission_max_block: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LcpoaSection {
    pub block_endls: Vec<String>,
    pub variant_time_ms: u64,
    pub min_peers_for_empty: usize,
    pub mining_disabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PosSection {
    pub master_contract: String,
    pub add_message_timeout_ms: u64,
    pub message_timeout_ms: i64,
    pub gate_backoff_ms: u64,
    /// Keys allowed to validate. Empty means no master contract is deployed.
    pub whitelist: Vec<String>,
    /// Fee the master contract asks per block.
    pub flat_fee: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThrustedSection {
    pub freshness_window_ms: i64,
    pub add_message_timeout_ms: u64,
    pub message_timeout_ms: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransactorSection {
    pub accept_count: u64,
    pub max_attempts: u32,
    pub watch_interval_ms: u64,
    pub regenerate_delay_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        let relay = RelayConfig::new("");
        Self {
            p2p_port: 6015,
            bus_address: String::new(),
            bootstrap_peers: Vec::new(),
            relevancy_time_ms: relay.relevancy_time_ms,
            latency_slack_ms: relay.latency_slack_ms,
            mutex_window_ms: relay.mutex_window.as_millis() as u64,
            max_route_len: relay.max_route_len,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "./data/blocks.db".to_string(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            autofix: false,
            verbose: false,
            work_dir: "./data".to_string(),
            genesis_timestamp: 1_672_531_200_000,
        }
    }
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            active: engine.active,
            validators: vec![
                crate::consensus::lcpoa::CONSENSUS_NAME.to_string(),
                crate::consensus::pos::CONSENSUS_NAME.to_string(),
                crate::consensus::thrusted::CONSENSUS_NAME.to_string(),
            ],
            generate_empty_block_delay_ms: 60_000,
            empty_block_interval_ms: engine.empty_block_interval.as_millis() as u64,
            key_emission_max_block: crate::dispatch::KEY_EMISSION_MAX_BLOCK,
        }
    }
}

impl Default for LcpoaSection {
    fn default() -> Self {
        let lcpoa = LcpoaConfig::default();
        Self {
            block_endls: lcpoa.block_endls,
            variant_time_ms: lcpoa.variant_time.as_millis() as u64,
            min_peers_for_empty: lcpoa.min_peers_for_empty,
            mining_disabled: lcpoa.mining_disabled,
        }
    }
}

impl Default for PosSection {
    fn default() -> Self {
        let pos = PosConfig::default();
        Self {
            master_contract: pos.master_contract,
            add_message_timeout_ms: pos.add_message_timeout.as_millis() as u64,
            message_timeout_ms: pos.message_timeout_ms,
            gate_backoff_ms: pos.gate_backoff.as_millis() as u64,
            whitelist: Vec::new(),
            flat_fee: None,
        }
    }
}

impl Default for ThrustedSection {
    fn default() -> Self {
        let thrusted = ThrustedConfig::default();
        Self {
            freshness_window_ms: thrusted.freshness_window_ms,
            add_message_timeout_ms: thrusted.add_message_timeout.as_millis() as u64,
            message_timeout_ms: thrusted.message_timeout_ms,
        }
    }
}

impl Default for TransactorSection {
    fn default() -> Self {
        let transactor = TransactorConfig::default();
        Self {
            accept_count: transactor.accept_count,
            max_attempts: transactor.max_attempts,
            watch_interval_ms: transactor.watch_interval.as_millis() as u64,
            regenerate_delay_ms: transactor.regenerate_delay.as_millis() as u64,
        }
    }
}

/// Reads `path`, falling back to defaults when the file is absent.
pub fn load_config(path: &Path) -> Result<Config, ChainError> {
    let config: Config = if path.exists() {
        let config_str = fs::read_to_string(path)?;
        toml::from_str(&config_str)?
    } else {
        Config::default()
    };
    config.validate()?;
    Ok(config)
}

impl Config {
    pub fn validate(&self) -> Result<(), ChainError> {
        if self.database.path.is_empty() {
            return Err(ChainError::ConfigError("database.path must be set".to_string()));
        }
        if self.ledger.work_dir.is_empty() {
            return Err(ChainError::ConfigError("ledger.work_dir must be set".to_string()));
        }
        if self.consensus.validators.is_empty() {
            return Err(ChainError::ConfigError(
                "consensus.validators must name at least one validator".to_string(),
            ));
        }
        let known = [
            crate::consensus::lcpoa::CONSENSUS_NAME,
            crate::consensus::pos::CONSENSUS_NAME,
            crate::consensus::thrusted::CONSENSUS_NAME,
        ];
        if let Some(unknown) = self
            .consensus
            .validators
            .iter()
            .find(|name| !known.contains(&name.as_str()))
        {
            return Err(ChainError::ConfigError(format!("Unknown validator '{}'", unknown)));
        }
        if !self.consensus.validators.contains(&self.consensus.active) {
            return Err(ChainError::ConfigError(format!(
                "consensus.active '{}' is not in consensus.validators",
                self.consensus.active
            )));
        }
        if self.lcpoa.block_endls.iter().any(|e| e.len() != 4) {
            return Err(ChainError::ConfigError(
                "lcpoa.block_endls entries must be 4 characters".to_string(),
            ));
        }
        if !crate::blockchain::is_fixed_width_millis(self.ledger.genesis_timestamp) {
            return Err(ChainError::ConfigError(
                "ledger.genesis_timestamp must be a 13-digit millisecond timestamp".to_string(),
            ));
        }
        if self.network.max_route_len == 0 {
            return Err(ChainError::ConfigError("network.max_route_len must be positive".to_string()));
        }
        if self.transactor.max_attempts == 0 {
            return Err(ChainError::ConfigError("transactor.max_attempts must be positive".to_string()));
        }
        Ok(())
    }

    pub fn work_dir(&self) -> PathBuf {
        PathBuf::from(&self.ledger.work_dir)
    }

    /// Bus address, defaulting to the node's public key.
    pub fn bus_address_or(&self, public_key: &str) -> String {
        if self.network.bus_address.is_empty() {
            public_key.to_string()
        } else {
            self.network.bus_address.clone()
        }
    }

    pub fn relay_config(&self, address: &str) -> RelayConfig {
        RelayConfig {
            address: address.to_string(),
            relevancy_time_ms: self.network.relevancy_time_ms,
            latency_slack_ms: self.network.latency_slack_ms,
            mutex_window: Duration::from_millis(self.network.mutex_window_ms),
            max_route_len: self.network.max_route_len,
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            active: self.consensus.active.clone(),
            gate_backoff: Duration::from_millis(self.pos.gate_backoff_ms),
            empty_block_interval: Duration::from_millis(self.consensus.empty_block_interval_ms),
            ..EngineConfig::default()
        }
    }

    pub fn lcpoa_config(&self) -> LcpoaConfig {
        LcpoaConfig {
            block_endls: self.lcpoa.block_endls.clone(),
            variant_time: Duration::from_millis(self.lcpoa.variant_time_ms),
            min_peers_for_empty: self.lcpoa.min_peers_for_empty,
            generate_empty_block_delay_ms: self.consensus.generate_empty_block_delay_ms,
            mining_disabled: self.lcpoa.mining_disabled,
        }
    }

    pub fn pos_config(&self) -> PosConfig {
        PosConfig {
            master_contract: self.pos.master_contract.clone(),
            add_message_timeout: Duration::from_millis(self.pos.add_message_timeout_ms),
            message_timeout_ms: self.pos.message_timeout_ms,
            gate_backoff: Duration::from_millis(self.pos.gate_backoff_ms),
            generate_empty_block_delay_ms: self.consensus.generate_empty_block_delay_ms,
            freshness_window_ms: self.thrusted.freshness_window_ms,
        }
    }

    pub fn thrusted_config(&self) -> ThrustedConfig {
        ThrustedConfig {
            freshness_window_ms: self.thrusted.freshness_window_ms,
            add_message_timeout: Duration::from_millis(self.thrusted.add_message_timeout_ms),
            message_timeout_ms: self.thrusted.message_timeout_ms,
            generate_empty_block_delay_ms: self.consensus.generate_empty_block_delay_ms,
        }
    }

    pub fn transactor_config(&self) -> TransactorConfig {
        TransactorConfig {
            accept_count: self.transactor.accept_count,
            max_attempts: self.transactor.max_attempts,
            watch_interval: Duration::from_millis(self.transactor.watch_interval_ms),
            regenerate_delay: Duration::from_millis(self.transactor.regenerate_delay_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config.consensus.active, crate::consensus::thrusted::CONSENSUS_NAME);
        assert_eq!(config.transactor.accept_count, 20);
        assert_eq!(config.transactor.max_attempts, 5);
        assert_eq!(config.pos.add_message_timeout_ms, 10_000);
        assert_eq!(config.lcpoa.block_endls.len(), 4);
        assert!(!config.ledger.autofix);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[database]
path = ":memory:"

[consensus]
active = "LCPoA"
validators = ["LCPoA"]

[lcpoa]
block_endls = ["0000"]
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.database.path, ":memory:");
        assert_eq!(config.lcpoa_config().block_endls, vec!["0000".to_string()]);
        assert_eq!(config.engine_config().active, "LCPoA");
        assert_eq!(config.thrusted.freshness_window_ms, 24 * 60 * 60 * 1000);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        fs::write(&path, "[consensus]\nactive = \"PoW\"\n").unwrap();
        assert!(matches!(load_config(&path), Err(ChainError::ConfigError(_))));

        fs::write(&path, "[database]\npath = \"\"\n").unwrap();
        assert!(matches!(load_config(&path), Err(ChainError::ConfigError(_))));

        fs::write(&path, "[network]\np2p_port = \"x\"\n").unwrap();
        assert!(matches!(load_config(&path), Err(ChainError::ConfigError(_))));
    }

    #[test]
    fn test_bus_address_defaults_to_key() {
        let config = Config::default();
        assert_eq!(config.bus_address_or("02ab"), "02ab");
        let relay = config.relay_config("02ab");
        assert_eq!(relay.max_route_len, crate::network::message::MAX_ROUTE_LEN);
    }
}
