use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};
use crate::types::Amount;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub key_path: PathBuf,
    pub rpc_listen: SocketAddr,
    pub round_interval_ms: u64,
    pub stage_timeout_ms: u64,
    pub max_block_transactions: usize,
    pub mempool_limit: usize,
    #[serde(default = "default_max_rounds_cancel_contract")]
    pub max_rounds_cancel_contract: u64,
    #[serde(default = "default_gray_list_penalty")]
    pub gray_list_penalty: u32,
    #[serde(default = "default_starting_dpos_round")]
    pub starting_dpos_round: u64,
    #[serde(default = "default_min_stake")]
    pub min_stake: String,
    #[serde(default = "default_smart_wait_ms")]
    pub smart_wait_ms: u64,
    pub genesis: GenesisConfig,
}

fn default_max_rounds_cancel_contract() -> u64 {
    100
}

fn default_gray_list_penalty() -> u32 {
    30
}

fn default_starting_dpos_round() -> u64 {
    10
}

fn default_min_stake() -> String {
    "1000".to_string()
}

fn default_smart_wait_ms() -> u64 {
    10_000
}

impl NodeConfig {
    pub fn load(path: &Path) -> ChainResult<Self> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|err| ChainError::Config(format!("unable to parse config: {err}")))
    }

    pub fn save(&self, path: &Path) -> ChainResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| ChainError::Config(format!("unable to encode config: {err}")))?;
        fs::write(path, encoded)?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> ChainResult<()> {
        fs::create_dir_all(&self.data_dir)?;
        if let Some(parent) = self.key_path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    pub fn min_stake_value(&self) -> ChainResult<Amount> {
        self.min_stake.parse()
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            key_path: PathBuf::from("./keys/node.toml"),
            rpc_listen: "127.0.0.1:9090".parse().expect("valid socket addr"),
            round_interval_ms: 2_000,
            stage_timeout_ms: 2_000,
            max_block_transactions: 1_024,
            mempool_limit: 16_384,
            max_rounds_cancel_contract: default_max_rounds_cancel_contract(),
            gray_list_penalty: default_gray_list_penalty(),
            starting_dpos_round: default_starting_dpos_round(),
            min_stake: default_min_stake(),
            smart_wait_ms: default_smart_wait_ms(),
            genesis: GenesisConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisConfig {
    pub chain_id: String,
    pub accounts: Vec<GenesisAccount>,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            chain_id: "conclave-local".to_string(),
            accounts: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisAccount {
    pub public_key: String,
    pub balance: String,
}

impl GenesisAccount {
    pub fn balance_value(&self) -> ChainResult<Amount> {
        self.balance
            .parse()
            .map_err(|_| ChainError::Config(format!("invalid genesis balance: {}", self.balance)))
    }
}
