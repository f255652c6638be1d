use std::{path::PathBuf, time::Duration};

use crate::env::{get_env_u64, get_env_var};

pub const DEFAULT_RPC_URL: &str = "http://localhost:9630/ext/bc/C/rpc";
pub const DEFAULT_GENESIS_PATH: &str = "/home/z/.luxd-migrated/configs/chains/C/genesis.json";
pub const DEFAULT_EXPORT_PATH: &str = "/tmp/lux-migration/blockchain-export-rpc.jsonl";
pub const DEFAULT_TREASURY_ADDRESS: &str = "0x9011E888251AB053B7bD1cdB598Db4f9DEd94714";

/// Height queries and balance lookups.
pub const DEFAULT_LIGHT_CALL_TIMEOUT: Duration = Duration::from_secs(5);
/// Block fetches with full transaction bodies.
pub const DEFAULT_HEAVY_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything the pipeline needs to know about its surroundings. Built once at startup and handed
/// to each component when it is constructed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrationConfig {
    pub rpc_endpoint: String,
    pub genesis_path: PathBuf,
    pub export_path: PathBuf,
    /// Highest block number to export, `None` exports up to the chain head.
    pub export_height_limit: Option<u64>,
    pub treasury_address: String,
    pub light_call_timeout: Duration,
    pub heavy_call_timeout: Duration,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            rpc_endpoint: DEFAULT_RPC_URL.to_string(),
            genesis_path: PathBuf::from(DEFAULT_GENESIS_PATH),
            export_path: PathBuf::from(DEFAULT_EXPORT_PATH),
            export_height_limit: None,
            treasury_address: DEFAULT_TREASURY_ADDRESS.to_string(),
            light_call_timeout: DEFAULT_LIGHT_CALL_TIMEOUT,
            heavy_call_timeout: DEFAULT_HEAVY_CALL_TIMEOUT,
        }
    }
}

impl MigrationConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            rpc_endpoint: get_env_var("RPC_URL").unwrap_or(defaults.rpc_endpoint),
            genesis_path: get_env_var("GENESIS_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.genesis_path),
            export_path: get_env_var("EXPORT_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.export_path),
            export_height_limit: get_env_u64("EXPORT_HEIGHT_LIMIT"),
            treasury_address: get_env_var("TREASURY_ADDRESS")
                .unwrap_or(defaults.treasury_address),
            light_call_timeout: get_env_u64("RPC_LIGHT_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.light_call_timeout),
            heavy_call_timeout: get_env_u64("RPC_HEAVY_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.heavy_call_timeout),
        }
    }
}
