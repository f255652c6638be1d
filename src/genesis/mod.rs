mod fix;
mod normalize;

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde_json::Value;
use thiserror::Error;

use crate::{json_codecs::u64_from_quantity_value, units::WeiNewtype};

pub use fix::backup_path_for;
pub use fix::fix_genesis_file;
pub use fix::fix_genesis_files;
pub use fix::known_genesis_files;
pub use fix::GenesisFixOutcome;
pub use fix::KNOWN_GENESIS_FILES;

pub use normalize::address_id;
pub use normalize::check_address;
pub use normalize::AddressCheck;
pub use normalize::AllocMergePolicy;
pub use normalize::FieldMatcher;
pub use normalize::GenesisFields;
pub use normalize::NormalizationEvent;
pub use normalize::Normalized;
pub use normalize::Normalizer;
pub use normalize::ADDRESS_HEX_LEN;
pub use normalize::CORRUPTED_ADDRESS_HEX_LEN;

const EMBEDDED_GENESIS_FIELD: &str = "cChainGenesis";

#[derive(Debug, Error)]
pub enum GenesisError {
    #[error("genesis file {0} not found")]
    NotFound(PathBuf),
    #[error("failed to access genesis file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("genesis file {path} is not valid JSON: {source}")]
    Decode {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl GenesisError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound(path.to_path_buf())
        } else {
            Self::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllocBalance {
    Parsed(WeiNewtype),
    Missing,
    Invalid(Value),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocEntry {
    pub address: String,
    pub balance: AllocBalance,
}

impl AllocEntry {
    fn from_entry(address: &str, entry: &Value) -> Self {
        let balance = match entry.get("balance") {
            None | Some(Value::Null) => AllocBalance::Missing,
            Some(Value::String(text)) => match text.parse::<WeiNewtype>() {
                Ok(balance) => AllocBalance::Parsed(balance),
                Err(_) => AllocBalance::Invalid(Value::String(text.clone())),
            },
            Some(Value::Number(number)) => match number.as_u64() {
                Some(balance) => AllocBalance::Parsed(balance.into()),
                None => AllocBalance::Invalid(Value::Number(number.clone())),
            },
            Some(other) => AllocBalance::Invalid(other.clone()),
        };

        Self {
            address: address.to_string(),
            balance,
        }
    }

    pub fn parsed_balance(&self) -> Option<&WeiNewtype> {
        match &self.balance {
            AllocBalance::Parsed(balance) => Some(balance),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GenesisSource {
    TopLevel,
    /// Read from a genesis document serialized into a string field.
    Embedded(&'static str),
}

/// The parts of a genesis document the reconciliation looks at. Missing or unreadable pieces are
/// `None` rather than an error, callers report them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenesisConfig {
    pub chain_id: Option<u64>,
    pub gas_limit: Option<u64>,
    pub alloc: Vec<AllocEntry>,
    pub source: GenesisSource,
}

impl GenesisConfig {
    pub fn from_value(document: &Value) -> Self {
        let has_own_chain_data = document.get("alloc").is_some() || document.get("config").is_some();

        if !has_own_chain_data {
            let embedded = document
                .get(EMBEDDED_GENESIS_FIELD)
                .and_then(Value::as_str)
                .and_then(|text| serde_json::from_str::<Value>(text).ok());
            if let Some(embedded) = embedded {
                return Self {
                    source: GenesisSource::Embedded(EMBEDDED_GENESIS_FIELD),
                    ..Self::read(&embedded)
                };
            }
        }

        Self::read(document)
    }

    fn read(document: &Value) -> Self {
        let chain_id = document
            .pointer("/config/chainId")
            .and_then(u64_from_quantity_value);
        let gas_limit = document.get("gasLimit").and_then(u64_from_quantity_value);
        let alloc = document
            .get("alloc")
            .and_then(Value::as_object)
            .map(|table| {
                table
                    .iter()
                    .map(|(address, entry)| AllocEntry::from_entry(address, entry))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            chain_id,
            gas_limit,
            alloc,
            source: GenesisSource::TopLevel,
        }
    }

    pub fn load(path: &Path) -> Result<Self, GenesisError> {
        let bytes = fs::read(path).map_err(|source| GenesisError::io(path, source))?;
        let document =
            serde_json::from_slice::<Value>(&bytes).map_err(|source| GenesisError::Decode {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self::from_value(&document))
    }

    pub fn total_balance(&self) -> WeiNewtype {
        self.alloc
            .iter()
            .filter_map(AllocEntry::parsed_balance)
            .sum()
    }

    /// Case and `0x` prefix insensitive.
    pub fn find_account(&self, address: &str) -> Option<&AllocEntry> {
        let wanted = address_id(address);
        self.alloc
            .iter()
            .find(|entry| address_id(&entry.address) == wanted)
    }
}
