use std::{collections::BTreeMap, fmt::Display};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::units::WeiNewtype;

/// A finding worth a human look. Findings never stop an analysis, they are listed in the order
/// they were discovered.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Discrepancy {
    GenesisFieldMissing {
        field: &'static str,
    },
    GenesisAddressLength {
        address: String,
        length: usize,
    },
    GenesisDuplicateAddress {
        address: String,
        duplicate_of: String,
    },
    GenesisBalanceInvalid {
        address: String,
        raw: String,
    },
    TreasuryMissing {
        address: String,
    },
    EmptyExport,
    MetadataMissing {
        line: u64,
    },
    MetadataRepeated {
        line: u64,
    },
    /// The metadata record has no readable `height`, completeness cannot be checked.
    HeightMissing {
        line: u64,
    },
    HeightOutOfRange {
        line: u64,
        height: u64,
    },
    MalformedLine {
        line: u64,
        error: String,
    },
    DuplicateBlock {
        line: u64,
        key: String,
    },
    BlockGap {
        line: u64,
        expected: u64,
        found: u64,
    },
    ParentHashMismatch {
        line: u64,
        number: u64,
        expected: String,
        found: String,
    },
    /// A block follows one numbered `u64::MAX`, no number can come next.
    BlockAfterLastNumber {
        line: u64,
        found: u64,
    },
    Truncated {
        declared_height: u64,
        expected_blocks: u64,
        unique_blocks: u64,
        requested_range: Option<(u64, u64)>,
    },
    ExcessBlocks {
        declared_height: u64,
        expected_blocks: u64,
        unique_blocks: u64,
    },
}

impl Display for Discrepancy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GenesisFieldMissing { field } => {
                write!(f, "genesis is missing {field} or it is not a number")
            }
            Self::GenesisAddressLength { address, length } => write!(
                f,
                "genesis alloc key {address} has {length} hex characters, expected 40"
            ),
            Self::GenesisDuplicateAddress {
                address,
                duplicate_of,
            } => write!(
                f,
                "genesis alloc key {address} is the same account as {duplicate_of}"
            ),
            Self::GenesisBalanceInvalid { address, raw } => {
                write!(f, "genesis balance for {address} is not a number: {raw}")
            }
            Self::TreasuryMissing { address } => {
                write!(f, "treasury {address} not found in genesis alloc")
            }
            Self::EmptyExport => write!(f, "export contains no records"),
            Self::MetadataMissing { line } => {
                write!(f, "line {line}: export does not start with a metadata record")
            }
            Self::MetadataRepeated { line } => {
                write!(f, "line {line}: metadata record after the first line")
            }
            Self::HeightMissing { line } => write!(
                f,
                "line {line}: metadata has no readable height, block count cannot be checked"
            ),
            Self::HeightOutOfRange { line, height } => write!(
                f,
                "line {line}: metadata height {height} is too large to check the block count against"
            ),
            Self::MalformedLine { line, error } => write!(f, "line {line}: malformed, {error}"),
            Self::DuplicateBlock { line, key } => {
                write!(f, "line {line}: block {key} was already exported")
            }
            Self::BlockGap {
                line,
                expected,
                found,
            } => write!(f, "line {line}: expected block {expected}, found {found}"),
            Self::ParentHashMismatch {
                line,
                number,
                expected,
                found,
            } => write!(
                f,
                "line {line}: block {number} has parent hash {found}, previous block hash is {expected}"
            ),
            Self::BlockAfterLastNumber { line, found } => write!(
                f,
                "line {line}: block {found} follows block {}, the highest possible number",
                u64::MAX
            ),
            Self::Truncated {
                declared_height,
                expected_blocks,
                unique_blocks,
                requested_range,
            } => {
                write!(
                    f,
                    "export is truncated: height {declared_height} needs {expected_blocks} blocks, found {unique_blocks}"
                )?;
                match requested_range {
                    Some((start, end)) => {
                        write!(f, " (export was limited to blocks {start}-{end})")
                    }
                    None => Ok(()),
                }
            }
            Self::ExcessBlocks {
                declared_height,
                expected_blocks,
                unique_blocks,
            } => write!(
                f,
                "export has {unique_blocks} blocks but height {declared_height} allows only {expected_blocks}"
            ),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    pub chain_id: Option<u64>,
    pub gas_limit: Option<u64>,
    pub genesis_account_count: usize,
    pub total_genesis_balance: WeiNewtype,
    pub treasury_address: String,
    pub treasury_balance: Option<WeiNewtype>,
    pub export_version: Option<String>,
    pub declared_height: Option<u64>,
    /// `declared_height + 1`, when the height is usable.
    pub expected_block_count: Option<u64>,
    pub observed_block_count: u64,
    pub unique_block_key_count: u64,
    /// True when the export holds exactly `declared_height + 1` block records, duplicates included.
    /// Truncation is judged on unique blocks instead.
    pub block_count_matches_height: bool,
    pub state_entry_count: u64,
    pub state_entries_by_bucket: BTreeMap<String, u64>,
    pub malformed_line_count: u64,
    pub unclassified_line_count: u64,
    pub first_block_time: Option<DateTime<Utc>>,
    pub last_block_time: Option<DateTime<Utc>>,
    pub discrepancies: Vec<Discrepancy>,
}

impl ReconciliationReport {
    pub fn is_consistent(&self) -> bool {
        self.discrepancies.is_empty()
    }
}
