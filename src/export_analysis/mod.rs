//! Reconciles a line-delimited block export with the genesis it should descend from. The export
//! is streamed once, per-line problems are counted and reported, only failing to read the files
//! at all is an error.
mod report;

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::{
    genesis::{address_id, check_address, AddressCheck, AllocBalance, GenesisConfig, GenesisError},
    json_codecs::from_lenient_u64_quantity,
    units::WeiNewtype,
};

pub use report::Discrepancy;
pub use report::ReconciliationReport;

/// Record type discriminators accepted for the leading metadata line. `metadata` is what the
/// database dump tooling writes.
const METADATA_RECORD_TYPES: [&str; 2] = ["blockchain-export", "metadata"];
const BLOCK_RECORD_TYPE: &str = "block";

const PROGRESS_LOG_INTERVAL: u64 = 100_000;

#[derive(Debug, Error)]
pub enum AnalyzeError {
    #[error("failed to read export {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Genesis(#[from] GenesisError),
}

/// Every field a line might carry, all optional. Block records come from the RPC walker, state
/// and `key_id` keyed records from database dumps.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportLine {
    #[serde(rename = "type")]
    record_type: Option<Value>,
    version: Option<Value>,
    #[serde(default, deserialize_with = "from_lenient_u64_quantity")]
    height: Option<u64>,
    #[serde(default, deserialize_with = "from_lenient_u64_quantity")]
    start_block: Option<u64>,
    #[serde(default, deserialize_with = "from_lenient_u64_quantity")]
    end_block: Option<u64>,
    #[serde(default, deserialize_with = "from_lenient_u64_quantity")]
    number: Option<u64>,
    hash: Option<Value>,
    parent_hash: Option<Value>,
    #[serde(default, deserialize_with = "from_lenient_u64_quantity")]
    timestamp: Option<u64>,
    #[serde(rename = "key_id")]
    key_id: Option<Value>,
    bucket: Option<Value>,
}

impl ExportLine {
    fn record_type(&self) -> Option<&str> {
        self.record_type.as_ref().and_then(Value::as_str)
    }

    fn is_metadata(&self) -> bool {
        self.record_type()
            .map_or(false, |record_type| METADATA_RECORD_TYPES.contains(&record_type))
    }

    fn is_block(&self) -> bool {
        self.record_type() == Some(BLOCK_RECORD_TYPE)
    }

    fn hash(&self) -> Option<String> {
        self.hash.as_ref().and_then(Value::as_str).map(str::to_lowercase)
    }

    fn parent_hash(&self) -> Option<String> {
        self.parent_hash
            .as_ref()
            .and_then(Value::as_str)
            .map(str::to_lowercase)
    }

    /// Identity used to spot a block exported twice: `key_id`, else hash, else number.
    fn block_key(&self) -> Option<String> {
        let key_id = self.key_id.as_ref().and_then(|key_id| match key_id {
            Value::Null => None,
            Value::String(key_id) if key_id.is_empty() => None,
            Value::String(key_id) => Some(key_id.clone()),
            other => Some(other.to_string()),
        });

        key_id
            .or_else(|| self.hash())
            .or_else(|| self.number.map(|number| number.to_string()))
    }

    /// Lines with a non-empty, non-zero `bucket` are state entries, grouped by bucket.
    fn state_bucket(&self) -> Option<String> {
        match self.bucket.as_ref()? {
            Value::Null | Value::Bool(false) => None,
            Value::String(bucket) if bucket.is_empty() => None,
            Value::String(bucket) => Some(bucket.clone()),
            Value::Number(number) if number.as_f64() == Some(0.0) => None,
            other => Some(other.to_string()),
        }
    }
}

fn parse_line(line: &str) -> Result<ExportLine, String> {
    let value = serde_json::from_str::<Value>(line).map_err(|error| error.to_string())?;
    if !value.is_object() {
        return Err("not a JSON object".to_string());
    }
    serde_json::from_value::<ExportLine>(value).map_err(|error| error.to_string())
}

fn block_time(timestamp: u64) -> Option<DateTime<Utc>> {
    let seconds = i64::try_from(timestamp).ok()?;
    Utc.timestamp_opt(seconds, 0).single()
}

struct PreviousBlock {
    number: u64,
    hash: Option<String>,
}

/// Builds the report incrementally, one line at a time, in a single pass.
pub struct ReportBuilder {
    treasury_address: String,
    line_number: u64,
    seen_first_record: bool,
    export_version: Option<String>,
    declared_height: Option<u64>,
    requested_range: Option<(u64, u64)>,
    observed_block_count: u64,
    block_keys: HashSet<String>,
    previous_block: Option<PreviousBlock>,
    state_entries_by_bucket: BTreeMap<String, u64>,
    malformed_line_count: u64,
    unclassified_line_count: u64,
    first_timestamp: Option<u64>,
    last_timestamp: Option<u64>,
    genesis: GenesisSummary,
    discrepancies: Vec<Discrepancy>,
}

struct GenesisSummary {
    chain_id: Option<u64>,
    gas_limit: Option<u64>,
    account_count: usize,
    total_balance: WeiNewtype,
    treasury_balance: Option<WeiNewtype>,
}

impl ReportBuilder {
    /// Genesis checks run first, their findings lead the discrepancy list.
    pub fn new(genesis: &GenesisConfig, treasury_address: &str) -> Self {
        let mut discrepancies = vec![];

        if genesis.chain_id.is_none() {
            discrepancies.push(Discrepancy::GenesisFieldMissing {
                field: "config.chainId",
            });
        }
        if genesis.gas_limit.is_none() {
            discrepancies.push(Discrepancy::GenesisFieldMissing { field: "gasLimit" });
        }

        let mut owners: HashMap<String, &str> = HashMap::new();
        for entry in &genesis.alloc {
            match check_address(&entry.address) {
                AddressCheck::Canonical => {}
                AddressCheck::Truncated(_) => {
                    discrepancies.push(Discrepancy::GenesisAddressLength {
                        address: entry.address.clone(),
                        length: crate::genesis::CORRUPTED_ADDRESS_HEX_LEN,
                    })
                }
                AddressCheck::Anomalous(length) => {
                    discrepancies.push(Discrepancy::GenesisAddressLength {
                        address: entry.address.clone(),
                        length,
                    })
                }
            }

            match owners.get(&address_id(&entry.address)) {
                Some(first) => discrepancies.push(Discrepancy::GenesisDuplicateAddress {
                    address: entry.address.clone(),
                    duplicate_of: first.to_string(),
                }),
                None => {
                    owners.insert(address_id(&entry.address), &entry.address);
                }
            }

            if let AllocBalance::Invalid(raw) = &entry.balance {
                discrepancies.push(Discrepancy::GenesisBalanceInvalid {
                    address: entry.address.clone(),
                    raw: raw.to_string(),
                });
            }
        }

        let treasury_balance = match genesis.find_account(treasury_address) {
            Some(entry) => Some(entry.parsed_balance().cloned().unwrap_or_default()),
            None => {
                discrepancies.push(Discrepancy::TreasuryMissing {
                    address: treasury_address.to_string(),
                });
                None
            }
        };

        Self {
            treasury_address: treasury_address.to_string(),
            line_number: 0,
            seen_first_record: false,
            export_version: None,
            declared_height: None,
            requested_range: None,
            observed_block_count: 0,
            block_keys: HashSet::new(),
            previous_block: None,
            state_entries_by_bucket: BTreeMap::new(),
            malformed_line_count: 0,
            unclassified_line_count: 0,
            first_timestamp: None,
            last_timestamp: None,
            genesis: GenesisSummary {
                chain_id: genesis.chain_id,
                gas_limit: genesis.gas_limit,
                account_count: genesis.alloc.len(),
                total_balance: genesis.total_balance(),
                treasury_balance,
            },
            discrepancies,
        }
    }

    fn next_line(&mut self) {
        self.line_number += 1;
        if self.line_number % PROGRESS_LOG_INTERVAL == 0 {
            info!(lines = self.line_number, "analyzing export");
        }
    }

    fn record_malformed(&mut self, error: String) {
        debug!(line = self.line_number, %error, "skipping malformed line");
        self.malformed_line_count += 1;
        self.discrepancies.push(Discrepancy::MalformedLine {
            line: self.line_number,
            error,
        });
    }

    /// Counts a line that could not even be decoded as text.
    pub fn observe_undecodable_line(&mut self, error: String) {
        self.next_line();
        self.record_malformed(error);
    }

    pub fn observe_line(&mut self, line: &str) {
        self.next_line();

        if line.trim().is_empty() {
            return;
        }

        let record = match parse_line(line) {
            Ok(record) => record,
            Err(error) => {
                self.record_malformed(error);
                return;
            }
        };

        let is_first_record = !self.seen_first_record;
        self.seen_first_record = true;

        if record.is_metadata() {
            if is_first_record {
                self.observe_metadata(&record);
            } else {
                self.discrepancies.push(Discrepancy::MetadataRepeated {
                    line: self.line_number,
                });
            }
            return;
        }

        if is_first_record {
            self.discrepancies.push(Discrepancy::MetadataMissing {
                line: self.line_number,
            });
        }

        if record.is_block() {
            self.observe_block(&record);
        } else if let Some(bucket) = record.state_bucket() {
            *self.state_entries_by_bucket.entry(bucket).or_insert(0) += 1;
        } else {
            self.unclassified_line_count += 1;
        }
    }

    fn observe_metadata(&mut self, record: &ExportLine) {
        self.export_version = record.version.as_ref().map(|version| match version {
            Value::String(version) => version.clone(),
            other => other.to_string(),
        });
        self.declared_height = record.height;
        self.requested_range = record.start_block.zip(record.end_block);

        match record.height {
            None => self.discrepancies.push(Discrepancy::HeightMissing {
                line: self.line_number,
            }),
            Some(height) if height.checked_add(1).is_none() => {
                self.discrepancies.push(Discrepancy::HeightOutOfRange {
                    line: self.line_number,
                    height,
                })
            }
            Some(_) => {}
        }
        debug!(declared_height = ?self.declared_height, "read export metadata");
    }

    fn observe_block(&mut self, record: &ExportLine) {
        self.observed_block_count += 1;

        if let Some(key) = record.block_key() {
            if !self.block_keys.insert(key.clone()) {
                self.discrepancies.push(Discrepancy::DuplicateBlock {
                    line: self.line_number,
                    key,
                });
                return;
            }
        }

        if let Some(timestamp) = record.timestamp {
            self.first_timestamp = Some(self.first_timestamp.map_or(timestamp, |t| t.min(timestamp)));
            self.last_timestamp = Some(self.last_timestamp.map_or(timestamp, |t| t.max(timestamp)));
        }

        let number = match record.number {
            Some(number) => number,
            None => return,
        };
        let hash = record.hash();

        if let Some(previous) = &self.previous_block {
            match previous.number.checked_add(1) {
                None => self.discrepancies.push(Discrepancy::BlockAfterLastNumber {
                    line: self.line_number,
                    found: number,
                }),
                Some(expected) if number != expected => {
                    self.discrepancies.push(Discrepancy::BlockGap {
                        line: self.line_number,
                        expected,
                        found: number,
                    })
                }
                Some(_) => {
                    if let (Some(previous_hash), Some(parent_hash)) =
                        (&previous.hash, record.parent_hash())
                    {
                        if previous_hash != &parent_hash {
                            self.discrepancies.push(Discrepancy::ParentHashMismatch {
                                line: self.line_number,
                                number,
                                expected: previous_hash.clone(),
                                found: parent_hash,
                            });
                        }
                    }
                }
            }
        }

        self.previous_block = Some(PreviousBlock { number, hash });
    }

    pub fn finish(mut self) -> ReconciliationReport {
        if !self.seen_first_record && self.malformed_line_count == 0 {
            self.discrepancies.push(Discrepancy::EmptyExport);
        }

        let unique_block_key_count = self.block_keys.len() as u64;

        // Unreadable or unusable heights were reported with the metadata line.
        let expected_block_count = self
            .declared_height
            .and_then(|declared_height| declared_height.checked_add(1));

        let block_count_matches_height = match self.declared_height.zip(expected_block_count) {
            Some((declared_height, expected_blocks)) => {
                if unique_block_key_count < expected_blocks {
                    self.discrepancies.push(Discrepancy::Truncated {
                        declared_height,
                        expected_blocks,
                        unique_blocks: unique_block_key_count,
                        requested_range: self.requested_range,
                    });
                } else if unique_block_key_count > expected_blocks {
                    self.discrepancies.push(Discrepancy::ExcessBlocks {
                        declared_height,
                        expected_blocks,
                        unique_blocks: unique_block_key_count,
                    });
                }
                self.observed_block_count == expected_blocks
            }
            None => false,
        };

        for discrepancy in &self.discrepancies {
            warn!(%discrepancy, "reconciliation discrepancy");
        }

        ReconciliationReport {
            chain_id: self.genesis.chain_id,
            gas_limit: self.genesis.gas_limit,
            genesis_account_count: self.genesis.account_count,
            total_genesis_balance: self.genesis.total_balance,
            treasury_address: self.treasury_address,
            treasury_balance: self.genesis.treasury_balance,
            export_version: self.export_version,
            declared_height: self.declared_height,
            expected_block_count,
            observed_block_count: self.observed_block_count,
            unique_block_key_count,
            block_count_matches_height,
            state_entry_count: self.state_entries_by_bucket.values().sum(),
            state_entries_by_bucket: self.state_entries_by_bucket,
            malformed_line_count: self.malformed_line_count,
            unclassified_line_count: self.unclassified_line_count,
            first_block_time: self.first_timestamp.and_then(block_time),
            last_block_time: self.last_timestamp.and_then(block_time),
            discrepancies: self.discrepancies,
        }
    }
}

pub fn analyze<I, S>(genesis: &GenesisConfig, treasury_address: &str, lines: I) -> ReconciliationReport
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut builder = ReportBuilder::new(genesis, treasury_address);
    for line in lines {
        builder.observe_line(line.as_ref());
    }
    builder.finish()
}

/// Streams the export without loading it whole. Lines that are not valid UTF-8 count as
/// malformed.
pub fn analyze_reader<R: BufRead>(
    genesis: &GenesisConfig,
    treasury_address: &str,
    mut reader: R,
) -> std::io::Result<ReconciliationReport> {
    let mut builder = ReportBuilder::new(genesis, treasury_address);
    let mut buffer = vec![];

    loop {
        buffer.clear();
        if reader.read_until(b'\n', &mut buffer)? == 0 {
            break;
        }
        match std::str::from_utf8(&buffer) {
            Ok(line) => builder.observe_line(line),
            Err(error) => builder.observe_undecodable_line(format!("invalid utf-8: {error}")),
        }
    }

    Ok(builder.finish())
}

#[instrument(skip_all, fields(genesis = %genesis_path.display(), export = %export_path.display()))]
pub fn analyze_files(
    genesis_path: &Path,
    export_path: &Path,
    treasury_address: &str,
) -> Result<ReconciliationReport, AnalyzeError> {
    let genesis = GenesisConfig::load(genesis_path)?;
    let file = File::open(export_path).map_err(|source| AnalyzeError::Io {
        path: export_path.to_path_buf(),
        source,
    })?;

    analyze_reader(&genesis, treasury_address, BufReader::new(file)).map_err(|source| {
        AnalyzeError::Io {
            path: export_path.to_path_buf(),
            source,
        }
    })
}
