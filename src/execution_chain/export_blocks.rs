//! Walks the chain one block at a time over RPC and writes every block as a line of JSON. The
//! first line is always an [`ExportMetadata`] record carrying the chain height observed when the
//! export started.
use std::{
    fmt::Display,
    fs::{self, File, OpenOptions},
    io::{self, BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use pit_wall::Progress;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use super::{
    node::{BlockHash, BlockNumber, Difficulty, ExecutionNode, ExecutionNodeBlock, RpcError},
    BlockRange,
};

pub const EXPORT_FORMAT_VERSION: &str = "1.0.0";
pub const EXPORT_SOURCE: &str = "rpc";

const PROGRESS_LOG_INTERVAL: u64 = 1000;

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum ExportRecordType {
    #[serde(rename = "blockchain-export")]
    Metadata,
    #[serde(rename = "block")]
    Block,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExportMetadata {
    pub version: String,
    #[serde(rename = "type")]
    pub record_type: ExportRecordType,
    pub source: String,
    /// Chain height when the export started, the analyzer compares record counts against it.
    pub height: BlockNumber,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_block: Option<BlockNumber>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_block: Option<BlockNumber>,
}

impl ExportMetadata {
    fn new(height: BlockNumber, range: Option<&BlockRange>) -> Self {
        Self {
            version: EXPORT_FORMAT_VERSION.to_string(),
            record_type: ExportRecordType::Metadata,
            source: EXPORT_SOURCE.to_string(),
            height,
            export_time: Some(Utc::now()),
            start_block: range.map(|range| range.start),
            end_block: range.map(|range| range.end),
        }
    }
}

/// A block as written to the export, every quantity decoded to an integer.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlockRecord {
    #[serde(rename = "type")]
    pub record_type: ExportRecordType,
    pub number: BlockNumber,
    pub hash: BlockHash,
    pub parent_hash: BlockHash,
    pub timestamp: u64,
    pub gas_used: u64,
    pub gas_limit: u64,
    pub difficulty: Difficulty,
    pub miner: String,
    pub transactions: Vec<Value>,
    pub uncles: Vec<BlockHash>,
}

impl From<ExecutionNodeBlock> for BlockRecord {
    fn from(block: ExecutionNodeBlock) -> Self {
        Self {
            record_type: ExportRecordType::Block,
            number: block.number,
            hash: block.hash,
            parent_hash: block.parent_hash,
            timestamp: block.timestamp,
            gas_used: block.gas_used,
            gas_limit: block.gas_limit,
            difficulty: block.difficulty,
            miner: block.miner,
            transactions: block.transactions,
            uncles: block.uncles,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExportMode {
    /// Start over, truncating whatever is at the export path.
    #[default]
    Fresh,
    /// Continue an earlier, interrupted export after its last complete block record.
    Resume,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExportOptions {
    /// Ignored when resuming, the existing file decides where to pick up.
    pub start_block: BlockNumber,
    /// Highest block number to export. A resume continues up to the end block recorded in the
    /// metadata line and refuses a limit that differs from it.
    pub height_limit: Option<BlockNumber>,
    pub mode: ExportMode,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// The node answered null for this block number.
    Missing,
    Timeout,
    Rpc(String),
    Decode(String),
    /// The node answered with a block for another number.
    NumberMismatch(BlockNumber),
}

impl Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Missing => write!(f, "node returned no block"),
            SkipReason::Timeout => write!(f, "timed out"),
            SkipReason::Rpc(message) => write!(f, "node error, {message}"),
            SkipReason::Decode(message) => write!(f, "undecodable block, {message}"),
            SkipReason::NumberMismatch(got) => write!(f, "node answered with block {got}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SkippedBlock {
    pub number: BlockNumber,
    pub reason: SkipReason,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportSummary {
    pub declared_height: BlockNumber,
    pub range: Option<BlockRange>,
    pub written: u64,
    pub skipped: Vec<SkippedBlock>,
    pub last_written: Option<BlockNumber>,
    /// Stopped early because the stop flag was raised.
    pub cancelled: bool,
}

impl ExportSummary {
    fn new(declared_height: BlockNumber, range: Option<BlockRange>) -> Self {
        Self {
            declared_height,
            range,
            written: 0,
            skipped: vec![],
            last_written: None,
            cancelled: false,
        }
    }

    pub fn planned(&self) -> u64 {
        self.range.as_ref().map_or(0, BlockRange::count)
    }

    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.skipped.is_empty() && self.written == self.planned()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ExportOutcome {
    /// The node reported height zero, nothing was written.
    EmptyChain,
    Exported(ExportSummary),
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to query chain height: {0}")]
    Height(#[source] RpcError),
    #[error("failed to access export file {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("export file {0} has no metadata record to resume from")]
    Unresumable(PathBuf),
    #[error("export file {path} was started with end block {recorded}, cannot resume it up to block {requested}")]
    ResumeRangeMismatch {
        path: PathBuf,
        recorded: BlockNumber,
        requested: BlockNumber,
    },
    #[error(
        "export interrupted, exported {} of {} blocks: {source}",
        .progress.written,
        .progress.planned()
    )]
    Interrupted {
        progress: ExportSummary,
        #[source]
        source: RpcError,
    },
    #[error(
        "failed writing export, exported {} of {} blocks: {source}",
        .progress.written,
        .progress.planned()
    )]
    Write {
        progress: ExportSummary,
        #[source]
        source: io::Error,
    },
}

fn write_line<W: Write, T: Serialize>(writer: &mut W, record: &T) -> io::Result<()> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    writer.write_all(&line)
}

/// Where an earlier export left off.
#[derive(Debug, PartialEq, Eq)]
struct ResumePoint {
    metadata: ExportMetadata,
    last_written: Option<BlockNumber>,
    /// Byte length of the file up to and including the last complete record.
    valid_len: u64,
}

#[derive(Deserialize)]
struct BlockNumberProbe {
    number: BlockNumber,
}

fn read_resume_point(path: &Path) -> Result<Option<ResumePoint>, ExportError> {
    let file_error = |source| ExportError::File {
        path: path.to_path_buf(),
        source,
    };

    let file = File::open(path).map_err(file_error)?;
    let mut reader = BufReader::new(file);
    let mut line = Vec::new();
    let mut offset = 0u64;
    let mut metadata = None;
    let mut last_written = None;
    let mut valid_len = 0u64;

    loop {
        line.clear();
        let read = reader.read_until(b'\n', &mut line).map_err(file_error)?;
        if read == 0 {
            break;
        }
        offset += read as u64;

        // An interrupted write leaves a record without its newline, that one gets dropped.
        if line.last() != Some(&b'\n') {
            debug!(offset, "dropping partial trailing record");
            break;
        }

        match metadata {
            None => match serde_json::from_slice::<ExportMetadata>(&line) {
                Ok(decoded) => {
                    metadata = Some(decoded);
                    valid_len = offset;
                }
                Err(_) => return Ok(None),
            },
            Some(_) => {
                if let Ok(probe) = serde_json::from_slice::<BlockNumberProbe>(&line) {
                    last_written = Some(probe.number);
                    valid_len = offset;
                }
            }
        }
    }

    Ok(metadata.map(|metadata| ResumePoint {
        metadata,
        last_written,
        valid_len,
    }))
}

pub struct ChainWalker<'a, N: ExecutionNode> {
    node: &'a N,
    stop: Option<Arc<AtomicBool>>,
}

impl<'a, N: ExecutionNode> ChainWalker<'a, N> {
    pub fn new(node: &'a N) -> Self {
        Self { node, stop: None }
    }

    /// The walk checks this flag before every block and stops cleanly once it is raised.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    fn should_stop(&self) -> bool {
        self.stop
            .as_ref()
            .map_or(false, |stop| stop.load(Ordering::Relaxed))
    }

    fn query_height(&self) -> Result<Option<BlockNumber>, ExportError> {
        let height = self
            .node
            .get_block_number()
            .map_err(ExportError::Height)?;
        info!(height, "current chain height");

        if height == 0 {
            warn!("chain is at height 0, the node may not have the blockchain data loaded, nothing to export");
            return Ok(None);
        }

        Ok(Some(height))
    }

    /// Exports into any writer. On an empty chain nothing at all is written.
    pub fn export<W: Write>(
        &self,
        writer: &mut W,
        options: &ExportOptions,
    ) -> Result<ExportOutcome, ExportError> {
        let height = match self.query_height()? {
            None => return Ok(ExportOutcome::EmptyChain),
            Some(height) => height,
        };

        let range = BlockRange::up_to_height(options.start_block, height, options.height_limit);
        let metadata = ExportMetadata::new(height, range.as_ref());
        if let Err(source) = write_line(writer, &metadata) {
            return Err(ExportError::Write {
                progress: ExportSummary::new(height, range),
                source,
            });
        }

        self.walk(height, range, writer).map(ExportOutcome::Exported)
    }

    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn export_to_path(
        &self,
        path: &Path,
        options: &ExportOptions,
    ) -> Result<ExportOutcome, ExportError> {
        let file_error = |source| ExportError::File {
            path: path.to_path_buf(),
            source,
        };

        match options.mode {
            ExportMode::Fresh => {
                // The height check comes first so an empty chain never leaves a file behind.
                let height = match self.query_height()? {
                    None => return Ok(ExportOutcome::EmptyChain),
                    Some(height) => height,
                };

                if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty())
                {
                    fs::create_dir_all(parent).map_err(file_error)?;
                }

                let file = File::create(path).map_err(file_error)?;
                let mut writer = BufWriter::new(file);

                let range =
                    BlockRange::up_to_height(options.start_block, height, options.height_limit);
                let metadata = ExportMetadata::new(height, range.as_ref());
                write_line(&mut writer, &metadata).map_err(file_error)?;

                self.walk(height, range, &mut writer)
                    .map(ExportOutcome::Exported)
            }
            ExportMode::Resume => {
                let resume_point =
                    read_resume_point(path)?.ok_or_else(|| ExportError::Unresumable(path.into()))?;

                let file = OpenOptions::new()
                    .write(true)
                    .open(path)
                    .map_err(file_error)?;
                file.set_len(resume_point.valid_len).map_err(file_error)?;
                drop(file);

                let recorded_end = resume_point.metadata.end_block;
                if let (Some(recorded), Some(requested)) = (recorded_end, options.height_limit) {
                    if recorded != requested {
                        return Err(ExportError::ResumeRangeMismatch {
                            path: path.into(),
                            recorded,
                            requested,
                        });
                    }
                }

                let start = match resume_point.last_written {
                    None => Some(resume_point.metadata.start_block.unwrap_or(0)),
                    Some(last_written) => last_written.checked_add(1),
                };
                let height = resume_point.metadata.height;
                let range = start.and_then(|start| {
                    BlockRange::up_to_height(start, height, recorded_end.or(options.height_limit))
                });

                match &range {
                    None => info!(
                        last_written = resume_point.last_written,
                        "export already complete, nothing to resume"
                    ),
                    Some(range) => info!(%range, "resuming export"),
                }

                let file = OpenOptions::new()
                    .append(true)
                    .open(path)
                    .map_err(file_error)?;
                let mut writer = BufWriter::new(file);

                self.walk(height, range, &mut writer)
                    .map(ExportOutcome::Exported)
            }
        }
    }

    /// Fetches blocks strictly in order. Missing blocks, timeouts and node errors skip the block,
    /// only a lost connection ends the walk early.
    fn walk<W: Write>(
        &self,
        declared_height: BlockNumber,
        range: Option<BlockRange>,
        writer: &mut W,
    ) -> Result<ExportSummary, ExportError> {
        let mut summary = ExportSummary::new(declared_height, range.clone());

        let range = match range {
            None => {
                writer
                    .flush()
                    .map_err(|source| ExportError::Write {
                        progress: summary.clone(),
                        source,
                    })?;
                return Ok(summary);
            }
            Some(range) => range,
        };

        info!(%range, "exporting {} blocks", range.count());
        let mut progress = Progress::new("export blocks", range.count());

        for block_number in range {
            if self.should_stop() {
                warn!(block_number, "stop requested, ending export before this block");
                summary.cancelled = true;
                break;
            }

            match self.node.get_block_by_number(block_number, true) {
                Ok(Some(block)) if block.number != block_number => {
                    warn!(
                        block_number,
                        got = block.number,
                        "node answered with a different block, skipping"
                    );
                    summary.skipped.push(SkippedBlock {
                        number: block_number,
                        reason: SkipReason::NumberMismatch(block.number),
                    });
                }
                Ok(Some(block)) => {
                    let record = BlockRecord::from(block);
                    if let Err(source) = write_line(writer, &record) {
                        flush_after_failure(writer);
                        return Err(ExportError::Write {
                            progress: summary,
                            source,
                        });
                    }
                    summary.written += 1;
                    summary.last_written = Some(block_number);
                }
                Ok(None) => {
                    warn!(block_number, "failed to get block, skipping");
                    summary.skipped.push(SkippedBlock {
                        number: block_number,
                        reason: SkipReason::Missing,
                    });
                }
                Err(source @ RpcError::Connection { .. }) => {
                    flush_after_failure(writer);
                    return Err(ExportError::Interrupted {
                        progress: summary,
                        source,
                    });
                }
                Err(error) => {
                    warn!(block_number, %error, "failed to fetch block, skipping");
                    let reason = match error {
                        RpcError::Timeout { .. } => SkipReason::Timeout,
                        RpcError::Decode { message, .. } => SkipReason::Decode(message),
                        other => SkipReason::Rpc(other.to_string()),
                    };
                    summary.skipped.push(SkippedBlock {
                        number: block_number,
                        reason,
                    });
                }
            }

            progress.inc_work_done();
            if block_number % PROGRESS_LOG_INTERVAL == PROGRESS_LOG_INTERVAL - 1 {
                info!("{}", progress.get_progress_string());
            }
        }

        if let Err(source) = writer.flush() {
            return Err(ExportError::Write {
                progress: summary,
                source,
            });
        }

        info!(
            written = summary.written,
            skipped = summary.skipped.len(),
            "export finished"
        );

        Ok(summary)
    }
}

fn flush_after_failure<W: Write>(writer: &mut W) {
    if let Err(error) = writer.flush() {
        error!(%error, "failed to flush export after an earlier failure");
    }
}
