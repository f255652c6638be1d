pub mod config;
mod env;
pub mod execution_chain;
pub mod export_analysis;
pub mod genesis;
mod json_codecs;
pub mod log;
pub mod units;

pub use config::MigrationConfig;
pub use execution_chain::{
    addresses_to_check, check_balances, probe_extensions, ChainWalker, ExecutionNode,
    ExecutionNodeHttp, ExportError, ExportMode, ExportOptions, ExportOutcome, ExportSummary,
    RpcError,
};
pub use export_analysis::{analyze, analyze_files, AnalyzeError, Discrepancy, ReconciliationReport};
pub use genesis::{
    fix_genesis_file, fix_genesis_files, AllocMergePolicy, GenesisConfig, GenesisError,
    NormalizationEvent, Normalizer,
};
