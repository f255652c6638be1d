mod balances;
mod block_range;
mod export_blocks;
mod extensions;
mod node;

pub use balances::addresses_to_check;
pub use balances::check_balances;
pub use balances::BalanceCheck;

pub use block_range::BlockRange;

pub use export_blocks::BlockRecord;
pub use export_blocks::ChainWalker;
pub use export_blocks::ExportError;
pub use export_blocks::ExportMetadata;
pub use export_blocks::ExportMode;
pub use export_blocks::ExportOptions;
pub use export_blocks::ExportOutcome;
pub use export_blocks::ExportRecordType;
pub use export_blocks::ExportSummary;
pub use export_blocks::SkipReason;
pub use export_blocks::SkippedBlock;
pub use export_blocks::EXPORT_FORMAT_VERSION;

pub use extensions::probe_extensions;
pub use extensions::ExtensionProbe;
pub use extensions::ExtensionStatus;

pub use node::BlockHash;
pub use node::BlockNumber;
pub use node::CallWeight;
pub use node::ExecutionNode;
pub use node::ExecutionNodeBlock;
pub use node::ExecutionNodeHttp;
pub use node::MockExecutionNode;
pub use node::RpcError;
