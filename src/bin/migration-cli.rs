use std::{
    fmt::Display,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use migration_verify::{
    addresses_to_check, analyze_files, check_balances,
    execution_chain::{ExtensionStatus, SkippedBlock},
    genesis::{known_genesis_files, GenesisFixOutcome},
    fix_genesis_files, log, probe_extensions, AllocMergePolicy, ChainWalker, ExecutionNode,
    ExecutionNodeHttp, ExportError, ExportMode, ExportOptions, ExportOutcome, ExportSummary,
    GenesisError, MigrationConfig, Normalizer, ReconciliationReport,
};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// JSON-RPC endpoint of the migrated node, overrides RPC_URL.
    #[clap(long, global = true)]
    rpc_url: Option<String>,
    /// Genesis file to analyze or fix, overrides GENESIS_PATH.
    #[clap(long, global = true)]
    genesis_path: Option<PathBuf>,
    /// Line-delimited export file, overrides EXPORT_PATH.
    #[clap(long, global = true)]
    export_path: Option<PathBuf>,
    /// Treasury address, overrides TREASURY_ADDRESS.
    #[clap(long, global = true)]
    treasury: Option<String>,
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the chain height and the latest balance of the treasury and any extra addresses.
    CheckBalance {
        addresses: Vec<String>,
    },
    /// Walk the chain over RPC and write every block to the export file.
    Export {
        /// First block to export.
        #[clap(long, default_value_t = 0)]
        start: u64,
        /// Highest block to export, overrides EXPORT_HEIGHT_LIMIT.
        #[clap(long)]
        limit: Option<u64>,
        /// Continue an interrupted export after its last complete block, up to the end block it
        /// was started with.
        #[clap(long)]
        resume: bool,
    },
    /// Repair 32 byte addresses in genesis files, keeping a .backup of every original.
    FixGenesis {
        /// Files to fix, defaults to the configured genesis path.
        paths: Vec<PathBuf>,
        /// Fix the well known genesis files in this directory instead.
        #[clap(long, conflicts_with = "paths")]
        dir: Option<PathBuf>,
        /// What to do when a repaired alloc key collides with an existing one.
        #[clap(long, value_enum, default_value_t = MergePolicy::Flag)]
        merge_policy: MergePolicy,
    },
    /// Reconcile the export file against the genesis file.
    Analyze {
        /// Print the report as JSON.
        #[clap(long)]
        json: bool,
    },
    /// Check whether the node ships the chain specific replay and verify methods.
    ProbeExtensions {},
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum MergePolicy {
    Flag,
    Sum,
    PreferCanonical,
}

impl From<MergePolicy> for AllocMergePolicy {
    fn from(policy: MergePolicy) -> Self {
        match policy {
            MergePolicy::Flag => AllocMergePolicy::Flag,
            MergePolicy::Sum => AllocMergePolicy::Sum,
            MergePolicy::PreferCanonical => AllocMergePolicy::PreferCanonical,
        }
    }
}

impl Cli {
    fn config(&self) -> MigrationConfig {
        let mut config = MigrationConfig::from_env();
        if let Some(rpc_url) = &self.rpc_url {
            config.rpc_endpoint = rpc_url.clone();
        }
        if let Some(genesis_path) = &self.genesis_path {
            config.genesis_path = genesis_path.clone();
        }
        if let Some(export_path) = &self.export_path {
            config.export_path = export_path.clone();
        }
        if let Some(treasury) = &self.treasury {
            config.treasury_address = treasury.clone();
        }
        config
    }
}

fn main() -> anyhow::Result<()> {
    log::init();

    let cli = Cli::parse();
    let config = cli.config();

    match cli.command {
        Commands::CheckBalance { addresses } => check_balance(&config, &addresses),
        Commands::Export {
            start,
            limit,
            resume,
        } => export(&config, start, limit, resume),
        Commands::FixGenesis {
            paths,
            dir,
            merge_policy,
        } => fix_genesis(&config, paths, dir, merge_policy),
        Commands::Analyze { json } => analyze(&config, json),
        Commands::ProbeExtensions {} => probe(&config),
    }
}

fn or_unknown<T: Display>(value: Option<T>) -> String {
    value.map_or_else(|| "unknown".to_string(), |value| value.to_string())
}

fn check_balance(config: &MigrationConfig, extra: &[String]) -> anyhow::Result<()> {
    let node = ExecutionNodeHttp::new(config);
    println!("rpc: {}", node.url());

    match node.get_block_number() {
        Ok(height) => println!("current block height: {height}"),
        Err(error) => warn!(%error, "failed to get block height"),
    }

    let addresses = addresses_to_check(&config.treasury_address, extra);
    let checks = check_balances(&node, &addresses);

    let mut failed = 0;
    for check in &checks {
        match &check.balance {
            Ok(balance) => println!(
                "{}: {} ({} wei)",
                check.address,
                balance.to_native_string(),
                balance
            ),
            Err(error) => {
                failed += 1;
                println!("{}: failed, {}", check.address, error);
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} balance checks failed", checks.len());
    }

    Ok(())
}

fn print_export_summary(summary: &ExportSummary, config: &MigrationConfig) {
    println!(
        "exported {} of {} blocks to {} (chain height {})",
        summary.written,
        summary.planned(),
        config.export_path.display(),
        summary.declared_height
    );
    if let Some(last_written) = summary.last_written {
        println!("last exported block: {last_written}");
    }
    for SkippedBlock { number, reason } in &summary.skipped {
        println!("  skipped block {number}: {reason}");
    }
    if summary.cancelled {
        println!("export was stopped early, rerun with --resume to continue");
    }
}

fn export(
    config: &MigrationConfig,
    start: u64,
    limit: Option<u64>,
    resume: bool,
) -> anyhow::Result<()> {
    let node = ExecutionNodeHttp::new(config);

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || {
        handler_stop.store(true, Ordering::Relaxed);
    })
    .context("failed to install stop signal handler")?;

    let options = ExportOptions {
        start_block: start,
        // A resume follows the range recorded in the file unless told otherwise.
        height_limit: if resume {
            limit
        } else {
            limit.or(config.export_height_limit)
        },
        mode: if resume {
            ExportMode::Resume
        } else {
            ExportMode::Fresh
        },
    };
    info!(?options, path = %config.export_path.display(), "starting export");

    let walker = ChainWalker::new(&node).with_stop_flag(stop);
    match walker.export_to_path(&config.export_path, &options) {
        Ok(ExportOutcome::EmptyChain) => {
            println!("chain height is 0, the node may not have the blockchain data loaded, nothing exported");
            Ok(())
        }
        Ok(ExportOutcome::Exported(summary)) => {
            print_export_summary(&summary, config);
            Ok(())
        }
        Err(error) => {
            if let ExportError::Interrupted { progress, .. } | ExportError::Write { progress, .. } =
                &error
            {
                print_export_summary(progress, config);
            }
            Err(error.into())
        }
    }
}

fn print_fix_outcome(outcome: &GenesisFixOutcome) {
    if outcome.changed {
        println!(
            "fixed {}: {} corrections, {} warnings",
            outcome.path.display(),
            outcome.correction_count(),
            outcome.warning_count()
        );
    } else {
        println!(
            "unchanged {}: {} warnings",
            outcome.path.display(),
            outcome.warning_count()
        );
    }
    if outcome.backup_created {
        println!("  created backup {}", outcome.backup_path.display());
    }
    for event in &outcome.events {
        println!("  {event}");
    }
}

fn fix_genesis(
    config: &MigrationConfig,
    paths: Vec<PathBuf>,
    dir: Option<PathBuf>,
    merge_policy: MergePolicy,
) -> anyhow::Result<()> {
    let paths = match (paths.is_empty(), dir) {
        (false, _) => paths,
        (true, Some(dir)) => known_genesis_files(&dir),
        (true, None) => vec![config.genesis_path.clone()],
    };

    let normalizer = Normalizer::new().with_merge_policy(merge_policy.into());
    let results = fix_genesis_files(&paths, &normalizer);

    let mut failed = 0;
    for (path, result) in &results {
        match result {
            Ok(outcome) => print_fix_outcome(outcome),
            Err(GenesisError::NotFound(_)) => println!("skipped {}: not found", path.display()),
            Err(error) => {
                failed += 1;
                println!("failed {}: {error}", path.display());
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} genesis files could not be fixed", results.len());
    }

    Ok(())
}

fn matches_expected(expected: Option<u64>, count: u64) -> &'static str {
    match expected {
        Some(expected) if expected == count => "matches",
        Some(_) => "does not match",
        None => "cannot be checked",
    }
}

fn print_report(report: &ReconciliationReport) {
    println!("genesis");
    println!("  chain id: {}", or_unknown(report.chain_id));
    println!("  gas limit: {}", or_unknown(report.gas_limit));
    println!("  accounts: {}", report.genesis_account_count);
    println!(
        "  total balance: {} ({} wei)",
        report.total_genesis_balance.to_native_string(),
        report.total_genesis_balance
    );
    match &report.treasury_balance {
        Some(balance) => println!(
            "  treasury {}: {} ({} wei)",
            report.treasury_address,
            balance.to_native_string(),
            balance
        ),
        None => println!("  treasury {}: not in genesis", report.treasury_address),
    }

    println!("export");
    println!("  version: {}", or_unknown(report.export_version.as_ref()));
    println!("  declared height: {}", or_unknown(report.declared_height));
    println!(
        "  expected blocks (height + 1): {}",
        or_unknown(report.expected_block_count)
    );
    println!(
        "  block records: {} ({})",
        report.observed_block_count,
        matches_expected(report.expected_block_count, report.observed_block_count)
    );
    println!(
        "  unique blocks: {} ({})",
        report.unique_block_key_count,
        matches_expected(report.expected_block_count, report.unique_block_key_count)
    );
    println!("  state entries: {}", report.state_entry_count);
    for (bucket, count) in &report.state_entries_by_bucket {
        println!("    bucket {bucket}: {count}");
    }
    println!("  malformed lines: {}", report.malformed_line_count);
    println!("  unclassified lines: {}", report.unclassified_line_count);
    println!("  first block time: {}", or_unknown(report.first_block_time));
    println!("  last block time: {}", or_unknown(report.last_block_time));

    println!("discrepancies: {}", report.discrepancies.len());
    for discrepancy in &report.discrepancies {
        println!("  {discrepancy}");
    }
}

fn analyze(config: &MigrationConfig, json: bool) -> anyhow::Result<()> {
    let report = analyze_files(
        &config.genesis_path,
        &config.export_path,
        &config.treasury_address,
    )?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    Ok(())
}

fn probe(config: &MigrationConfig) -> anyhow::Result<()> {
    let node = ExecutionNodeHttp::new(config);

    for probe in probe_extensions(&node) {
        match probe.status {
            ExtensionStatus::Available(result) => println!("{}: {result}", probe.method),
            ExtensionStatus::Unavailable => println!("{}: not available", probe.method),
            ExtensionStatus::Failed(error) => println!("{}: failed, {error}", probe.method),
        }
    }

    Ok(())
}
