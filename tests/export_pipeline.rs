use std::{fs, path::Path};

use mockito::{Matcher, Mock, Server};
use serde_json::{json, Value};

use migration_verify::{
    analyze_files, execution_chain::ExportMetadata, ChainWalker, Discrepancy, ExecutionNodeHttp,
    ExportOptions, ExportOutcome, MigrationConfig,
};

const TREASURY: &str = "0x9011E888251AB053B7bD1cdB598Db4f9DEd94714";
const RPC_PATH: &str = "/ext/bc/C/rpc";

fn hash(n: u64) -> String {
    format!("0x{n:064X}")
}

fn rpc_block(number: u64) -> Value {
    json!({
        "hash": hash(number + 1),
        "parentHash": hash(number),
        "number": format!("0x{number:x}"),
        "timestamp": format!("0x{:x}", 1_700_000_000 + number * 2),
        "gasUsed": "0x0",
        "gasLimit": "0xb71b00",
        "difficulty": "0x1",
        "miner": "0x0100000000000000000000000000000000000000",
        "transactions": [],
        "uncles": []
    })
}

fn mock_call(server: &mut Server, request: Value, result: Value) -> Mock {
    server
        .mock("POST", RPC_PATH)
        .match_body(Matcher::PartialJson(request))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({ "jsonrpc": "2.0", "id": 1, "result": result }).to_string())
        .create()
}

fn mock_height(server: &mut Server, height: u64) -> Mock {
    mock_call(
        server,
        json!({ "method": "eth_blockNumber" }),
        json!(format!("0x{height:x}")),
    )
}

fn mock_block(server: &mut Server, number: u64, block: Value) -> Mock {
    mock_call(
        server,
        json!({
            "method": "eth_getBlockByNumber",
            "params": [format!("0x{number:x}"), true]
        }),
        block,
    )
}

fn config_for(server: &Server, dir: &Path) -> MigrationConfig {
    MigrationConfig {
        rpc_endpoint: format!("{}{RPC_PATH}", server.url()),
        genesis_path: dir.join("genesis.json"),
        export_path: dir.join("export").join("blockchain-export-rpc.jsonl"),
        ..MigrationConfig::default()
    }
}

fn write_genesis(path: &Path) {
    let genesis = json!({
        "config": { "chainId": 96369 },
        "gasLimit": "0xb71b00",
        "alloc": {
            "9011e888251ab053b7bd1cdb598db4f9ded94714": { "balance": "1000000000000000000000" }
        }
    });
    fs::write(path, genesis.to_string()).unwrap();
}

#[test]
fn export_then_analyze_test() {
    let mut server = Server::new();
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(&server, dir.path());
    write_genesis(&config.genesis_path);

    let _height = mock_height(&mut server, 3);
    let _blocks: Vec<Mock> = (0..=3)
        .map(|number| mock_block(&mut server, number, rpc_block(number)))
        .collect();

    let node = ExecutionNodeHttp::new(&config);
    let outcome = ChainWalker::new(&node)
        .export_to_path(&config.export_path, &ExportOptions::default())
        .unwrap();

    let summary = match outcome {
        ExportOutcome::Exported(summary) => summary,
        ExportOutcome::EmptyChain => panic!("expected blocks to be exported"),
    };
    assert_eq!(summary.written, 4);
    assert!(summary.is_complete());

    let contents = fs::read_to_string(&config.export_path).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 5);

    let metadata: ExportMetadata = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(metadata.height, 3);
    assert_eq!(metadata.version, "1.0.0");

    let records: Vec<Value> = lines[1..]
        .iter()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    let numbers: Vec<u64> = records
        .iter()
        .map(|record| record["number"].as_u64().unwrap())
        .collect();
    assert_eq!(numbers, vec![0, 1, 2, 3]);
    for pair in records.windows(2) {
        assert_eq!(pair[1]["parentHash"], pair[0]["hash"]);
    }
    assert_eq!(records[0]["hash"], json!(hash(1).to_lowercase()));
    assert_eq!(records[3]["timestamp"], json!(1_700_000_006));

    let report = analyze_files(
        &config.genesis_path,
        &config.export_path,
        &config.treasury_address,
    )
    .unwrap();

    assert_eq!(report.discrepancies, vec![]);
    assert!(report.block_count_matches_height);
    assert_eq!(report.declared_height, Some(3));
    assert_eq!(report.unique_block_key_count, 4);
    assert_eq!(report.chain_id, Some(96369));
    assert_eq!(report.treasury_address, TREASURY);
    assert!(report.treasury_balance.is_some());
}

#[test]
fn empty_chain_creates_no_file_test() {
    let mut server = Server::new();
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(&server, dir.path());

    let height = mock_height(&mut server, 0);

    let node = ExecutionNodeHttp::new(&config);
    let outcome = ChainWalker::new(&node)
        .export_to_path(&config.export_path, &ExportOptions::default())
        .unwrap();

    assert_eq!(outcome, ExportOutcome::EmptyChain);
    assert!(!config.export_path.exists());
    height.assert();
}

#[test]
fn missing_block_is_skipped_and_reported_test() {
    let mut server = Server::new();
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(&server, dir.path());
    write_genesis(&config.genesis_path);

    let _height = mock_height(&mut server, 3);
    let _blocks = [
        mock_block(&mut server, 0, rpc_block(0)),
        mock_block(&mut server, 1, rpc_block(1)),
        mock_block(&mut server, 2, Value::Null),
        mock_block(&mut server, 3, rpc_block(3)),
    ];

    let node = ExecutionNodeHttp::new(&config);
    let outcome = ChainWalker::new(&node)
        .export_to_path(&config.export_path, &ExportOptions::default())
        .unwrap();

    let summary = match outcome {
        ExportOutcome::Exported(summary) => summary,
        ExportOutcome::EmptyChain => panic!("expected blocks to be exported"),
    };
    assert_eq!(summary.written, 3);
    assert_eq!(summary.skipped.len(), 1);
    assert_eq!(summary.skipped[0].number, 2);
    assert!(!summary.is_complete());

    let report = analyze_files(
        &config.genesis_path,
        &config.export_path,
        &config.treasury_address,
    )
    .unwrap();

    assert!(!report.block_count_matches_height);
    assert_eq!(
        report.discrepancies,
        vec![
            Discrepancy::BlockGap {
                line: 4,
                expected: 2,
                found: 3,
            },
            Discrepancy::Truncated {
                declared_height: 3,
                expected_blocks: 4,
                unique_blocks: 3,
                requested_range: Some((0, 3)),
            },
        ]
    );
}
