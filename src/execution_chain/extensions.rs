//! Chain specific RPC methods that only some node builds ship. Their absence is something to
//! report, never a reason to fail.
use serde_json::Value;
use tracing::{debug, warn};

use super::{node::CallWeight, ExecutionNode, RpcError};

pub const REPLAY_STATUS_METHOD: &str = "lux_replayStatus";
pub const VERIFY_BLOCKCHAIN_METHOD: &str = "lux_verifyBlockchain";

#[derive(Debug)]
pub enum ExtensionStatus {
    Available(Value),
    Unavailable,
    Failed(RpcError),
}

#[derive(Debug)]
pub struct ExtensionProbe {
    pub method: &'static str,
    pub status: ExtensionStatus,
}

fn probe<N: ExecutionNode>(node: &N, method: &'static str) -> ExtensionProbe {
    let status = match node.call(method, vec![], CallWeight::Heavy) {
        Ok(Value::Null) => ExtensionStatus::Unavailable,
        Ok(result) => ExtensionStatus::Available(result),
        Err(error) if error.is_method_not_found() => {
            debug!(method, "extension method not available");
            ExtensionStatus::Unavailable
        }
        Err(error) => {
            warn!(method, %error, "extension method failed");
            ExtensionStatus::Failed(error)
        }
    };

    ExtensionProbe { method, status }
}

pub fn probe_extensions<N: ExecutionNode>(node: &N) -> Vec<ExtensionProbe> {
    [REPLAY_STATUS_METHOD, VERIFY_BLOCKCHAIN_METHOD]
        .into_iter()
        .map(|method| probe(node, method))
        .collect()
}
