//! Talks JSON-RPC over HTTP to the execution node of the migrated chain. Every call is a single
//! blocking request with its own deadline, nothing is retried here, callers decide what a failure
//! means for them.
mod blocks;
mod decoders;

use std::time::Duration;

use mockall::automock;
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, trace};

pub use blocks::BlockHash;
pub use blocks::BlockNumber;
pub use blocks::Difficulty;
pub use blocks::ExecutionNodeBlock;

pub use decoders::decode_u64_quantity;
pub use decoders::encode_quantity;

#[cfg(test)]
pub use blocks::tests::ExecutionNodeBlockBuilder;

use crate::{config::MigrationConfig, units::WeiNewtype};

/// JSON-RPC 2.0 code for a method the node does not know.
pub const METHOD_NOT_FOUND_CODE: i64 = -32601;

#[derive(Debug, Deserialize)]
struct RpcErrorCode {
    code: i64,
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("failed to reach execution node at {url}: {source}")]
    Connection {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("execution node answered {method} with an error: {payload}")]
    Protocol { method: String, payload: Value },
    #[error("{method} did not get a response within {timeout:?}")]
    Timeout { method: String, timeout: Duration },
    #[error("failed to decode {method} response: {message}")]
    Decode { method: String, message: String },
}

impl RpcError {
    /// The JSON-RPC error code, when the node sent a well formed error object.
    pub fn code(&self) -> Option<i64> {
        match self {
            RpcError::Protocol { payload, .. } => {
                serde_json::from_value::<RpcErrorCode>(payload.clone())
                    .ok()
                    .map(|error| error.code)
            }
            _ => None,
        }
    }

    pub fn is_method_not_found(&self) -> bool {
        self.code() == Some(METHOD_NOT_FOUND_CODE)
    }
}

/// How expensive a call is for the node, decides which deadline applies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallWeight {
    Light,
    Heavy,
}

#[automock]
pub trait ExecutionNode {
    fn call(&self, method: &str, params: Vec<Value>, weight: CallWeight)
        -> Result<Value, RpcError>;
    fn get_block_number(&self) -> Result<BlockNumber, RpcError>;
    /// `Ok(None)` when the node has no block at this number, past the head or a gap.
    fn get_block_by_number(
        &self,
        number: BlockNumber,
        include_transactions: bool,
    ) -> Result<Option<ExecutionNodeBlock>, RpcError>;
    fn get_balance(&self, address: &str) -> Result<WeiNewtype, RpcError>;
}

pub struct ExecutionNodeHttp {
    client: Client,
    url: String,
    light_timeout: Duration,
    heavy_timeout: Duration,
}

impl ExecutionNodeHttp {
    pub fn new(config: &MigrationConfig) -> Self {
        Self {
            client: Client::new(),
            url: config.rpc_endpoint.clone(),
            light_timeout: config.light_call_timeout,
            heavy_timeout: config.heavy_call_timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn timeout_for(&self, weight: CallWeight) -> Duration {
        match weight {
            CallWeight::Light => self.light_timeout,
            CallWeight::Heavy => self.heavy_timeout,
        }
    }

    fn transport_error(&self, method: &str, timeout: Duration, error: reqwest::Error) -> RpcError {
        if error.is_timeout() {
            RpcError::Timeout {
                method: method.to_string(),
                timeout,
            }
        } else {
            RpcError::Connection {
                url: self.url.clone(),
                source: error,
            }
        }
    }
}

/// Pulls `result` out of a JSON-RPC response envelope. A `null` result is a valid answer, a
/// missing one is not.
fn unwrap_response(method: &str, envelope: Value) -> Result<Value, RpcError> {
    let mut envelope = match envelope {
        Value::Object(map) => map,
        other => {
            return Err(RpcError::Protocol {
                method: method.to_string(),
                payload: other,
            })
        }
    };

    match envelope.get("error") {
        Some(error) if !error.is_null() => {
            return Err(RpcError::Protocol {
                method: method.to_string(),
                payload: error.clone(),
            })
        }
        _ => {}
    }

    match envelope.remove("result") {
        Some(result) => Ok(result),
        None => Err(RpcError::Protocol {
            method: method.to_string(),
            payload: Value::Object(envelope),
        }),
    }
}

fn expect_quantity<'a>(method: &str, value: &'a Value) -> Result<&'a str, RpcError> {
    value.as_str().ok_or_else(|| RpcError::Decode {
        method: method.to_string(),
        message: format!("expected a hex quantity string, got {value}"),
    })
}

impl ExecutionNode for ExecutionNodeHttp {
    fn call(
        &self,
        method: &str,
        params: Vec<Value>,
        weight: CallWeight,
    ) -> Result<Value, RpcError> {
        let timeout = self.timeout_for(weight);

        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params
        });

        trace!(method, %body, "sending rpc request");

        let res = self
            .client
            .post(&self.url)
            .timeout(timeout)
            .json(&body)
            .send()
            .map_err(|error| self.transport_error(method, timeout, error))?;

        let status = res.status();
        let text = res
            .text()
            .map_err(|error| self.transport_error(method, timeout, error))?;

        let envelope = match serde_json::from_str::<Value>(&text) {
            Ok(envelope) => envelope,
            Err(_) if !status.is_success() => {
                return Err(RpcError::Protocol {
                    method: method.to_string(),
                    payload: json!({ "httpStatus": status.as_u16(), "body": text }),
                })
            }
            Err(error) => {
                return Err(RpcError::Decode {
                    method: method.to_string(),
                    message: error.to_string(),
                })
            }
        };

        unwrap_response(method, envelope)
    }

    fn get_block_number(&self) -> Result<BlockNumber, RpcError> {
        let method = "eth_blockNumber";
        let value = self.call(method, vec![], CallWeight::Light)?;
        let quantity = expect_quantity(method, &value)?;
        decode_u64_quantity(quantity).map_err(|error| RpcError::Decode {
            method: method.to_string(),
            message: error.to_string(),
        })
    }

    fn get_block_by_number(
        &self,
        number: BlockNumber,
        include_transactions: bool,
    ) -> Result<Option<ExecutionNodeBlock>, RpcError> {
        let method = "eth_getBlockByNumber";
        let value = self.call(
            method,
            vec![json!(encode_quantity(number)), json!(include_transactions)],
            CallWeight::Heavy,
        )?;

        if value.is_null() {
            debug!(block_number = number, "node has no block at this number");
            return Ok(None);
        }

        serde_json::from_value::<ExecutionNodeBlock>(value)
            .map(Some)
            .map_err(|error| RpcError::Decode {
                method: method.to_string(),
                message: format!("block {number}: {error}"),
            })
    }

    fn get_balance(&self, address: &str) -> Result<WeiNewtype, RpcError> {
        let method = "eth_getBalance";
        let value = self.call(
            method,
            vec![json!(address), json!("latest")],
            CallWeight::Light,
        )?;
        let quantity = expect_quantity(method, &value)?;
        WeiNewtype::from_hex_quantity(quantity).map_err(|error| RpcError::Decode {
            method: method.to_string(),
            message: format!("{quantity}: {error}"),
        })
    }
}
