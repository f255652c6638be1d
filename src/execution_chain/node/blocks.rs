use std::{fmt::Display, str::FromStr};

use num_bigint::{BigUint, ParseBigIntError};
use num_traits::{Num, ToPrimitive, Zero};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use super::decoders::{from_u64_hex_str, lowercase_hex_str, lowercase_hex_strs};

pub type BlockNumber = u64;

/// Block difficulty at arbitrary precision, proof-of-work history can be large.
///
/// Accepts `0x` hex as nodes send it and decimal as the export stores it. Serializes as a JSON
/// integer while it fits a u64 and as a decimal string past that, so it always reads back exactly.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Difficulty(pub BigUint);

impl FromStr for Difficulty {
    type Err = ParseBigIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            // Some nodes answer "0x" for zero.
            Some("") => Ok(Difficulty(BigUint::zero())),
            Some(digits) => BigUint::from_str_radix(digits, 16).map(Difficulty),
            None => BigUint::from_str_radix(s, 10).map(Difficulty),
        }
    }
}

impl From<u64> for Difficulty {
    fn from(difficulty: u64) -> Self {
        Difficulty(BigUint::from(difficulty))
    }
}

impl Display for Difficulty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Difficulty {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0.to_u64() {
            Some(difficulty) => serializer.serialize_u64(difficulty),
            None => serializer.serialize_str(&self.0.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for Difficulty {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawDifficulty {
            Number(u64),
            Text(String),
        }

        match RawDifficulty::deserialize(deserializer)? {
            RawDifficulty::Number(difficulty) => Ok(Difficulty::from(difficulty)),
            RawDifficulty::Text(text) => text.parse().map_err(de::Error::custom),
        }
    }
}

/// Hash for a block on the execution layer, lowercase 0x prefixed hex.
pub type BlockHash = String;

/// A block as returned by `eth_getBlockByNumber` with full transaction bodies.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionNodeBlock {
    #[serde(deserialize_with = "lowercase_hex_str")]
    pub hash: BlockHash,
    #[serde(deserialize_with = "from_u64_hex_str")]
    pub number: BlockNumber,
    #[serde(deserialize_with = "lowercase_hex_str")]
    pub parent_hash: BlockHash,
    #[serde(deserialize_with = "from_u64_hex_str")]
    pub timestamp: u64,
    #[serde(deserialize_with = "from_u64_hex_str")]
    pub gas_used: u64,
    #[serde(deserialize_with = "from_u64_hex_str")]
    pub gas_limit: u64,
    // Post-merge nodes may omit difficulty altogether.
    #[serde(default)]
    pub difficulty: Difficulty,
    #[serde(deserialize_with = "lowercase_hex_str")]
    pub miner: String,
    /// Kept opaque, we only carry them over into the export.
    #[serde(default)]
    pub transactions: Vec<Value>,
    #[serde(default, deserialize_with = "lowercase_hex_strs")]
    pub uncles: Vec<BlockHash>,
}

#[cfg(test)]
pub mod tests {
    use serde_json::json;

    use super::*;

    pub struct ExecutionNodeBlockBuilder {
        hash: String,
        number: BlockNumber,
        parent_hash: String,
        timestamp: u64,
        gas_used: u64,
        transactions: Vec<Value>,
    }

    impl ExecutionNodeBlockBuilder {
        pub fn new(test_id: &str) -> Self {
            let hash = format!("0x{test_id}_block_hash");

            Self {
                timestamp: 1_700_000_000,
                number: 0,
                hash,
                parent_hash: format!("0x{}", "0".repeat(64)),
                gas_used: 0,
                transactions: vec![],
            }
        }

        pub fn from_parent(parent: &ExecutionNodeBlock) -> Self {
            let parent_hash = parent.hash.clone();
            let number = parent.number + 1;
            let hash = format!("{parent_hash}_{number}");
            Self::new("from_parent")
                .with_hash(&hash)
                .with_parent(parent)
        }

        pub fn with_hash(mut self, hash: &str) -> Self {
            self.hash = hash.to_string();
            self
        }

        pub fn with_number(mut self, number: BlockNumber) -> Self {
            self.number = number;
            self
        }

        pub fn with_transactions(mut self, transactions: Vec<Value>) -> Self {
            self.gas_used = 21_000 * transactions.len() as u64;
            self.transactions = transactions;
            self
        }

        pub fn with_parent(mut self, parent: &ExecutionNodeBlock) -> Self {
            self.parent_hash = parent.hash.to_string();
            self.number = parent.number + 1;
            self.timestamp = parent.timestamp + 2;
            self
        }

        pub fn build(&self) -> ExecutionNodeBlock {
            ExecutionNodeBlock {
                difficulty: Difficulty::from(1u64),
                gas_limit: 8_000_000,
                gas_used: self.gas_used,
                hash: self.hash.clone(),
                miner: format!("0x{}", "0".repeat(40)),
                number: self.number,
                parent_hash: self.parent_hash.clone(),
                timestamp: self.timestamp,
                transactions: self.transactions.clone(),
                uncles: vec![],
            }
        }
    }

    #[test]
    fn decode_rpc_block_test() {
        let raw = json!({
            "number": "0x3",
            "hash": "0xABCDEF",
            "parentHash": "0x0123",
            "timestamp": "0x6553f100",
            "gasUsed": "0x5208",
            "gasLimit": "0x7a1200",
            "difficulty": "0x1",
            "miner": "0x9011E888251AB053B7bD1cdB598Db4f9DEd94714",
            "transactions": [{ "hash": "0xaa", "value": "0x1" }],
            "uncles": ["0xDEAD"]
        });

        let block = serde_json::from_value::<ExecutionNodeBlock>(raw).unwrap();

        assert_eq!(block.number, 3);
        assert_eq!(block.hash, "0xabcdef");
        assert_eq!(block.timestamp, 1_700_000_000);
        assert_eq!(block.gas_used, 21_000);
        assert_eq!(block.gas_limit, 8_000_000);
        assert_eq!(block.difficulty, Difficulty::from(1u64));
        assert_eq!(block.miner, "0x9011e888251ab053b7bd1cdb598db4f9ded94714");
        assert_eq!(block.transactions.len(), 1);
        assert_eq!(block.uncles, vec!["0xdead".to_string()]);
    }

    #[test]
    fn decode_rpc_block_without_difficulty_test() {
        let raw = json!({
            "number": "0x0",
            "hash": "0x01",
            "parentHash": "0x00",
            "timestamp": "0x0",
            "gasUsed": "0x0",
            "gasLimit": "0x0",
            "miner": "0x00"
        });

        let block = serde_json::from_value::<ExecutionNodeBlock>(raw).unwrap();
        assert_eq!(block.difficulty, Difficulty::default());
        assert!(block.transactions.is_empty());
        assert!(block.uncles.is_empty());
    }

    #[test]
    fn decode_rpc_block_bad_quantity_test() {
        let raw = json!({
            "number": "three",
            "hash": "0x01",
            "parentHash": "0x00",
            "timestamp": "0x0",
            "gasUsed": "0x0",
            "gasLimit": "0x0",
            "miner": "0x00"
        });

        assert!(serde_json::from_value::<ExecutionNodeBlock>(raw).is_err());
    }

    #[test]
    fn decode_difficulty_beyond_u128_test() {
        let raw = json!({
            "number": "0x1",
            "hash": "0x01",
            "parentHash": "0x00",
            "timestamp": "0x0",
            "gasUsed": "0x0",
            "gasLimit": "0x0",
            "difficulty": format!("0x1{}", "0".repeat(40)),
            "miner": "0x00"
        });

        let block = serde_json::from_value::<ExecutionNodeBlock>(raw).unwrap();

        let expected = BigUint::from(16u32).pow(40);
        assert_eq!(block.difficulty, Difficulty(expected.clone()));
        assert_eq!(
            serde_json::to_value(&block.difficulty).unwrap(),
            json!(expected.to_string())
        );
    }

    #[test]
    fn difficulty_reads_back_test() {
        assert_eq!(serde_json::to_value(Difficulty::from(131_072u64)).unwrap(), json!(131_072));
        assert_eq!(
            serde_json::from_value::<Difficulty>(json!(131_072)).unwrap(),
            Difficulty::from(131_072u64)
        );
        assert_eq!(
            serde_json::from_value::<Difficulty>(json!("340282366920938463463374607431768211456"))
                .unwrap(),
            Difficulty(BigUint::from(u128::MAX) + 1u32)
        );
        assert_eq!("0x".parse::<Difficulty>().unwrap(), Difficulty::default());
        assert!("0xzz".parse::<Difficulty>().is_err());
    }
}
