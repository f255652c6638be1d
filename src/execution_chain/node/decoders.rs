use serde::{de, Deserialize, Deserializer};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuantityError {
    #[error("expected a 0x prefixed hex quantity, got {0:?}")]
    MissingPrefix(String),
    #[error("invalid hex quantity {0:?}")]
    Invalid(String),
}

fn strip_hex_prefix(quantity: &str) -> Result<&str, QuantityError> {
    quantity
        .strip_prefix("0x")
        .or_else(|| quantity.strip_prefix("0X"))
        .ok_or_else(|| QuantityError::MissingPrefix(quantity.to_string()))
}

pub fn decode_u64_quantity(quantity: &str) -> Result<u64, QuantityError> {
    let digits = strip_hex_prefix(quantity)?;
    // Some nodes answer "0x" for zero.
    if digits.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(digits, 16).map_err(|_| QuantityError::Invalid(quantity.to_string()))
}

pub fn encode_quantity(number: u64) -> String {
    format!("0x{number:x}")
}

pub fn from_u64_hex_str<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    decode_u64_quantity(&s).map_err(de::Error::custom)
}

/// Hashes and addresses are compared as strings downstream, so casing is normalized on the way in.
pub fn lowercase_hex_str<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    Ok(s.to_lowercase())
}

pub fn lowercase_hex_strs<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let strs: Option<Vec<String>> = Deserialize::deserialize(deserializer)?;
    Ok(strs
        .unwrap_or_default()
        .into_iter()
        .map(|s| s.to_lowercase())
        .collect())
}
