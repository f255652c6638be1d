use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Reads a quantity the way genesis files write them: a JSON number, a decimal string or a `0x`
/// prefixed hex string.
pub fn u64_from_quantity_value(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => {
            let text = text.trim();
            match text
                .strip_prefix("0x")
                .or_else(|| text.strip_prefix("0X"))
            {
                Some(digits) => u64::from_str_radix(digits, 16).ok(),
                None => text.parse::<u64>().ok(),
            }
        }
        _ => None,
    }
}

/// Lenient variant for fields we only report on. Anything unreadable decodes as `None` and is
/// flagged by the caller instead of failing the whole document.
pub fn from_lenient_u64_quantity<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<Value> = Deserialize::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(u64_from_quantity_value))
}
