//! Repairs fixed-width hex addresses in genesis documents. An earlier encoding pass wrote some
//! addresses as 32-byte values; those are cut back to their first 20 bytes. Any other unexpected
//! width is only reported, never guessed at.
use std::{collections::HashMap, fmt::Display};

use serde_json::{Map, Value};

use crate::units::WeiNewtype;

pub const ADDRESS_HEX_LEN: usize = 40;
pub const CORRUPTED_ADDRESS_HEX_LEN: usize = 64;

/// Decides which object keys the normalizer treats specially. Traversal never changes, new field
/// names only need a new matcher.
pub trait FieldMatcher {
    /// A field whose string value is a single address, e.g. `coinbase`.
    fn is_address_field(&self, key: &str) -> bool;
    /// A field holding an object keyed by address, e.g. `alloc`.
    fn is_address_table(&self, key: &str) -> bool;
    /// A field holding a whole JSON document serialized into a string.
    fn is_embedded_document(&self, key: &str) -> bool;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenesisFields {
    address_fields: Vec<String>,
    address_tables: Vec<String>,
    embedded_documents: Vec<String>,
}

impl Default for GenesisFields {
    fn default() -> Self {
        Self {
            address_fields: vec!["coinbase".to_string()],
            address_tables: vec!["alloc".to_string()],
            embedded_documents: vec!["cChainGenesis".to_string()],
        }
    }
}

impl GenesisFields {
    pub fn with_embedded_document(mut self, key: &str) -> Self {
        self.embedded_documents.push(key.to_string());
        self
    }

    pub fn with_address_field(mut self, key: &str) -> Self {
        self.address_fields.push(key.to_string());
        self
    }
}

impl FieldMatcher for GenesisFields {
    fn is_address_field(&self, key: &str) -> bool {
        self.address_fields.iter().any(|field| field == key)
    }

    fn is_address_table(&self, key: &str) -> bool {
        self.address_tables.iter().any(|field| field == key)
    }

    fn is_embedded_document(&self, key: &str) -> bool {
        self.embedded_documents.iter().any(|field| field == key)
    }
}

/// What to do when a repaired allocation key collides with an entry that already uses the
/// correct address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AllocMergePolicy {
    /// Identical entries collapse, differing ones are left in place and reported.
    #[default]
    Flag,
    /// Balances are added onto the correct entry.
    Sum,
    /// The correct entry wins, the repaired one is dropped.
    PreferCanonical,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AddressCheck {
    Canonical,
    /// 64 hex characters, holds the repaired address.
    Truncated(String),
    /// Any other width, holds the number of hex characters found.
    Anomalous(usize),
}

fn split_hex_prefix(value: &str) -> (&str, &str) {
    if value.starts_with("0x") || value.starts_with("0X") {
        value.split_at(2)
    } else {
        ("", value)
    }
}

/// Classifies an address by the width of its hex payload, the `0x` prefix is optional.
pub fn check_address(value: &str) -> AddressCheck {
    let (prefix, digits) = split_hex_prefix(value);

    if !digits.is_ascii() {
        return AddressCheck::Anomalous(digits.chars().count());
    }

    match digits.len() {
        ADDRESS_HEX_LEN => AddressCheck::Canonical,
        CORRUPTED_ADDRESS_HEX_LEN => {
            AddressCheck::Truncated(format!("{prefix}{}", &digits[..ADDRESS_HEX_LEN]))
        }
        length => AddressCheck::Anomalous(length),
    }
}

/// Case and prefix insensitive identity of an address, used to compare allocation keys.
pub fn address_id(value: &str) -> String {
    split_hex_prefix(value).1.to_lowercase()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NormalizationEvent {
    Corrected {
        path: String,
        before: String,
        after: String,
    },
    /// A repaired allocation key matched an identical entry and was folded into it.
    Collapsed {
        path: String,
        corrupted_key: String,
        canonical_key: String,
    },
    /// A repaired allocation key was folded into the existing entry according to the policy.
    Merged {
        path: String,
        corrupted_key: String,
        canonical_key: String,
        policy: AllocMergePolicy,
    },
    UnexpectedLength {
        path: String,
        value: String,
        length: usize,
    },
    NotAString {
        path: String,
    },
    EmbeddedParseFailure {
        path: String,
        error: String,
    },
    /// A repaired allocation key collides with a differing entry, both were left untouched.
    AllocConflict {
        path: String,
        corrupted_key: String,
        canonical_key: String,
    },
}

impl NormalizationEvent {
    pub fn is_correction(&self) -> bool {
        matches!(
            self,
            NormalizationEvent::Corrected { .. }
                | NormalizationEvent::Collapsed { .. }
                | NormalizationEvent::Merged { .. }
        )
    }

    pub fn is_warning(&self) -> bool {
        !self.is_correction()
    }
}

impl Display for NormalizationEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Corrected {
                path,
                before,
                after,
            } => write!(f, "fixed {path}: {before} -> {after}"),
            Self::Collapsed {
                path,
                corrupted_key,
                canonical_key,
            } => write!(
                f,
                "collapsed {path}: {corrupted_key} duplicates {canonical_key}"
            ),
            Self::Merged {
                path,
                corrupted_key,
                canonical_key,
                policy,
            } => write!(
                f,
                "merged {path}: {corrupted_key} into {canonical_key} ({policy:?})"
            ),
            Self::UnexpectedLength {
                path,
                value,
                length,
            } => write!(
                f,
                "unexpected address length {length} at {path}: {value}"
            ),
            Self::NotAString { path } => write!(f, "address at {path} is not a string"),
            Self::EmbeddedParseFailure { path, error } => {
                write!(f, "embedded document at {path} is not valid JSON: {error}")
            }
            Self::AllocConflict {
                path,
                corrupted_key,
                canonical_key,
            } => write!(
                f,
                "conflict at {path}: {corrupted_key} repairs to {canonical_key} which already holds a different entry, resolve by hand"
            ),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Normalized {
    pub value: Value,
    pub events: Vec<NormalizationEvent>,
}

impl Normalized {
    pub fn corrections(&self) -> impl Iterator<Item = &NormalizationEvent> {
        self.events.iter().filter(|event| event.is_correction())
    }

    pub fn warnings(&self) -> impl Iterator<Item = &NormalizationEvent> {
        self.events.iter().filter(|event| event.is_warning())
    }
}

#[derive(Clone, Debug, Default)]
pub struct Normalizer<M = GenesisFields> {
    matcher: M,
    merge_policy: AllocMergePolicy,
}

impl Normalizer<GenesisFields> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<M: FieldMatcher> Normalizer<M> {
    pub fn with_matcher(matcher: M) -> Self {
        Self {
            matcher,
            merge_policy: AllocMergePolicy::default(),
        }
    }

    pub fn with_merge_policy(mut self, merge_policy: AllocMergePolicy) -> Self {
        self.merge_policy = merge_policy;
        self
    }

    /// Returns a normalized copy, the input is left as is.
    pub fn normalize(&self, value: &Value) -> Normalized {
        let mut value = value.clone();
        let events = self.normalize_in_place(&mut value);
        Normalized { value, events }
    }

    pub fn normalize_in_place(&self, value: &mut Value) -> Vec<NormalizationEvent> {
        let mut events = vec![];
        self.visit(value, "", &mut events);
        events
    }

    fn visit(&self, value: &mut Value, path: &str, events: &mut Vec<NormalizationEvent>) {
        match value {
            Value::Object(map) => {
                for (key, child) in map.iter_mut() {
                    let child_path = format!("{path}/{key}");

                    if self.matcher.is_address_field(key) {
                        self.normalize_address_field(child, &child_path, events);
                    }

                    if self.matcher.is_embedded_document(key) {
                        if let Value::String(_) = child {
                            self.normalize_embedded(child, &child_path, events);
                        }
                    }

                    if self.matcher.is_address_table(key) {
                        if let Value::Object(table) = child {
                            self.normalize_address_table(table, &child_path, events);
                        }
                    }

                    if child.is_object() || child.is_array() {
                        self.visit(child, &child_path, events);
                    }
                }
            }
            Value::Array(items) => {
                for (index, item) in items.iter_mut().enumerate() {
                    self.visit(item, &format!("{path}/{index}"), events);
                }
            }
            _ => {}
        }
    }

    fn normalize_address_field(
        &self,
        value: &mut Value,
        path: &str,
        events: &mut Vec<NormalizationEvent>,
    ) {
        let address = match value {
            Value::String(address) => address,
            _ => {
                events.push(NormalizationEvent::NotAString {
                    path: path.to_string(),
                });
                return;
            }
        };

        match check_address(address) {
            AddressCheck::Canonical => {}
            AddressCheck::Truncated(repaired) => {
                events.push(NormalizationEvent::Corrected {
                    path: path.to_string(),
                    before: address.clone(),
                    after: repaired.clone(),
                });
                *address = repaired;
            }
            AddressCheck::Anomalous(length) => {
                events.push(NormalizationEvent::UnexpectedLength {
                    path: path.to_string(),
                    value: address.clone(),
                    length,
                });
            }
        }
    }

    /// Parses the string, normalizes it and writes it back compact, so a second run produces
    /// the exact same bytes.
    fn normalize_embedded(&self, value: &mut Value, path: &str, events: &mut Vec<NormalizationEvent>) {
        let text = match value {
            Value::String(text) => text,
            _ => return,
        };

        let mut embedded = match serde_json::from_str::<Value>(text) {
            Ok(embedded) => embedded,
            Err(error) => {
                events.push(NormalizationEvent::EmbeddedParseFailure {
                    path: path.to_string(),
                    error: error.to_string(),
                });
                return;
            }
        };

        self.visit(&mut embedded, path, events);

        match serde_json::to_string(&embedded) {
            Ok(serialized) => *text = serialized,
            Err(error) => events.push(NormalizationEvent::EmbeddedParseFailure {
                path: path.to_string(),
                error: error.to_string(),
            }),
        }
    }

    fn normalize_address_table(
        &self,
        table: &mut Map<String, Value>,
        path: &str,
        events: &mut Vec<NormalizationEvent>,
    ) {
        let mut entries: Vec<(String, Value)> = std::mem::take(table).into_iter().collect();

        // Address id to the index of the entry already using the correct width.
        let mut owners: HashMap<String, usize> = HashMap::new();
        for (index, (key, _)) in entries.iter().enumerate() {
            if check_address(key) == AddressCheck::Canonical {
                owners.entry(address_id(key)).or_insert(index);
            }
        }

        let mut dropped = vec![false; entries.len()];

        for index in 0..entries.len() {
            let key = entries[index].0.clone();
            let entry_path = format!("{path}/{key}");

            let repaired = match check_address(&key) {
                AddressCheck::Canonical => continue,
                AddressCheck::Anomalous(length) => {
                    events.push(NormalizationEvent::UnexpectedLength {
                        path: entry_path,
                        value: key,
                        length,
                    });
                    continue;
                }
                AddressCheck::Truncated(repaired) => repaired,
            };

            let id = address_id(&repaired);
            let owner = match owners.get(&id).copied() {
                None => {
                    events.push(NormalizationEvent::Corrected {
                        path: entry_path,
                        before: key,
                        after: repaired.clone(),
                    });
                    entries[index].0 = repaired;
                    owners.insert(id, index);
                    continue;
                }
                Some(owner) => owner,
            };

            let canonical_key = entries[owner].0.clone();
            let conflict = NormalizationEvent::AllocConflict {
                path: entry_path.clone(),
                corrupted_key: key.clone(),
                canonical_key: canonical_key.clone(),
            };

            match self.merge_policy {
                AllocMergePolicy::Flag => {
                    if entries[index].1 == entries[owner].1 {
                        dropped[index] = true;
                        events.push(NormalizationEvent::Collapsed {
                            path: entry_path,
                            corrupted_key: key,
                            canonical_key,
                        });
                    } else {
                        events.push(conflict);
                    }
                }
                AllocMergePolicy::PreferCanonical => {
                    dropped[index] = true;
                    events.push(NormalizationEvent::Merged {
                        path: entry_path,
                        corrupted_key: key,
                        canonical_key,
                        policy: self.merge_policy,
                    });
                }
                AllocMergePolicy::Sum => {
                    match sum_balances(&entries[owner].1, &entries[index].1) {
                        Some(total) => {
                            entries[owner].1["balance"] = Value::String(total.to_string());
                            dropped[index] = true;
                            events.push(NormalizationEvent::Merged {
                                path: entry_path,
                                corrupted_key: key,
                                canonical_key,
                                policy: self.merge_policy,
                            });
                        }
                        None => events.push(conflict),
                    }
                }
            }
        }

        *table = entries
            .into_iter()
            .zip(dropped)
            .filter(|(_, dropped)| !dropped)
            .map(|(entry, _)| entry)
            .collect();
    }
}

fn balance_of(entry: &Value) -> Option<WeiNewtype> {
    entry.get("balance")?.as_str()?.parse().ok()
}

/// Only plain balance entries can be summed, anything carrying code or storage is left to a human.
fn sum_balances(canonical: &Value, corrupted: &Value) -> Option<WeiNewtype> {
    let corrupted_fields = corrupted.as_object()?;
    if corrupted_fields.keys().any(|key| key != "balance") || !canonical.is_object() {
        return None;
    }
    Some(balance_of(canonical)? + balance_of(corrupted)?)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const TREASURY: &str = "0x9011e888251ab053b7bd1cdb598db4f9ded94714";

    fn padded(address: &str) -> String {
        format!("{address}{}", "0".repeat(24))
    }

    #[test]
    fn check_address_test() {
        assert_eq!(check_address(TREASURY), AddressCheck::Canonical);
        assert_eq!(
            check_address(&padded(TREASURY)),
            AddressCheck::Truncated(TREASURY.to_string())
        );
        assert_eq!(check_address("0x1234"), AddressCheck::Anomalous(4));
        assert_eq!(
            check_address("9011e888251ab053b7bd1cdb598db4f9ded94714"),
            AddressCheck::Canonical
        );
    }

    #[test]
    fn check_address_non_ascii_test() {
        let weird = format!("0x{}é", "a".repeat(39));
        assert_eq!(check_address(&weird), AddressCheck::Anomalous(40));
    }

    #[test]
    fn truncates_64_char_coinbase_test() {
        let doc = json!({ "coinbase": padded(TREASURY) });

        let normalized = Normalizer::new().normalize(&doc);

        assert_eq!(normalized.value, json!({ "coinbase": TREASURY }));
        assert_eq!(normalized.events.len(), 1);
        assert_eq!(
            normalized.events[0],
            NormalizationEvent::Corrected {
                path: "/coinbase".to_string(),
                before: padded(TREASURY),
                after: TREASURY.to_string(),
            }
        );
    }

    #[test]
    fn leaves_40_char_coinbase_test() {
        let doc = json!({ "coinbase": TREASURY });

        let normalized = Normalizer::new().normalize(&doc);

        assert_eq!(normalized.value, doc);
        assert!(normalized.events.is_empty());
    }

    #[test]
    fn reports_other_lengths_once_test() {
        for length in [0, 1, 39, 41, 60, 63, 65, 128] {
            let value = format!("0x{}", "a".repeat(length));
            let doc = json!({ "coinbase": value });

            let normalized = Normalizer::new().normalize(&doc);

            assert_eq!(normalized.value, doc, "length {length} must be left as is");
            assert_eq!(normalized.events.len(), 1);
            assert!(matches!(
                normalized.events[0],
                NormalizationEvent::UnexpectedLength { length: found, .. } if found == length
            ));
        }
    }

    #[test]
    fn non_string_coinbase_is_a_warning_test() {
        let doc = json!({ "coinbase": 12 });
        let normalized = Normalizer::new().normalize(&doc);
        assert_eq!(normalized.value, doc);
        assert_eq!(normalized.warnings().count(), 1);
    }

    #[test]
    fn recurses_into_nested_objects_and_arrays_test() {
        let doc = json!({
            "networks": [
                { "name": "a", "genesis": { "coinbase": padded(TREASURY) } },
                { "name": "b", "coinbase": TREASURY }
            ]
        });

        let normalized = Normalizer::new().normalize(&doc);

        assert_eq!(
            normalized.value["networks"][0]["genesis"]["coinbase"],
            json!(TREASURY)
        );
        assert_eq!(normalized.corrections().count(), 1);
        assert!(matches!(
            &normalized.events[0],
            NormalizationEvent::Corrected { path, .. } if path == "/networks/0/genesis/coinbase"
        ));
    }

    #[test]
    fn normalizes_embedded_document_test() {
        let embedded = json!({
            "config": { "chainId": 96369 },
            "coinbase": padded("0x0000000000000000000000000000000000000000")
        });
        let doc = json!({
            "networkID": 96369,
            "cChainGenesis": serde_json::to_string_pretty(&embedded).unwrap()
        });

        let normalized = Normalizer::new().normalize(&doc);

        let text = normalized.value["cChainGenesis"].as_str().unwrap();
        assert_eq!(
            text,
            r#"{"config":{"chainId":96369},"coinbase":"0x0000000000000000000000000000000000000000"}"#
        );
        assert_eq!(normalized.corrections().count(), 1);
    }

    #[test]
    fn malformed_embedded_document_is_left_alone_test() {
        let doc = json!({
            "cChainGenesis": "{not json",
            "coinbase": padded(TREASURY)
        });

        let normalized = Normalizer::new().normalize(&doc);

        assert_eq!(normalized.value["cChainGenesis"], json!("{not json"));
        assert_eq!(normalized.value["coinbase"], json!(TREASURY));
        assert!(normalized
            .events
            .iter()
            .any(|event| matches!(event, NormalizationEvent::EmbeddedParseFailure { .. })));
    }

    #[test]
    fn custom_matcher_test() {
        let doc = json!({ "feeRecipient": padded(TREASURY), "coinbase": padded(TREASURY) });
        let normalizer = Normalizer::with_matcher(
            GenesisFields::default().with_address_field("feeRecipient"),
        );

        let normalized = normalizer.normalize(&doc);

        assert_eq!(normalized.value["feeRecipient"], json!(TREASURY));
        assert_eq!(normalized.value["coinbase"], json!(TREASURY));
    }

    #[test]
    fn renames_corrupted_alloc_key_test() {
        let doc = json!({
            "alloc": {
                padded(TREASURY): { "balance": "1000000000000000000000" }
            }
        });

        let normalized = Normalizer::new().normalize(&doc);

        assert_eq!(
            normalized.value,
            json!({ "alloc": { TREASURY: { "balance": "1000000000000000000000" } } })
        );
    }

    #[test]
    fn collapses_identical_duplicate_alloc_key_test() {
        let doc = json!({
            "alloc": {
                TREASURY: { "balance": "1000000000000000000000" },
                padded(TREASURY): { "balance": "1000000000000000000000" }
            }
        });

        let normalized = Normalizer::new().normalize(&doc);

        assert_eq!(
            normalized.value,
            json!({ "alloc": { TREASURY: { "balance": "1000000000000000000000" } } })
        );
        assert!(matches!(
            normalized.events[0],
            NormalizationEvent::Collapsed { .. }
        ));
    }

    #[test]
    fn flags_differing_duplicate_alloc_key_test() {
        let doc = json!({
            "alloc": {
                TREASURY: { "balance": "1000000000000000000000" },
                padded(TREASURY): { "balance": "5" }
            }
        });

        let normalized = Normalizer::new().normalize(&doc);

        assert_eq!(normalized.value, doc);
        assert_eq!(
            normalized.events,
            vec![NormalizationEvent::AllocConflict {
                path: format!("/alloc/{}", padded(TREASURY)),
                corrupted_key: padded(TREASURY),
                canonical_key: TREASURY.to_string(),
            }]
        );
    }

    #[test]
    fn sums_duplicate_alloc_key_test() {
        let doc = json!({
            "alloc": {
                padded(TREASURY): { "balance": "5" },
                TREASURY: { "balance": "1000000000000000000000" }
            }
        });

        let normalized = Normalizer::new()
            .with_merge_policy(AllocMergePolicy::Sum)
            .normalize(&doc);

        assert_eq!(
            normalized.value,
            json!({ "alloc": { TREASURY: { "balance": "1000000000000000000005" } } })
        );
    }

    #[test]
    fn sum_refuses_entries_with_code_test() {
        let doc = json!({
            "alloc": {
                TREASURY: { "balance": "1" },
                padded(TREASURY): { "balance": "5", "code": "0x60" }
            }
        });

        let normalized = Normalizer::new()
            .with_merge_policy(AllocMergePolicy::Sum)
            .normalize(&doc);

        assert_eq!(normalized.value, doc);
        assert!(matches!(
            normalized.events[0],
            NormalizationEvent::AllocConflict { .. }
        ));
    }

    #[test]
    fn prefer_canonical_drops_corrupted_entry_test() {
        let doc = json!({
            "alloc": {
                TREASURY: { "balance": "1" },
                padded(TREASURY): { "balance": "5" }
            }
        });

        let normalized = Normalizer::new()
            .with_merge_policy(AllocMergePolicy::PreferCanonical)
            .normalize(&doc);

        assert_eq!(
            normalized.value,
            json!({ "alloc": { TREASURY: { "balance": "1" } } })
        );
    }

    #[test]
    fn left_padded_60_char_alloc_key_is_reported_not_guessed_test() {
        let corrupted = "0x000000000000000000009011e888251ab053b7bd1cdb598db4f9ded94714";
        let doc = json!({
            "alloc": {
                TREASURY: { "balance": "1000000000000000000000" },
                corrupted: { "balance": "1000000000000000000000" }
            }
        });

        let normalized = Normalizer::new().normalize(&doc);

        assert_eq!(normalized.value, doc);
        assert_eq!(
            normalized.events,
            vec![NormalizationEvent::UnexpectedLength {
                path: format!("/alloc/{corrupted}"),
                value: corrupted.to_string(),
                length: 60,
            }]
        );
    }

    #[test]
    fn two_corrupted_keys_for_one_address_test() {
        let first = padded(TREASURY);
        let second = format!("{TREASURY}{}", "f".repeat(24));
        let doc = json!({
            "alloc": {
                first.clone(): { "balance": "7" },
                second.clone(): { "balance": "7" }
            }
        });

        let normalized = Normalizer::new().normalize(&doc);

        assert_eq!(
            normalized.value,
            json!({ "alloc": { TREASURY: { "balance": "7" } } })
        );
    }

    #[test]
    fn normalize_is_idempotent_test() {
        let embedded = json!({
            "coinbase": padded(TREASURY),
            "alloc": {
                TREASURY: { "balance": "1" },
                padded(TREASURY): { "balance": "2" },
                padded("0x0100000000000000000000000000000000000000"): { "balance": "3" },
                "0x1234": { "balance": "4" }
            },
            "gasLimit": "0x7A1200"
        });
        let documents = vec![
            json!({}),
            json!([1, "two", null, { "coinbase": TREASURY }]),
            json!({ "coinbase": padded(TREASURY) }),
            json!({ "coinbase": "0xabc" }),
            json!({ "coinbase": null }),
            json!({ "cChainGenesis": "{broken" }),
            json!({ "cChainGenesis": serde_json::to_string_pretty(&embedded).unwrap() }),
            json!({
                "config": { "chainId": 96369 },
                "cChainGenesis": embedded.to_string(),
                "nested": [{ "cChainGenesis": embedded.to_string() }],
                "alloc": embedded["alloc"].clone()
            }),
        ];

        for policy in [
            AllocMergePolicy::Flag,
            AllocMergePolicy::Sum,
            AllocMergePolicy::PreferCanonical,
        ] {
            let normalizer = Normalizer::new().with_merge_policy(policy);
            for document in &documents {
                let once = normalizer.normalize(document);
                let twice = normalizer.normalize(&once.value);
                assert_eq!(twice.value, once.value, "{policy:?} {document}");
                assert_eq!(
                    serde_json::to_string(&twice.value).unwrap(),
                    serde_json::to_string(&once.value).unwrap()
                );
                assert_eq!(twice.corrections().count(), 0, "{policy:?} {document}");
            }
        }
    }
}
