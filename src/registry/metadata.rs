//! Closed-world metadata AST (`HandlerMetadata`) and the filename
//! presence map (`Files`), plus the single case-folding normalization
//! function the registry boundary funnels every filename lookup through
//! (design note §9: "a single normalization function at the registry
//! boundary").

use std::collections::BTreeMap;

use crate::bencode::Value;

/// A scalar or nested value inside provider metadata. A closed set of
/// kinds, never an open-world "any" — so the canonical bencoder can
/// traverse it without special-casing unknown shapes.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MetadataValue {
    Str(String),
    Int(i64),
    Bool(bool),
    Bytes(Vec<u8>),
    Nested(OrderedMap),
}

/// Ordered string-keyed map, insertion order preserved (unlike the
/// byte-ordered dictionaries bencoding itself sorts) because provider
/// records read most naturally in the order a provider actually emitted
/// them; canonicalization still goes through `to_bencode_value`, which does
/// sort.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct OrderedMap(pub Vec<(String, MetadataValue)>);

impl OrderedMap {
    pub fn new() -> Self {
        OrderedMap(Vec::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: MetadataValue) {
        let key = key.into();
        if let Some(slot) = self.0.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.0.push((key, value));
        }
    }

    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Canonical bencode view, used to derive `MetadataHash` = SHA-256 of
    /// this form. Keys sort byte-lexicographically regardless of the
    /// insertion order recorded above.
    pub fn to_bencode_value(&self) -> Value {
        let mut builder = Value::dict();
        for (k, v) in &self.0 {
            builder = builder.insert(k, metadata_value_to_bencode(v));
        }
        builder.build()
    }
}

fn metadata_value_to_bencode(v: &MetadataValue) -> Value {
    match v {
        MetadataValue::Str(s) => Value::str(s.clone()),
        MetadataValue::Int(i) => Value::Int(*i),
        MetadataValue::Bool(b) => Value::Int(if *b { 1 } else { 0 }),
        MetadataValue::Bytes(b) => Value::Bytes(b.clone()),
        MetadataValue::Nested(m) => m.to_bencode_value(),
    }
}

/// Tri-state presence of a file belonging to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FilePresence {
    Present,
    Absent,
    Unknown,
}

/// Case-insensitive-safe filename key. Lookups always go through
/// `normalize_filename` first.
pub type Files = BTreeMap<String, FilePresence>;

/// The one normalization function every filename comparison in the
/// registry must go through: lowercase on platforms whose filesystem is
/// case-insensitive by default (Windows, classic macOS HFS+), as-entered
/// elsewhere.
pub fn normalize_filename(name: &str) -> String {
    if cfg!(windows) {
        name.to_lowercase()
    } else {
        name.to_string()
    }
}

pub fn merge_files(a: &Files, b: &Files) -> Files {
    let mut merged = a.clone();
    for (k, v) in b {
        merged
            .entry(k.clone())
            .and_modify(|existing| {
                // Present/Absent observations outrank Unknown; a direct
                // conflict (Present vs Absent) keeps the existing entry —
                // the registry never silently overwrites a confirmed
                // observation with another provider's confirmed-opposite one.
                if *existing == FilePresence::Unknown {
                    *existing = *v;
                }
            })
            .or_insert(*v);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_map_bencode_view_sorts_keys() {
        let mut m = OrderedMap::new();
        m.insert("zebra", MetadataValue::Int(1));
        m.insert("apple", MetadataValue::Str("x".into()));
        let encoded = m.to_bencode_value().encode();
        assert_eq!(encoded, b"d5:apple1:x5:zebrai1ee");
    }

    #[test]
    fn merge_files_prefers_confirmed_over_unknown() {
        let mut a = Files::new();
        a.insert("readme.txt".into(), FilePresence::Unknown);
        let mut b = Files::new();
        b.insert("readme.txt".into(), FilePresence::Present);

        let merged = merge_files(&a, &b);
        assert_eq!(merged["readme.txt"], FilePresence::Present);
    }

    #[test]
    fn merge_files_keeps_existing_on_direct_conflict() {
        let mut a = Files::new();
        a.insert("x.bin".into(), FilePresence::Present);
        let mut b = Files::new();
        b.insert("x.bin".into(), FilePresence::Absent);

        let merged = merge_files(&a, &b);
        assert_eq!(merged["x.bin"], FilePresence::Present);
    }
}
