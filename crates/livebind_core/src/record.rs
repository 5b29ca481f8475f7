//! Ordered record sequences.
//!
//! An array-typed binding stores its children as a sequence of [`Record`]s.
//! Order is never derived from keys or values locally; it is maintained only
//! through "insert after previous key" instructions delivered by the remote
//! side, which is authoritative.
//!
//! All operations are copy-on-write: they take the current sequence by
//! reference and return a new one, leaving the input untouched.
//!
//! A `previous_key` of `None` places the record at the head of the
//! sequence. An unknown `previous_key` also places it at the head; the local
//! index may lag the remote one transiently and the next full update
//! repairs it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A keyed element of an ordered sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// The child's key under its parent node.
    pub key: String,
    /// The child's value.
    pub value: Value,
}

impl Record {
    /// Creates a record.
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// Returns the position of `key` in the sequence.
pub fn index_of(seq: &[Record], key: &str) -> Option<usize> {
    seq.iter().position(|record| record.key == key)
}

/// Returns the keys of the sequence in order.
pub fn keys(seq: &[Record]) -> Vec<&str> {
    seq.iter().map(|record| record.key.as_str()).collect()
}

/// Inserts `record` immediately after `previous_key`.
///
/// A record already present under the same key is dropped first so keys
/// stay unique.
pub fn insert_after(seq: &[Record], record: Record, previous_key: Option<&str>) -> Vec<Record> {
    let mut next: Vec<Record> = seq
        .iter()
        .filter(|existing| existing.key != record.key)
        .cloned()
        .collect();
    let position = insertion_index(&next, previous_key);
    next.insert(position, record);
    next
}

/// Replaces the record stored under `key`, keeping its position.
///
/// Stale events for keys that are not present leave the sequence unchanged.
pub fn replace_at(seq: &[Record], key: &str, record: Record) -> Vec<Record> {
    let mut next = seq.to_vec();
    if let Some(index) = index_of(&next, key) {
        next[index] = record;
    }
    next
}

/// Moves the record stored under `key` to just after `previous_key`.
pub fn move_after(seq: &[Record], key: &str, previous_key: Option<&str>) -> Vec<Record> {
    let Some(index) = index_of(seq, key) else {
        return seq.to_vec();
    };
    let mut next = seq.to_vec();
    let record = next.remove(index);
    let position = insertion_index(&next, previous_key);
    next.insert(position, record);
    next
}

/// Removes the record stored under `key`.
pub fn remove_at(seq: &[Record], key: &str) -> Vec<Record> {
    seq.iter()
        .filter(|record| record.key != key)
        .cloned()
        .collect()
}

/// Builds records from an object's children in key order.
///
/// Non-object values have no children.
pub fn from_value(value: &Value) -> Vec<Record> {
    match value {
        Value::Object(map) => map
            .iter()
            .map(|(key, value)| Record::new(key.clone(), value.clone()))
            .collect(),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .filter(|(_, value)| !value.is_null())
            .map(|(index, value)| Record::new(index.to_string(), value.clone()))
            .collect(),
        _ => Vec::new(),
    }
}

fn insertion_index(seq: &[Record], previous_key: Option<&str>) -> usize {
    previous_key
        .and_then(|key| index_of(seq, key))
        .map(|index| index + 1)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn seq(keys: &[&str]) -> Vec<Record> {
        keys.iter().map(|key| Record::new(*key, json!(key))).collect()
    }

    #[test]
    fn insert_at_head_without_previous_key() {
        let next = insert_after(&seq(&["a", "b"]), Record::new("c", json!(1)), None);
        assert_eq!(keys(&next), vec!["c", "a", "b"]);
    }

    #[test]
    fn insert_after_previous_key() {
        let next = insert_after(&seq(&["a", "b"]), Record::new("c", json!(1)), Some("a"));
        assert_eq!(keys(&next), vec!["a", "c", "b"]);

        let next = insert_after(&seq(&["a", "b"]), Record::new("c", json!(1)), Some("b"));
        assert_eq!(keys(&next), vec!["a", "b", "c"]);
    }

    #[test]
    fn insert_after_unknown_key_goes_to_head() {
        let next = insert_after(&seq(&["a"]), Record::new("c", json!(1)), Some("zzz"));
        assert_eq!(keys(&next), vec!["c", "a"]);
    }

    #[test]
    fn insert_existing_key_keeps_keys_unique() {
        let next = insert_after(&seq(&["a", "b", "c"]), Record::new("a", json!(9)), Some("c"));
        assert_eq!(keys(&next), vec!["b", "c", "a"]);
        assert_eq!(next[2].value, json!(9));
    }

    #[test]
    fn insert_does_not_mutate_input() {
        let original = seq(&["a"]);
        let _ = insert_after(&original, Record::new("b", json!(1)), Some("a"));
        assert_eq!(keys(&original), vec!["a"]);
    }

    #[test]
    fn replace_preserves_position() {
        let next = replace_at(&seq(&["a", "b", "c"]), "b", Record::new("b", json!("new")));
        assert_eq!(keys(&next), vec!["a", "b", "c"]);
        assert_eq!(next[1].value, json!("new"));
    }

    #[test]
    fn replace_missing_key_is_noop() {
        let original = seq(&["a"]);
        let next = replace_at(&original, "x", Record::new("x", json!(1)));
        assert_eq!(next, original);
    }

    #[test]
    fn move_after_reorders() {
        let next = move_after(&seq(&["a", "b", "c"]), "a", Some("c"));
        assert_eq!(keys(&next), vec!["b", "c", "a"]);

        let next = move_after(&seq(&["a", "b", "c"]), "c", None);
        assert_eq!(keys(&next), vec!["c", "a", "b"]);
    }

    #[test]
    fn move_missing_key_is_noop() {
        let original = seq(&["a", "b"]);
        assert_eq!(move_after(&original, "x", Some("a")), original);
    }

    #[test]
    fn remove_missing_key_is_noop() {
        let original = seq(&["a", "b"]);
        let next = remove_at(&original, "x");
        assert_eq!(next.len(), 2);
        assert_eq!(next, original);
    }

    #[test]
    fn remove_drops_record() {
        let next = remove_at(&seq(&["a", "b"]), "a");
        assert_eq!(keys(&next), vec!["b"]);
    }

    #[test]
    fn from_value_orders_by_key() {
        let records = from_value(&json!({"1": {"title": "Second"}, "0": {"title": "First"}}));
        assert_eq!(keys(&records), vec!["0", "1"]);
        assert!(from_value(&json!(5)).is_empty());
        assert_eq!(keys(&from_value(&json!(["x", null, "z"]))), vec!["0", "2"]);
    }

    /// A chain of insert instructions: key `k{i}` goes after the key at
    /// `anchor` among the keys already inserted, or at the head.
    fn chain_strategy() -> impl Strategy<Value = Vec<Option<usize>>> {
        prop::collection::vec(prop::option::of(any::<usize>()), 0..40)
    }

    /// Expected order computed directly on a key list.
    fn expected_order(chain: &[Option<usize>]) -> Vec<String> {
        let mut order: Vec<String> = Vec::new();
        for (i, anchor) in chain.iter().enumerate() {
            let key = format!("k{i}");
            match anchor {
                Some(anchor) if i > 0 => {
                    let previous = format!("k{}", anchor % i);
                    let at = order.iter().position(|k| *k == previous).unwrap();
                    order.insert(at + 1, key);
                }
                _ => order.insert(0, key),
            }
        }
        order
    }

    proptest! {
        #[test]
        fn insert_chain_matches_instructions(chain in chain_strategy()) {
            let mut records = Vec::new();
            for (i, anchor) in chain.iter().enumerate() {
                let previous = match anchor {
                    Some(anchor) if i > 0 => Some(format!("k{}", anchor % i)),
                    _ => None,
                };
                records = insert_after(&records, Record::new(format!("k{i}"), json!(i)), previous.as_deref());
            }
            let actual: Vec<String> = records.iter().map(|r| r.key.clone()).collect();
            prop_assert_eq!(actual, expected_order(&chain));
        }

        #[test]
        fn remove_absent_key_keeps_length(n in 0usize..20) {
            let records: Vec<Record> = (0..n).map(|i| Record::new(format!("k{i}"), json!(i))).collect();
            let next = remove_at(&records, "absent");
            prop_assert_eq!(next.len(), records.len());
        }
    }
}
