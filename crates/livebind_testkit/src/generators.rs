//! Property-based test generators using proptest.
//!
//! Provides strategies for generating ordering hints, remote mutations and
//! queries that the sync engine must handle.

use livebind_core::{QueryBuilder, QueryState};
use proptest::prelude::*;

/// An arrival order of keys together with the order they must end up in.
#[derive(Debug, Clone)]
pub struct InsertChain {
    /// Final order of the keys.
    pub expected: Vec<String>,
    /// `(key, previous_key)` instructions in arrival order.
    pub steps: Vec<(String, Option<String>)>,
}

impl InsertChain {
    /// Builds the instructions a remote would send when the keys of
    /// `expected` arrive in `arrival` order: each key names the closest key
    /// before it in the final order that has already arrived.
    pub fn new(expected: Vec<String>, arrival: Vec<String>) -> Self {
        let mut arrived: Vec<&str> = Vec::new();
        let mut steps = Vec::with_capacity(arrival.len());
        for key in &arrival {
            let position = expected.iter().position(|k| k == key).unwrap_or(0);
            let previous = expected[..position]
                .iter()
                .rev()
                .find(|k| arrived.contains(&k.as_str()))
                .cloned();
            steps.push((key.clone(), previous));
            arrived.push(key);
        }
        Self { expected, steps }
    }
}

/// Strategy for generating valid record keys.
pub fn record_key_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9]{0,7}").expect("Invalid regex")
}

/// Strategy for generating insert chains of up to `max_len` distinct keys.
pub fn insert_chain_strategy(max_len: usize) -> impl Strategy<Value = InsertChain> {
    prop::collection::btree_set(record_key_strategy(), 0..max_len)
        .prop_flat_map(|keys| {
            let keys: Vec<String> = keys.into_iter().collect();
            (
                Just(keys.clone()).prop_shuffle(),
                Just(keys).prop_shuffle(),
            )
        })
        .prop_map(|(expected, arrival)| InsertChain::new(expected, arrival))
}

/// A mutation of one child of a remote collection.
#[derive(Debug, Clone)]
pub enum ChildOp {
    /// Set a child's value
    Set {
        /// Child key
        key: String,
        /// New value
        value: i64,
    },
    /// Remove a child
    Remove {
        /// Child key
        key: String,
    },
}

/// Strategy for keys drawn from a small pool so operations collide.
pub fn child_key_strategy() -> impl Strategy<Value = String> {
    (0u8..8).prop_map(|n| format!("c{n}"))
}

/// Strategy for generating child mutations.
pub fn child_op_strategy() -> impl Strategy<Value = ChildOp> {
    prop_oneof![
        3 => (child_key_strategy(), -20i64..20)
            .prop_map(|(key, value)| ChildOp::Set { key, value }),
        1 => child_key_strategy().prop_map(|key| ChildOp::Remove { key }),
    ]
}

/// Strategy for generating a sequence of child mutations.
pub fn child_ops_strategy(min_ops: usize, max_ops: usize) -> impl Strategy<Value = Vec<ChildOp>> {
    prop::collection::vec(child_op_strategy(), min_ops..max_ops)
}

/// Strategy for queries over a collection of integer children.
pub fn query_state_strategy() -> impl Strategy<Value = QueryState> {
    let ordering = prop_oneof![
        Just(QueryBuilder::new()),
        Just(QueryBuilder::new().order_by_key()),
        Just(QueryBuilder::new().order_by_value()),
        (-20i64..20, 0i64..20).prop_map(|(low, span)| {
            QueryBuilder::new()
                .order_by_value()
                .start_at(low)
                .end_at(low + span)
        }),
    ];
    let limit = prop_oneof![
        Just(None),
        (1u32..6).prop_map(|n| Some((true, n))),
        (1u32..6).prop_map(|n| Some((false, n))),
    ];
    (ordering, limit).prop_map(|(builder, limit)| {
        let builder = match limit {
            Some((true, n)) => builder.limit_to_first(n),
            Some((false, n)) => builder.limit_to_last(n),
            None => builder,
        };
        builder.build()
    })
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_names_closest_arrived_predecessor() {
        let expected = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let arrival = vec!["c".to_string(), "a".to_string(), "b".to_string()];
        let chain = InsertChain::new(expected, arrival);
        assert_eq!(
            chain.steps,
            vec![
                ("c".to_string(), None),
                ("a".to_string(), None),
                ("b".to_string(), Some("a".to_string())),
            ]
        );
    }

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn chains_cover_every_key(chain in insert_chain_strategy(12)) {
            prop_assert_eq!(chain.steps.len(), chain.expected.len());
        }

        #[test]
        fn queries_have_an_ordering_or_none(state in query_state_strategy()) {
            let orderings = [state.order_by_key, state.order_by_value, state.order_by_child.is_some()];
            prop_assert!(orderings.iter().filter(|set| **set).count() <= 1);
        }
    }
}
