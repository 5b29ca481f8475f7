//! Query model.
//!
//! A [`QueryBuilder`] records ordering, range and limit clauses. Clauses are
//! cumulative and the last call for a given clause wins. The resulting
//! [`QueryState`] is the canonical, comparable description of a query; two
//! bindings observe the same data iff their path and query state are equal.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::path;

/// Canonical description of a query's clauses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryState {
    /// Order children by the value of this child key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_by_child: Option<String>,
    /// Order children by key.
    #[serde(skip_serializing_if = "is_false")]
    pub order_by_key: bool,
    /// Order children by value.
    #[serde(skip_serializing_if = "is_false")]
    pub order_by_value: bool,
    /// Order children by priority.
    #[serde(skip_serializing_if = "is_false")]
    pub order_by_priority: bool,
    /// Lower bound on the ordering value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_at: Option<Value>,
    /// Upper bound on the ordering value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_at: Option<Value>,
    /// Exact match on the ordering value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub equal_to: Option<Value>,
    /// Keep only the first `n` children.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_to_first: Option<u32>,
    /// Keep only the last `n` children.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_to_last: Option<u32>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl QueryState {
    /// Returns true if no clause has been set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Chained builder for [`QueryState`].
#[derive(Debug, Clone, Default)]
pub struct QueryBuilder {
    state: QueryState,
}

impl QueryBuilder {
    /// Creates a builder with no clauses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder starting from an existing state.
    pub fn from_state(state: QueryState) -> Self {
        Self { state }
    }

    /// Orders by a child key.
    pub fn order_by_child(mut self, child: impl Into<String>) -> Self {
        self.state.order_by_child = Some(child.into());
        self
    }

    /// Orders by key.
    pub fn order_by_key(mut self) -> Self {
        self.state.order_by_key = true;
        self
    }

    /// Orders by value.
    pub fn order_by_value(mut self) -> Self {
        self.state.order_by_value = true;
        self
    }

    /// Orders by priority.
    pub fn order_by_priority(mut self) -> Self {
        self.state.order_by_priority = true;
        self
    }

    /// Sets the lower bound.
    pub fn start_at(mut self, value: impl Into<Value>) -> Self {
        self.state.start_at = Some(value.into());
        self
    }

    /// Sets the upper bound.
    pub fn end_at(mut self, value: impl Into<Value>) -> Self {
        self.state.end_at = Some(value.into());
        self
    }

    /// Sets an exact match.
    pub fn equal_to(mut self, value: impl Into<Value>) -> Self {
        self.state.equal_to = Some(value.into());
        self
    }

    /// Limits to the first `limit` children.
    pub fn limit_to_first(mut self, limit: u32) -> Self {
        self.state.limit_to_first = Some(limit);
        self
    }

    /// Limits to the last `limit` children.
    pub fn limit_to_last(mut self, limit: u32) -> Self {
        self.state.limit_to_last = Some(limit);
        self
    }

    /// Returns the accumulated state.
    pub fn build(self) -> QueryState {
        self.state
    }
}

/// A live query: a normalized path refined by a query state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Query {
    /// Normalized path of the queried node.
    pub path: String,
    /// Clauses refining the children of that node.
    pub state: QueryState,
}

impl Query {
    /// Creates an unrefined query at `path`.
    pub fn at(path: &str) -> Self {
        Self {
            path: path::normalize(path),
            state: QueryState::default(),
        }
    }

    /// Creates a query at `path` with the given clauses.
    pub fn new(path: &str, state: QueryState) -> Self {
        Self {
            path: path::normalize(path),
            state,
        }
    }

    /// The key of the queried node.
    pub fn key(&self) -> &str {
        path::last_segment(&self.path)
    }
}
