//! Binding declarations and resolution.
//!
//! A [`Binding`] names a slice of local state and says where its data lives
//! remotely. Paths and queries may depend on the current state, so the
//! declarations are re-resolved after every state change and the resulting
//! [`ResolvedBindings`] snapshot is what the subscription manager diffs.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use livebind_core::{Query, QueryBuilder, QueryState, StoreState, Value};

use crate::error::{BindError, BindResult};

/// Shape of a bound value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    /// A JSON object, mirrored as a whole.
    Object,
    /// An ordered collection of children.
    Array,
    /// A scalar value, mirrored as a whole.
    Primitive,
}

/// Computes a path from the state and the path parameters.
pub type PathFn<S> = Arc<dyn Fn(&StoreState<S>, Option<&Value>) -> Option<String> + Send + Sync>;

/// Refines the query of a binding.
pub type QueryFn<S> = Arc<dyn Fn(QueryBuilder, &StoreState<S>) -> QueryBuilder + Send + Sync>;

/// Maps an array child key to the path of its joined record.
pub type PopulateFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Computes the path parameters passed to path functions.
pub type PathParamsFn<S> = Arc<dyn Fn(&StoreState<S>) -> Value + Send + Sync>;

/// Where a binding's path comes from.
pub enum PathSource<S> {
    /// A fixed path.
    Literal(String),
    /// A path computed from state; `None` means "nothing to observe".
    Derived(PathFn<S>),
}

impl<S> Clone for PathSource<S> {
    fn clone(&self) -> Self {
        match self {
            PathSource::Literal(path) => PathSource::Literal(path.clone()),
            PathSource::Derived(f) => PathSource::Derived(Arc::clone(f)),
        }
    }
}

impl<S> fmt::Debug for PathSource<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSource::Literal(path) => f.debug_tuple("Literal").field(path).finish(),
            PathSource::Derived(_) => f.write_str("Derived(..)"),
        }
    }
}

/// A binding declaration.
pub struct Binding<S> {
    name: String,
    path: PathSource<S>,
    kind: BindingKind,
    query: Option<QueryFn<S>>,
    populate: Option<PopulateFn>,
}

impl<S> Clone for Binding<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            path: self.path.clone(),
            kind: self.kind,
            query: self.query.clone(),
            populate: self.populate.clone(),
        }
    }
}

impl<S> fmt::Debug for Binding<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("query", &self.query.is_some())
            .field("populate", &self.populate.is_some())
            .finish()
    }
}

impl<S> Binding<S> {
    /// Declares a binding at a fixed path.
    pub fn new(name: impl Into<String>, path: impl Into<String>, kind: BindingKind) -> Self {
        Self {
            name: name.into(),
            path: PathSource::Literal(path.into()),
            kind,
            query: None,
            populate: None,
        }
    }

    /// Declares an object binding.
    pub fn object(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(name, path, BindingKind::Object)
    }

    /// Declares an array binding.
    pub fn array(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(name, path, BindingKind::Array)
    }

    /// Declares a primitive binding.
    pub fn primitive(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(name, path, BindingKind::Primitive)
    }

    /// Declares a binding whose path is computed from state.
    pub fn derived<F>(name: impl Into<String>, kind: BindingKind, path: F) -> Self
    where
        F: Fn(&StoreState<S>, Option<&Value>) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            path: PathSource::Derived(Arc::new(path)),
            kind,
            query: None,
            populate: None,
        }
    }

    /// Refines the binding's query from state.
    pub fn with_query<F>(mut self, query: F) -> Self
    where
        F: Fn(QueryBuilder, &StoreState<S>) -> QueryBuilder + Send + Sync + 'static,
    {
        self.query = Some(Arc::new(query));
        self
    }

    /// Joins each array child with the record at `populate(child_key)`.
    ///
    /// A populated binding is always an array.
    pub fn with_populate<F>(mut self, populate: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.populate = Some(Arc::new(populate));
        self
    }

    /// Local name of the binding.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path source of the binding.
    pub fn path(&self) -> &PathSource<S> {
        &self.path
    }

    /// Effective kind: [`BindingKind::Array`] whenever populate is set.
    pub fn kind(&self) -> BindingKind {
        if self.populate.is_some() {
            BindingKind::Array
        } else {
            self.kind
        }
    }

    /// Returns true if the binding joins its children.
    pub fn is_populated(&self) -> bool {
        self.populate.is_some()
    }

    fn shape(&self) -> Shape {
        match (&self.populate, self.kind) {
            (Some(populate), _) => Shape::Joined(Arc::clone(populate)),
            (None, BindingKind::Array) => Shape::Collection,
            (None, BindingKind::Object | BindingKind::Primitive) => Shape::Value,
        }
    }

    fn resolve_path(&self, state: &StoreState<S>, params: Option<&Value>) -> Option<String> {
        let path = match &self.path {
            PathSource::Literal(path) => Some(path.clone()),
            PathSource::Derived(f) => f(state, params),
        }?;
        if path.trim().is_empty() {
            None
        } else {
            Some(path)
        }
    }

    fn resolve_query(&self, path: &str, state: &StoreState<S>) -> Query {
        let query_state = match &self.query {
            Some(f) => f(QueryBuilder::new(), state).build(),
            None => QueryState::default(),
        };
        Query::new(path, query_state)
    }
}

impl<S: 'static> Binding<S> {
    /// Uses a fixed set of query clauses.
    pub fn with_static_query(self, state: QueryState) -> Self {
        self.with_query(move |_, _| QueryBuilder::from_state(state.clone()))
    }
}

/// Checks declarations before any subscription is made.
pub fn validate_bindings<S>(bindings: &[Binding<S>]) -> BindResult<()> {
    let mut seen = BTreeSet::new();
    for binding in bindings {
        if binding.name.trim().is_empty() {
            return Err(BindError::InvalidBinding {
                name: binding.name.clone(),
                reason: "local name must not be empty".into(),
            });
        }
        if !seen.insert(binding.name.as_str()) {
            return Err(BindError::DuplicateBinding(binding.name.clone()));
        }
        if let PathSource::Literal(path) = &binding.path {
            if path.trim().is_empty() {
                return Err(BindError::InvalidBinding {
                    name: binding.name.clone(),
                    reason: "path must be a non-empty string or a path function".into(),
                });
            }
        }
    }
    Ok(())
}

/// How a resolved binding is mirrored.
#[derive(Clone)]
pub enum Shape {
    /// One value listener; the whole node is replaced on each delivery.
    Value,
    /// Child listeners maintaining an ordered collection.
    Collection,
    /// An ordered collection whose children are joined records.
    Joined(PopulateFn),
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Value => f.write_str("Value"),
            Shape::Collection => f.write_str("Collection"),
            Shape::Joined(_) => f.write_str("Joined(..)"),
        }
    }
}

/// A binding evaluated against one state.
#[derive(Debug, Clone)]
pub struct ResolvedBinding {
    /// Local name.
    pub name: String,
    /// Normalized remote path.
    pub path: String,
    /// Effective kind.
    pub kind: BindingKind,
    /// Live query at `path`.
    pub query: Query,
    /// Mirroring strategy.
    pub shape: Shape,
}

impl PartialEq for ResolvedBinding {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path && self.query.state == other.query.state
    }
}

/// Resolved bindings keyed by local name.
pub type ResolvedBindings = BTreeMap<String, ResolvedBinding>;

/// Evaluates every declaration against `state`.
///
/// Bindings whose path is absent or empty are left out.
pub fn resolve<S>(
    bindings: &[Binding<S>],
    state: &StoreState<S>,
    path_params: Option<&PathParamsFn<S>>,
) -> ResolvedBindings {
    let params = path_params.map(|f| f(state));
    bindings
        .iter()
        .filter_map(|binding| {
            let path = binding.resolve_path(state, params.as_ref())?;
            let query = binding.resolve_query(&path, state);
            Some((
                binding.name.clone(),
                ResolvedBinding {
                    name: binding.name.clone(),
                    path: query.path.clone(),
                    kind: binding.kind(),
                    query,
                    shape: binding.shape(),
                },
            ))
        })
        .collect()
}
