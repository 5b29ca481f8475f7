//! Event vocabulary.
//!
//! Every change to the sync state is expressed as a [`SyncEvent`] and folded
//! in by the reducer. The sync engine only ever dispatches events; it never
//! writes state directly.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::CoreError;
use crate::record::Record;
use crate::state::{AuthField, StoreSlice};

/// Identifier of a single write, unique per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WriteId(Uuid);

impl WriteId {
    /// Generates a fresh identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for WriteId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WriteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Remote write primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMethod {
    /// Replace the node.
    Set,
    /// Append a child under a generated key.
    Push,
    /// Merge the given children into the node.
    Update,
    /// Replace the node atomically.
    Transaction,
}

impl WriteMethod {
    /// All supported methods.
    pub const ALL: [WriteMethod; 4] = [
        WriteMethod::Set,
        WriteMethod::Push,
        WriteMethod::Update,
        WriteMethod::Transaction,
    ];

    /// The method's wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteMethod::Set => "set",
            WriteMethod::Push => "push",
            WriteMethod::Update => "update",
            WriteMethod::Transaction => "transaction",
        }
    }
}

impl fmt::Display for WriteMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WriteMethod {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WriteMethod::ALL
            .into_iter()
            .find(|method| method.as_str() == s)
            .ok_or_else(|| CoreError::UnknownWriteMethod { method: s.into() })
    }
}

/// A state transition.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Declares the binding names so their slices exist (as `None`).
    BindingsDeclared {
        /// Declared binding names.
        names: Vec<String>,
    },
    /// The set of currently resolved bindings changed.
    BindingsResolved {
        /// Names of the bindings that resolved to a path.
        names: Vec<String>,
    },
    /// A child was added to an array binding.
    ArrayChildAdded {
        /// Binding name.
        binding: String,
        /// The new record.
        record: Record,
        /// Key of the preceding sibling, `None` for the head.
        previous_key: Option<String>,
    },
    /// A child of an array binding changed.
    ArrayChildChanged {
        /// Binding name.
        binding: String,
        /// The updated record.
        record: Record,
    },
    /// A child of an array binding moved.
    ArrayChildMoved {
        /// Binding name.
        binding: String,
        /// Key of the moved child.
        key: String,
        /// Key of the new preceding sibling, `None` for the head.
        previous_key: Option<String>,
    },
    /// A child of an array binding was removed.
    ArrayChildRemoved {
        /// Binding name.
        binding: String,
        /// Key of the removed child.
        key: String,
    },
    /// An array binding was replaced wholesale.
    ArrayUpdated {
        /// Binding name.
        binding: String,
        /// Key of the bound node.
        key: String,
        /// Ordered children.
        records: Vec<Record>,
    },
    /// An object or primitive binding was replaced wholesale.
    ObjectUpdated {
        /// Binding name.
        binding: String,
        /// Key of the bound node.
        key: String,
        /// New value.
        value: Value,
    },
    /// A slice was replaced with an explicit value, `None` to reset it.
    ValueReplaced {
        /// Binding name.
        binding: String,
        /// New slice.
        slice: Option<StoreSlice>,
    },
    /// A binding delivered its first value or its first definitive failure.
    InitialValueReceived {
        /// Binding name.
        binding: String,
    },
    /// All resolved bindings have delivered.
    InitialFetchDone,
    /// The remote reported connectivity.
    Connected,
    /// A user signed in.
    UserAuthenticated(Value),
    /// The user signed out.
    UserUnauthenticated,
    /// Session configuration recorded at sync start.
    ConfigUpdated {
        /// Remote URL.
        url: String,
    },
    /// A listener was cancelled by the remote.
    PermissionsRevoked {
        /// Remote error message.
        message: String,
    },
    /// An auth flow started or finished.
    ProcessingUpdated {
        /// Flow.
        field: AuthField,
        /// Whether the flow is in flight.
        value: bool,
    },
    /// An auth flow error was set or cleared.
    ErrorUpdated {
        /// Flow.
        field: AuthField,
        /// Error message, `None` to clear.
        error: Option<String>,
    },
    /// An auth flow completed.
    CompletedUpdated {
        /// Flow.
        field: AuthField,
        /// Completion flag.
        value: bool,
    },
    /// A write was issued.
    WriteStarted {
        /// Write identifier.
        id: WriteId,
        /// Target path.
        path: String,
        /// Write method.
        method: WriteMethod,
    },
    /// A write was acknowledged.
    WriteCompleted {
        /// Write identifier.
        id: WriteId,
        /// Target path.
        path: String,
    },
    /// A write failed.
    WriteFailed {
        /// Write identifier.
        id: WriteId,
        /// Target path.
        path: String,
        /// Remote error message.
        message: String,
    },
    /// Write errors for a path were dismissed.
    WriteErrorsCleared {
        /// Target path.
        path: String,
    },
}

impl SyncEvent {
    /// The binding this event targets, if any.
    pub fn binding(&self) -> Option<&str> {
        match self {
            SyncEvent::ArrayChildAdded { binding, .. }
            | SyncEvent::ArrayChildChanged { binding, .. }
            | SyncEvent::ArrayChildMoved { binding, .. }
            | SyncEvent::ArrayChildRemoved { binding, .. }
            | SyncEvent::ArrayUpdated { binding, .. }
            | SyncEvent::ObjectUpdated { binding, .. }
            | SyncEvent::ValueReplaced { binding, .. }
            | SyncEvent::InitialValueReceived { binding } => Some(binding),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_method_parsing() {
        assert_eq!("push".parse::<WriteMethod>().unwrap(), WriteMethod::Push);
        assert_eq!(
            "transaction".parse::<WriteMethod>().unwrap(),
            WriteMethod::Transaction
        );
        assert!(matches!(
            "merge".parse::<WriteMethod>(),
            Err(CoreError::UnknownWriteMethod { .. })
        ));
    }

    #[test]
    fn write_ids_are_unique() {
        assert_ne!(WriteId::new(), WriteId::new());
    }

    #[test]
    fn binding_accessor() {
        let event = SyncEvent::InitialValueReceived {
            binding: "posts".into(),
        };
        assert_eq!(event.binding(), Some("posts"));
        assert_eq!(SyncEvent::Connected.binding(), None);
    }
}
