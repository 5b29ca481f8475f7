//! Sync state tree and reducer.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::trace;

use crate::error::{CoreError, CoreResult};
use crate::event::{SyncEvent, WriteId};
use crate::record::{self, Record};

/// Selector that projects the status part of the state in [`SyncState::select`].
pub const STATUS_SELECTOR: &str = "_status";

/// Value held by a store slice.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SliceValue {
    /// Ordered children of an array binding.
    Records(Vec<Record>),
    /// Value of an object or primitive binding.
    Value(Value),
}

/// The local mirror of one binding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreSlice {
    /// Key of the bound node, the terminal segment of its path.
    pub key: String,
    /// Mirrored value.
    pub value: SliceValue,
}

impl StoreSlice {
    /// Creates a slice holding ordered records.
    pub fn records(key: impl Into<String>, records: Vec<Record>) -> Self {
        Self {
            key: key.into(),
            value: SliceValue::Records(records),
        }
    }

    /// Creates a slice holding a plain value.
    pub fn value(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value: SliceValue::Value(value),
        }
    }

    /// The ordered records, if this is an array slice.
    pub fn as_records(&self) -> Option<&[Record]> {
        match &self.value {
            SliceValue::Records(records) => Some(records),
            SliceValue::Value(_) => None,
        }
    }

    /// The plain value, if this is an object or primitive slice.
    pub fn as_value(&self) -> Option<&Value> {
        match &self.value {
            SliceValue::Value(value) => Some(value),
            SliceValue::Records(_) => None,
        }
    }

    /// Renders the slice as `{key, value}` JSON.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Auth flows tracked in the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthField {
    /// Password or OAuth login.
    Login,
    /// Account registration.
    CreateUser,
    /// Password reset.
    ResetPassword,
}

/// One value per auth flow.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthFields<T> {
    /// Login flow.
    pub login: T,
    /// Registration flow.
    pub create_user: T,
    /// Password reset flow.
    pub reset_password: T,
}

impl<T> AuthFields<T> {
    /// Returns the value for a flow.
    pub fn get(&self, field: AuthField) -> &T {
        match field {
            AuthField::Login => &self.login,
            AuthField::CreateUser => &self.create_user,
            AuthField::ResetPassword => &self.reset_password,
        }
    }

    fn set(&mut self, field: AuthField, value: T) {
        match field {
            AuthField::Login => self.login = value,
            AuthField::CreateUser => self.create_user = value,
            AuthField::ResetPassword => self.reset_password = value,
        }
    }
}

/// Error strings surfaced next to the data.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Errors {
    /// Auth flow errors.
    #[serde(flatten)]
    pub auth: AuthFields<Option<String>>,
    /// Last listener cancellation message.
    pub permissions: Option<String>,
}

/// Write lifecycle tracking, keyed by path.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Writes {
    /// In-flight writes per path.
    pub processing: BTreeMap<String, Vec<WriteId>>,
    /// Failure messages per path.
    pub errors: BTreeMap<String, Vec<String>>,
}

impl Writes {
    /// In-flight writes for `path`.
    pub fn processing_for(&self, path: &str) -> &[WriteId] {
        self.processing.get(path).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Failure messages for `path`.
    pub fn errors_for(&self, path: &str) -> &[String] {
        self.errors.get(path).map(Vec::as_slice).unwrap_or(&[])
    }

    fn finish(&mut self, path: &str, id: WriteId) {
        if let Some(ids) = self.processing.get_mut(path) {
            ids.retain(|pending| *pending != id);
            if ids.is_empty() {
                self.processing.remove(path);
            }
        }
    }
}

/// Status part of the state: everything but the mirrored data.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// Signed-in user.
    pub authenticated_user: Option<Value>,
    /// Connectivity fact.
    pub connected: bool,
    /// Initial fetch fact.
    pub initial_fetch_done: bool,
    /// Error strings.
    pub errors: Errors,
    /// Auth flows in flight.
    pub processing: AuthFields<bool>,
    /// Auth flows completed.
    pub completed: AuthFields<bool>,
    /// Write tracking.
    pub writes: Writes,
}

/// The sync state of one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    /// Signed-in user, as reported by the remote.
    pub authenticated_user: Option<Value>,
    /// Set the first time connectivity is reported, never reset.
    pub connected: bool,
    /// True while every resolved binding has delivered at least once.
    pub initial_fetch_done: bool,
    /// Bindings that delivered at least once.
    pub initial_values_received: BTreeSet<String>,
    /// Bindings currently resolved to a path.
    pub active_bindings: BTreeSet<String>,
    /// Mirrored slices; `None` until a value arrives.
    pub stores: BTreeMap<String, Option<Arc<StoreSlice>>>,
    /// Error strings.
    pub errors: Errors,
    /// Auth flows in flight.
    pub processing: AuthFields<bool>,
    /// Auth flows completed.
    pub completed: AuthFields<bool>,
    /// Write tracking.
    pub writes: Writes,
    /// Remote URL of the session.
    pub url: Option<String>,
}

impl SyncState {
    /// Creates an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a state with a `None` slice for each binding name.
    pub fn with_bindings<I, N>(names: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        let mut state = Self::default();
        for name in names {
            state.stores.insert(name.into(), None);
        }
        state
    }

    /// The slice for `name`, if declared and loaded.
    pub fn slice(&self, name: &str) -> Option<&StoreSlice> {
        self.stores.get(name).and_then(|slice| slice.as_deref())
    }

    /// The ordered records of an array binding.
    pub fn records(&self, name: &str) -> CoreResult<&[Record]> {
        let slice = self
            .stores
            .get(name)
            .ok_or_else(|| CoreError::UnknownBinding { name: name.into() })?
            .as_deref()
            .ok_or_else(|| CoreError::NotLoaded { name: name.into() })?;
        slice
            .as_records()
            .ok_or_else(|| CoreError::NotAnArray { name: name.into() })
    }

    /// Everything but the mirrored data and bookkeeping sets.
    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            authenticated_user: self.authenticated_user.clone(),
            connected: self.connected,
            initial_fetch_done: self.initial_fetch_done,
            errors: self.errors.clone(),
            processing: self.processing.clone(),
            completed: self.completed.clone(),
            writes: self.writes.clone(),
        }
    }

    /// Projects the named slices, plus the status under [`STATUS_SELECTOR`].
    ///
    /// Unloaded or unknown slices project to `null`.
    pub fn select(&self, names: &[&str]) -> Map<String, Value> {
        names
            .iter()
            .map(|name| {
                let value = if *name == STATUS_SELECTOR {
                    serde_json::to_value(self.status()).unwrap_or(Value::Null)
                } else {
                    self.slice(name)
                        .map(StoreSlice::to_json)
                        .unwrap_or(Value::Null)
                };
                ((*name).to_string(), value)
            })
            .collect()
    }

    /// Applies an event in place.
    pub fn apply(&mut self, event: &SyncEvent) {
        trace!(?event, "applying sync event");
        match event {
            SyncEvent::BindingsDeclared { names } => {
                for name in names {
                    self.stores.entry(name.clone()).or_insert(None);
                }
            }
            SyncEvent::BindingsResolved { names } => {
                self.active_bindings = names.iter().cloned().collect();
                self.initial_fetch_done = self.all_active_received();
            }
            SyncEvent::ArrayChildAdded {
                binding,
                record,
                previous_key,
            } => self.update_records(binding, |seq| {
                record::insert_after(seq, record.clone(), previous_key.as_deref())
            }),
            SyncEvent::ArrayChildChanged { binding, record } => {
                self.update_records(binding, |seq| {
                    record::replace_at(seq, &record.key, record.clone())
                })
            }
            SyncEvent::ArrayChildMoved {
                binding,
                key,
                previous_key,
            } => self.update_records(binding, |seq| {
                record::move_after(seq, key, previous_key.as_deref())
            }),
            SyncEvent::ArrayChildRemoved { binding, key } => {
                self.update_records(binding, |seq| record::remove_at(seq, key))
            }
            SyncEvent::ArrayUpdated {
                binding,
                key,
                records,
            } => {
                let slice = StoreSlice::records(key.clone(), records.clone());
                self.stores.insert(binding.clone(), Some(Arc::new(slice)));
            }
            SyncEvent::ObjectUpdated {
                binding,
                key,
                value,
            } => {
                let slice = StoreSlice::value(key.clone(), value.clone());
                self.stores.insert(binding.clone(), Some(Arc::new(slice)));
            }
            SyncEvent::ValueReplaced { binding, slice } => {
                self.stores
                    .insert(binding.clone(), slice.clone().map(Arc::new));
            }
            SyncEvent::InitialValueReceived { binding } => {
                self.initial_values_received.insert(binding.clone());
                if !self.active_bindings.is_empty() && self.all_active_received() {
                    self.initial_fetch_done = true;
                }
            }
            SyncEvent::InitialFetchDone => self.initial_fetch_done = true,
            SyncEvent::Connected => self.connected = true,
            SyncEvent::UserAuthenticated(user) => self.authenticated_user = Some(user.clone()),
            SyncEvent::UserUnauthenticated => self.authenticated_user = None,
            SyncEvent::ConfigUpdated { url } => self.url = Some(url.clone()),
            SyncEvent::PermissionsRevoked { message } => {
                self.errors.permissions = Some(message.clone())
            }
            SyncEvent::ProcessingUpdated { field, value } => self.processing.set(*field, *value),
            SyncEvent::ErrorUpdated { field, error } => self.errors.auth.set(*field, error.clone()),
            SyncEvent::CompletedUpdated { field, value } => self.completed.set(*field, *value),
            SyncEvent::WriteStarted { id, path, .. } => {
                self.writes
                    .processing
                    .entry(path.clone())
                    .or_default()
                    .push(*id);
            }
            SyncEvent::WriteCompleted { id, path } => self.writes.finish(path, *id),
            SyncEvent::WriteFailed { id, path, message } => {
                self.writes.finish(path, *id);
                self.writes
                    .errors
                    .entry(path.clone())
                    .or_default()
                    .push(message.clone());
            }
            SyncEvent::WriteErrorsCleared { path } => {
                self.writes.errors.remove(path);
            }
        }
    }

    fn all_active_received(&self) -> bool {
        self.active_bindings
            .is_subset(&self.initial_values_received)
    }

    fn update_records(&mut self, binding: &str, f: impl FnOnce(&[Record]) -> Vec<Record>) {
        let Some(Some(slice)) = self.stores.get(binding) else {
            trace!(binding, "ignoring child event for unloaded binding");
            return;
        };
        let Some(records) = slice.as_records() else {
            trace!(binding, "ignoring child event for non-array binding");
            return;
        };
        let next = StoreSlice::records(slice.key.clone(), f(records));
        self.stores.insert(binding.to_string(), Some(Arc::new(next)));
    }
}

/// Pure reducer: returns the state after applying `event`.
pub fn reduce(state: &SyncState, event: &SyncEvent) -> SyncState {
    let mut next = state.clone();
    next.apply(event);
    next
}
