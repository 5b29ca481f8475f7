//! Configuration for a sync session.

use std::fmt;
use std::sync::Arc;

use livebind_core::{StoreState, Value};

use crate::binding::{validate_bindings, Binding, PathParamsFn};
use crate::error::{BindError, BindResult, RemoteError};
use crate::subscription::CancelFn;

/// Called with the signed-in user on every auth change, `None` on sign-out.
pub type AuthHook = Arc<dyn Fn(Option<&Value>) + Send + Sync>;

/// Configuration for [`start_sync`](crate::start_sync).
pub struct SyncConfig<S> {
    /// Remote URL, recorded in the state.
    pub url: String,
    /// Binding declarations.
    pub bindings: Vec<Binding<S>>,
    /// Called when the remote cancels a listener.
    pub on_cancel: Option<CancelFn>,
    /// Called on every auth change.
    pub on_auth: Option<AuthHook>,
    /// Computes the parameters passed to path functions.
    pub path_params: Option<PathParamsFn<S>>,
}

impl<S> SyncConfig<S> {
    /// Creates a configuration with no bindings.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            bindings: Vec::new(),
            on_cancel: None,
            on_auth: None,
            path_params: None,
        }
    }

    /// Adds a binding.
    pub fn with_binding(mut self, binding: Binding<S>) -> Self {
        self.bindings.push(binding);
        self
    }

    /// Adds several bindings.
    pub fn with_bindings(mut self, bindings: impl IntoIterator<Item = Binding<S>>) -> Self {
        self.bindings.extend(bindings);
        self
    }

    /// Sets the cancellation hook.
    pub fn with_on_cancel<F>(mut self, on_cancel: F) -> Self
    where
        F: Fn(&RemoteError) + Send + Sync + 'static,
    {
        self.on_cancel = Some(Arc::new(on_cancel));
        self
    }

    /// Sets the auth hook.
    pub fn with_on_auth<F>(mut self, on_auth: F) -> Self
    where
        F: Fn(Option<&Value>) + Send + Sync + 'static,
    {
        self.on_auth = Some(Arc::new(on_auth));
        self
    }

    /// Sets the path parameter function.
    pub fn with_path_params<F>(mut self, path_params: F) -> Self
    where
        F: Fn(&StoreState<S>) -> Value + Send + Sync + 'static,
    {
        self.path_params = Some(Arc::new(path_params));
        self
    }

    /// Names of the declared bindings.
    pub fn binding_names(&self) -> Vec<String> {
        self.bindings.iter().map(|b| b.name().to_string()).collect()
    }

    /// Checks the configuration.
    pub fn validate(&self) -> BindResult<()> {
        if self.url.trim().is_empty() {
            return Err(BindError::MissingUrl);
        }
        validate_bindings(&self.bindings)
    }
}

impl<S> fmt::Debug for SyncConfig<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("url", &self.url)
            .field("bindings", &self.bindings)
            .field("on_cancel", &self.on_cancel.is_some())
            .field("on_auth", &self.on_auth.is_some())
            .field("path_params", &self.path_params.is_some())
            .finish()
    }
}
