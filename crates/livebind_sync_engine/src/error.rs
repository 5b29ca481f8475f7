//! Error types for the sync engine.

use livebind_core::CoreError;
use thiserror::Error;

/// Result type for setup-time operations.
pub type BindResult<T> = Result<T, BindError>;

/// Result type for remote operations.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Configuration errors, raised synchronously at setup.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BindError {
    /// A binding declaration is malformed.
    #[error("invalid binding {name:?}: {reason}")]
    InvalidBinding {
        /// Binding name.
        name: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Two bindings share a name.
    #[error("duplicate binding name: {0}")]
    DuplicateBinding(String),

    /// The write method is not supported.
    #[error("write method must be one of: set, push, update, transaction (got {0:?})")]
    UnsupportedWriteMethod(String),

    /// The write path is empty.
    #[error("write path must be a non-empty string or a path function")]
    InvalidWritePath,

    /// The session has no remote URL.
    #[error("sync config: remote url must not be empty")]
    MissingUrl,

    /// The session was torn down before the awaited signal fired.
    #[error("sync session closed")]
    SessionClosed,

    /// Core error.
    #[error("core error: {0}")]
    Core(#[from] CoreError),
}

/// Failures reported by the remote client.
///
/// These never propagate as `Err` out of the engine; they become events.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The remote refused access to a path.
    #[error("permission denied at {path:?}")]
    PermissionDenied {
        /// Rejected path.
        path: String,
    },

    /// The remote went away before answering.
    #[error("not connected to remote")]
    Disconnected,

    /// Any other failure, with an optional provider code.
    #[error("{message}")]
    Failed {
        /// Provider error code, such as `EMAIL_TAKEN`.
        code: Option<String>,
        /// Provider message.
        message: String,
    },
}

impl RemoteError {
    /// Creates a permission error.
    pub fn permission_denied(path: impl Into<String>) -> Self {
        Self::PermissionDenied { path: path.into() }
    }

    /// Creates a coded failure.
    pub fn coded(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// Creates an uncoded failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            code: None,
            message: message.into(),
        }
    }

    /// Returns true for permission errors.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, RemoteError::PermissionDenied { .. })
    }

    /// The provider error code, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            RemoteError::PermissionDenied { .. } => Some("PERMISSION_DENIED"),
            RemoteError::Disconnected => None,
            RemoteError::Failed { code, .. } => code.as_deref(),
        }
    }
}
