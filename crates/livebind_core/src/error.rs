//! Error types for LiveBind core.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by typed accessors and parsers in the core crate.
///
/// The reducer itself never fails: events that reference missing or
/// mismatched slices are ignored as stale.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// No slice is declared under this binding name.
    #[error("unknown binding: {name}")]
    UnknownBinding {
        /// Binding name.
        name: String,
    },

    /// The slice exists but does not hold an ordered record sequence.
    #[error("binding {name} does not hold an array value")]
    NotAnArray {
        /// Binding name.
        name: String,
    },

    /// The slice is declared but has not received a value yet.
    #[error("binding {name} has no value yet")]
    NotLoaded {
        /// Binding name.
        name: String,
    },

    /// The write method is not one of set, push, update or transaction.
    #[error("unknown write method: {method}")]
    UnknownWriteMethod {
        /// The rejected method name.
        method: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CoreError::NotAnArray {
            name: "posts".into(),
        };
        assert_eq!(err.to_string(), "binding posts does not hold an array value");

        let err = CoreError::UnknownWriteMethod {
            method: "merge".into(),
        };
        assert!(err.to_string().contains("merge"));
    }
}
