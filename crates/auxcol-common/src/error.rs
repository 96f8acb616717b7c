//! Error types for auxcol
//!
//! This module defines the error taxonomy shared by the physical formats,
//! the read/write backends and the attribute store.

use thiserror::Error;

/// Common result type for auxcol operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for auxcol
#[derive(Debug, Error)]
pub enum Error {
    // Per-attribute resolution errors
    #[error("column not found: {column}")]
    ColumnNotFound { column: String },

    #[error("type mismatch for attribute {attribute}: on disk {on_disk}, registered {registered}")]
    TypeMismatch {
        attribute: String,
        on_disk: String,
        registered: String,
    },

    #[error("type error for attribute {attribute}: {reason}")]
    TypeError { attribute: String, reason: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("store is locked: attribute {attribute} has no backing column and is not a decoration")]
    StoreLocked { attribute: String },

    // Physical I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("format error: {0}")]
    Format(String),

    // Internal errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a format error
    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a type error for an attribute
    pub fn type_error(attribute: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TypeError {
            attribute: attribute.into(),
            reason: reason.into(),
        }
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::ColumnNotFound { .. })
    }

    /// Check if this error must abort the current row.
    ///
    /// Missing columns and type mismatches that schema evolution can absorb
    /// only affect a single attribute.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::ColumnNotFound { .. } | Self::TypeMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_not_found() {
        assert!(
            Error::ColumnNotFound {
                column: "ElectronsAuxDyn.pt".into()
            }
            .is_not_found()
        );
        assert!(!Error::Configuration("x".into()).is_not_found());
    }

    #[test]
    fn test_error_fatal() {
        assert!(
            !Error::TypeMismatch {
                attribute: "pt".into(),
                on_disk: "float".into(),
                registered: "double".into(),
            }
            .is_fatal()
        );
        assert!(Error::type_error("pt", "no coercion").is_fatal());
        assert!(Error::Io(std::io::Error::other("boom")).is_fatal());
        assert!(Error::format("bad magic").is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = Error::StoreLocked {
            attribute: "eta".into(),
        };
        assert!(err.to_string().contains("eta"));
    }
}
