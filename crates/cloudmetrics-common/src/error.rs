//! Error types for the cloudmetrics adapter
//!
//! Variants carry the declaration they concern so a rejected CRD can be found
//! from a single log line.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for adapter operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A declaration failed validation and cannot be turned into a cache entry
    #[error("invalid declaration {declaration}: {message}")]
    Validation {
        /// Declaration identity (`Kind/namespace/name`)
        declaration: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.target.selector")
        field: Option<String>,
    },

    /// A label selector could not be parsed
    #[error("invalid label selector '{selector}': {message}")]
    Selector {
        /// The selector text as received
        selector: String,
        /// What was wrong with it
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },
}

impl Error {
    /// Create a validation error without declaration context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            declaration: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a specific declaration and field path
    pub fn validation_for_field(
        declaration: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            declaration: declaration.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a selector parse error
    pub fn selector(selector: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Selector {
            selector: selector.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Check if this error is retryable
    ///
    /// Kubernetes client errors are, except API rejections in the 4xx
    /// range. Everything else needs corrected input.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::Validation { .. } => false,
            Error::Selector { .. } => false,
            Error::Serialization { .. } => false,
        }
    }

    /// Declaration identity, if this error concerns one
    pub fn declaration(&self) -> Option<&str> {
        match self {
            Error::Validation { declaration, .. } => Some(declaration),
            _ => None,
        }
    }

    /// Field path, if the error points at one
    pub fn field(&self) -> Option<&str> {
        match self {
            Error::Validation { field, .. } => field.as_deref(),
            _ => None,
        }
    }

    /// Attach a declaration identity to an error that lacks one
    ///
    /// Selector errors found while validating a declaration become
    /// validation errors for that declaration.
    pub fn for_declaration(self, declaration: impl Into<String>, field: &str) -> Self {
        match self {
            Error::Validation {
                declaration: existing,
                message,
                field: existing_field,
            } if existing == UNKNOWN_CONTEXT => Error::Validation {
                declaration: declaration.into(),
                message,
                field: existing_field.or_else(|| Some(field.to_string())),
            },
            Error::Selector { selector, message } => Error::Validation {
                declaration: declaration.into(),
                message: format!("selector '{}': {}", selector, message),
                field: Some(field.to_string()),
            },
            other => other,
        }
    }
}
