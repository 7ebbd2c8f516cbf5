//! Storage error taxonomy
//!
//! Every fault surfaced by the core is one of these kinds. Provider
//! collaborators report `anyhow::Error` at the port boundary; the core maps
//! those into a kind here and keeps the original message as context.

use std::fmt::Display;

use thiserror::Error;

/// Errors raised by container operations, tree building and transfers
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The provider could not be reached to determine whether a container exists
    #[error("Cannot determine existence of {0}")]
    AccessFailure(String),

    /// The destination already holds a container of the same name and kind
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// A provider-side operation failed
    #[error("{action} failed: {message}")]
    OperationFailure {
        /// What was being attempted (e.g. `copy`, `build tree`)
        action: String,
        /// Provider message, preserved verbatim
        message: String,
    },

    /// A folder or file could not be created
    #[error("Creation failed: {0}")]
    CreationFailure(String),

    /// An upload or download was rejected before or during queueing
    #[error("Transfer failed: {0}")]
    TransferFailure(String),

    /// The provider rejected credentials while the context was being built
    #[error("Authorisation failed: {0}")]
    AuthorisationFailure(String),

    /// A container the call depends on is missing (no parent, no handle)
    #[error("Not found: {0}")]
    NotFound(String),

    /// A container name is empty or contains a path separator
    #[error("Invalid name: {0}")]
    InvalidName(String),
}

impl StorageError {
    /// Wraps a provider error as an [`StorageError::OperationFailure`]
    pub fn operation(action: impl Display, err: &anyhow::Error) -> Self {
        StorageError::OperationFailure {
            action: action.to_string(),
            message: format!("{err:#}"),
        }
    }

    /// Returns true for the destination-conflict kind
    pub fn is_already_exists(&self) -> bool {
        matches!(self, StorageError::AlreadyExists(_))
    }
}
