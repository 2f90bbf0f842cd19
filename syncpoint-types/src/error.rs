//! Error types for Syncpoint.

use std::fmt;
use thiserror::Error;

use crate::DocId;

/// Errors raised while mapping documents to typed values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentError {
    /// The document's `type` discriminator is missing or not the expected one.
    #[error("document {id} has type {actual:?}, expected {expected:?}")]
    WrongType {
        /// The offending document.
        id: DocId,
        /// The discriminator the caller asked for.
        expected: &'static str,
        /// The discriminator actually present.
        actual: Option<String>,
    },

    /// A required field is missing or has the wrong shape.
    #[error("document {id} is malformed: {reason}")]
    Malformed {
        /// The offending document.
        id: DocId,
        /// What failed to decode.
        reason: String,
    },

    /// A database name does not follow the store's naming rules.
    #[error("invalid database name {name:?}: {reason}")]
    InvalidDatabaseName {
        /// The rejected name.
        name: String,
        /// Which rule it broke.
        reason: &'static str,
    },
}

/// The five error categories every Syncpoint error falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The authenticator could not produce a token.
    AuthenticationFailed,
    /// A pull or push replication could not be set up or failed while running.
    ReplicationFailed,
    /// The server wrote an `error` field into the session document.
    ServerRejected,
    /// The operation is not allowed in the current state or its input is bad.
    InvalidOperation,
    /// The underlying document store failed, or a document was malformed.
    StoreFailure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::AuthenticationFailed => "authentication failed",
            ErrorKind::ReplicationFailed => "replication failed",
            ErrorKind::ServerRejected => "server rejected",
            ErrorKind::InvalidOperation => "invalid operation",
            ErrorKind::StoreFailure => "store failure",
        };
        f.write_str(name)
    }
}

/// A cloneable error summary (kind plus message) for observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    /// Error category.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl ErrorReport {
    /// Create a report.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ErrorReport {}
