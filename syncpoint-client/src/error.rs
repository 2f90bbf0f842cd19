//! Client error type.

use syncpoint_core::{CredentialsError, DeferredError};
use syncpoint_types::{DocumentError, ErrorKind, ErrorReport};
use thiserror::Error;

use crate::config::ConfigError;
use crate::store::StoreError;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The authenticator failed or its token was unusable.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// A replication could not be started or failed while running.
    #[error("replication failed: {0}")]
    ReplicationFailed(String),

    /// The server rejected the session.
    #[error("server rejected session: {0}")]
    ServerRejected(String),

    /// Not allowed in the current state, or bad input.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Document store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A control document failed to decode.
    #[error("document error: {0}")]
    Document(#[from] DocumentError),

    /// Bad credentials from an authenticator.
    #[error("credentials error: {0}")]
    Credentials(#[from] CredentialsError),

    /// Too many install requests are waiting for the session.
    #[error("deferred request error: {0}")]
    Deferred(#[from] DeferredError),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// A deferred or channel-pending install failed.
    #[error("install failed: {0}")]
    Install(ErrorReport),

    /// The coordinator task has shut down.
    #[error("client stopped")]
    Stopped,
}

impl ClientError {
    /// The error category.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::AuthenticationFailed(_) | ClientError::Credentials(_) => {
                ErrorKind::AuthenticationFailed
            }
            ClientError::ReplicationFailed(_) => ErrorKind::ReplicationFailed,
            ClientError::ServerRejected(_) => ErrorKind::ServerRejected,
            ClientError::InvalidOperation(_)
            | ClientError::Deferred(_)
            | ClientError::Config(_)
            | ClientError::Stopped => ErrorKind::InvalidOperation,
            ClientError::Install(report) => report.kind,
            ClientError::Store(StoreError::ReplicationFailed(_)) => ErrorKind::ReplicationFailed,
            ClientError::Store(_) | ClientError::Document(_) => ErrorKind::StoreFailure,
        }
    }

    /// Cloneable summary for observers.
    pub fn report(&self) -> ErrorReport {
        ErrorReport::new(self.kind(), self.to_string())
    }
}
