//! Replication and change-notification types.
//!
//! These describe what the client asks of the document store
//! ([`ReplicationSpec`]) and what the store reports back
//! ([`ReplicationEvent`], [`ChangeEvent`]). The replication protocol itself
//! belongs to the store.

use std::collections::BTreeMap;
use std::fmt;

use crate::{DatabaseName, DocId};

/// Which way a replication moves documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Remote → local.
    Pull,
    /// Local → remote.
    Push,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Pull => f.write_str("pull"),
            Direction::Push => f.write_str("push"),
        }
    }
}

/// A database on the remote server.
///
/// Remote names are assigned by the server and are not validated locally.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteDatabase {
    /// Base URL of the server.
    pub server_url: String,
    /// Database name on the server.
    pub name: String,
}

impl RemoteDatabase {
    /// Create a remote database reference.
    pub fn new(server_url: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            name: name.into(),
        }
    }

    /// Full URL of the database.
    pub fn url(&self) -> String {
        format!("{}/{}", self.server_url.trim_end_matches('/'), self.name)
    }
}

/// A named server-side replication filter with parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplicationFilter {
    /// Filter name, as known to the server.
    pub name: String,
    /// Query parameters passed to the filter.
    pub params: BTreeMap<String, String>,
}

impl ReplicationFilter {
    /// Create a filter with no parameters.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: BTreeMap::new(),
        }
    }

    /// Add a parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Everything the store needs to start one replication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplicationSpec {
    /// Local side.
    pub local: DatabaseName,
    /// Remote side.
    pub remote: RemoteDatabase,
    /// Direction of travel.
    pub direction: Direction,
    /// Keep running after catching up.
    pub continuous: bool,
    /// Optional server-side filter.
    pub filter: Option<ReplicationFilter>,
}

impl ReplicationSpec {
    /// A continuous, unfiltered pull into `local`.
    pub fn pull(local: DatabaseName, remote: RemoteDatabase) -> Self {
        Self {
            local,
            remote,
            direction: Direction::Pull,
            continuous: true,
            filter: None,
        }
    }

    /// A continuous, unfiltered push from `local`.
    pub fn push(local: DatabaseName, remote: RemoteDatabase) -> Self {
        Self {
            local,
            remote,
            direction: Direction::Push,
            continuous: true,
            filter: None,
        }
    }

    /// Attach a filter.
    pub fn with_filter(mut self, filter: ReplicationFilter) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// Progress reported by a running replication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationEvent {
    /// The replication caught up with its source.
    ///
    /// Continuous replications may report this more than once.
    Completed,
    /// The replication stopped with an error.
    Failed {
        /// Error message from the store.
        message: String,
    },
}

/// A change to one document in a local database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// The database that changed.
    pub database: DatabaseName,
    /// The document that changed.
    pub doc_id: DocId,
    /// The document's `type` after the change (before it, for deletions).
    pub doc_type: Option<String>,
    /// Whether the document was deleted.
    pub deleted: bool,
}
