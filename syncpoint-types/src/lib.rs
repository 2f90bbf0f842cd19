//! # syncpoint-types
//!
//! Foundational types shared by all Syncpoint crates:
//! - [`DocId`], [`DatabaseName`], [`RequestId`], [`ReplicationId`] - identifiers
//! - [`Document`] - a flat, `type`-discriminated document as the store holds it
//! - [`ReplicationSpec`], [`ReplicationEvent`], [`ChangeEvent`] - what the
//!   document store reports back to the client
//! - [`DocumentError`], [`ErrorKind`], [`ErrorReport`] - error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod document;
mod error;
mod ids;
mod replication;

pub use document::{Document, TYPE_FIELD};
pub use error::{DocumentError, ErrorKind, ErrorReport};
pub use ids::{DatabaseName, DocId, ReplicationId, RequestId};
pub use replication::{
    ChangeEvent, Direction, RemoteDatabase, ReplicationEvent, ReplicationFilter, ReplicationSpec,
};
