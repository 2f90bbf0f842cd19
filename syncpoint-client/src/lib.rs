//! # syncpoint-client
//!
//! Device-side client for Syncpoint pairing and channel provisioning.
//!
//! This is the library applications use to pair a device with a
//! Syncpoint-enabled server and keep channel databases replicated.
//!
//! ## Features
//!
//! - **Actor coordinator**: one task serializes authenticator callbacks,
//!   replication events and API calls
//! - **Pure state machine**: lifecycle decisions come from syncpoint-core
//! - **Store abstraction**: pluggable document store and replicator
//!   ([`MemoryStore`] and [`ServerSimulator`] for tests and demos)
//! - **Deferred installs**: channel installs requested before the session is
//!   ready are replayed in order once it is
//!
//! ## Example
//!
//! ```ignore
//! use syncpoint_client::{
//!     ClientConfig, InstallResult, MemoryStore, SyncpointClient, TokenAuthenticator,
//! };
//!
//! let client = SyncpointClient::start(ClientConfig::default(), MemoryStore::new()).await?;
//! client.authenticate(Arc::new(TokenAuthenticator::new(token)))?;
//!
//! // Deferred until the session is ready, then installed automatically
//! if let InstallResult::Deferred(pending) = client.install_channel_named("notes", None).await? {
//!     let installation = pending.wait().await?;
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod client;
pub mod config;
pub(crate) mod coordinator;
pub mod error;
pub(crate) mod replication;
pub mod session;
pub mod store;

pub use auth::{AuthResponder, Authenticator, MockAuthenticator, TokenAuthenticator};
pub use client::{ClientEvent, InstallResult, PendingInstall, SyncpointClient};
pub use config::{ClientConfig, ConfigError};
pub use error::ClientError;
pub use session::{ControlSession, ModelQuery, SessionInstall};
pub use store::{
    DocumentFilter, DocumentStore, MemoryStore, ReplicationHandle, ServerSimulator,
    SimulatorHandle, StoreError, SESSION_FILTER,
};
pub use syncpoint_core::{ClientState, OAuthToken};
