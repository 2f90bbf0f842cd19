//! # syncpoint-core
//!
//! Pure logic for the Syncpoint client (no I/O, instant tests).
//!
//! This crate implements the pairing lifecycle state machine, the deferred
//! install queue, credential handling and the typed control-document models
//! without any store or network access.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about state transitions
//!
//! The actual I/O (document store, replication, authenticators) is performed
//! by `syncpoint-client`, which interprets the actions produced here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod credentials;
pub mod deferred;
pub mod model;
pub mod state;

pub use credentials::{CredentialsError, OAuthToken, MAX_TOKEN_LEN};
pub use deferred::{DeferredError, DeferredInstall, DeferredRequestQueue};
pub use model::{
    ChannelModel, ControlModel, InstallationModel, Model, SessionModel, SubscriptionModel,
    CHANNEL_TYPE, INSTALLATION_TYPE, SESSION_TYPE, SUBSCRIPTION_TYPE,
};
pub use state::{Action, ClientState, Event, SessionReadiness};
