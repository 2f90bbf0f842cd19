//! SyncpointClient - the main interface for Syncpoint pairing.
//!
//! This module provides [`SyncpointClient`], the handle applications use to
//! pair a device with a Syncpoint server and install channels.
//!
//! # Architecture
//!
//! The client is a thin handle around a coordinator task. Every public call
//! becomes a command in the coordinator's mailbox; the coordinator drives
//! the pure state machine from syncpoint-core and performs the I/O through
//! the [`DocumentStore`] and the [`Authenticator`].
//!
//! ```text
//! Application → SyncpointClient → mailbox → Coordinator → DocumentStore
//!                                               ↓
//!                                  syncpoint-core (pure state machine)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use syncpoint_client::{ClientConfig, MemoryStore, SyncpointClient, TokenAuthenticator};
//!
//! let client = SyncpointClient::start(ClientConfig::default(), MemoryStore::new()).await?;
//! client.authenticate(Arc::new(TokenAuthenticator::new(token)))?;
//! client.wait_for(ClientState::is_ready).await?;
//!
//! let result = client.install_channel_named("notes", None).await?;
//! ```

use std::sync::Arc;

use syncpoint_core::{ClientState, InstallationModel};
use syncpoint_types::{DatabaseName, DocId, ErrorReport, RequestId};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::auth::Authenticator;
use crate::config::ClientConfig;
use crate::coordinator::{Command, Coordinator, Outputs};
use crate::error::ClientError;
use crate::session::ControlSession;
use crate::store::DocumentStore;

/// Outcome of [`SyncpointClient::install_channel_named`].
#[derive(Debug)]
pub enum InstallResult {
    /// Installed now.
    Installed(InstallationModel),
    /// The session is not ready; the request will be replayed once it is.
    Deferred(PendingInstall),
    /// The channel is waiting for the server to set it up.
    ChannelPending(PendingInstall),
}

/// Handle to an install that finishes later.
///
/// Resolved exactly once, whether or not anyone listens to
/// [`SyncpointClient::events`]. The same result is also published as
/// [`ClientEvent::InstallCompleted`]. Dropping the handle does not cancel
/// the install.
#[derive(Debug)]
pub struct PendingInstall {
    request: RequestId,
    completion: oneshot::Receiver<Result<InstallationModel, ErrorReport>>,
}

impl PendingInstall {
    pub(crate) fn new(
        request: RequestId,
        completion: oneshot::Receiver<Result<InstallationModel, ErrorReport>>,
    ) -> Self {
        Self {
            request,
            completion,
        }
    }

    /// Id carried by the matching [`ClientEvent::InstallCompleted`].
    pub fn request_id(&self) -> RequestId {
        self.request
    }

    /// Wait for the install to finish.
    ///
    /// Fails with [`ClientError::Install`] if the install failed, or
    /// [`ClientError::Stopped`] if the client shut down first.
    pub async fn wait(self) -> Result<InstallationModel, ClientError> {
        match self.completion.await {
            Ok(result) => result.map_err(ClientError::Install),
            Err(_) => Err(ClientError::Stopped),
        }
    }
}

/// Notifications published by the client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The lifecycle state changed.
    StateChanged {
        /// Previous state.
        from: ClientState,
        /// New state.
        to: ClientState,
    },
    /// A session-level error was recorded.
    Error(ErrorReport),
    /// A deferred or channel-pending install finished.
    InstallCompleted {
        /// Id returned when the install was requested.
        request: RequestId,
        /// The installation, or why it failed.
        result: Result<InstallationModel, ErrorReport>,
    },
    /// An installation stopped replicating. Other installations and the
    /// session are unaffected.
    InstallationReplicationFailed {
        /// The installation.
        installation: DocId,
        /// What failed.
        message: String,
    },
}

/// Syncpoint pairing client.
///
/// Dropping the client stops its coordinator.
pub struct SyncpointClient<S: DocumentStore> {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ClientState>,
    events: broadcast::Sender<ClientEvent>,
    session: ControlSession<S>,
    task: Option<JoinHandle<()>>,
}

impl<S: DocumentStore> SyncpointClient<S> {
    /// Start a client on `store`.
    ///
    /// If the control database already holds a session with credentials,
    /// the client resumes from it; otherwise it starts `Unauthenticated`.
    pub async fn start(config: ClientConfig, store: S) -> Result<Self, ClientError> {
        config.validate()?;
        let control_db = config.control_database()?;
        let store = Arc::new(store);
        store.create_database(&control_db).await?;
        let changes = store.changes(&control_db).await?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ClientState::new());
        let (events_tx, _) = broadcast::channel(config.event_capacity);
        let max_deferred_requests = config.max_deferred_requests;
        let server_url = config.server_url.clone();

        let session = ControlSession::new(
            Arc::clone(&store),
            Arc::new(config),
            control_db,
            commands_tx.clone(),
        );
        let mut coordinator = Coordinator::new(
            store,
            session.clone(),
            max_deferred_requests,
            commands_tx.clone(),
            Outputs {
                state: state_tx,
                events: events_tx.clone(),
            },
        );
        coordinator.watch_changes(changes);
        coordinator.restore().await?;
        let task = tokio::spawn(coordinator.run(commands_rx));

        tracing::info!(
            "Syncpoint client started (server {}, state {})",
            server_url,
            *state_rx.borrow()
        );
        Ok(Self {
            commands: commands_tx,
            state: state_rx,
            events: events_tx,
            session,
            task: Some(task),
        })
    }

    fn send(&self, command: Command) -> Result<(), ClientError> {
        self.commands.send(command).map_err(|_| ClientError::Stopped)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.send(command(tx))?;
        rx.await.map_err(|_| ClientError::Stopped)
    }

    /// Begin pairing with `authenticator`.
    ///
    /// Only acts in `Unauthenticated` or `HasError`; ignored otherwise.
    /// Returns immediately; follow progress through [`state_changes`](Self::state_changes)
    /// or [`events`](Self::events).
    pub fn authenticate(&self, authenticator: Arc<dyn Authenticator>) -> Result<(), ClientError> {
        self.send(Command::Authenticate { authenticator })
    }

    /// Find or create the channel `name`, subscribe, and install it into
    /// `local_database` (a generated name if `None`).
    ///
    /// Before the session is ready the request is deferred; in `HasError` it
    /// fails with `InvalidOperation`.
    pub async fn install_channel_named(
        &self,
        name: &str,
        local_database: Option<DatabaseName>,
    ) -> Result<InstallResult, ClientError> {
        self.request(|reply| Command::InstallChannel {
            name: name.to_string(),
            local_database,
            reply,
        })
        .await?
    }

    /// Forget the pairing: stop all replications, delete the control
    /// documents, drop pending installs and reset the authenticator.
    ///
    /// Local channel databases are kept.
    pub async fn remove_pairing(&self) -> Result<(), ClientError> {
        self.request(|reply| Command::RemovePairing { reply }).await
    }

    /// Pass a platform URL (an OAuth redirect) to the current authenticator.
    pub async fn handle_open_url(&self, url: &str) -> Result<bool, ClientError> {
        self.request(|reply| Command::HandleOpenUrl {
            url: url.to_string(),
            reply,
        })
        .await
    }

    /// Current state.
    pub fn state(&self) -> ClientState {
        self.state.borrow().clone()
    }

    /// Watch state changes.
    pub fn state_changes(&self) -> watch::Receiver<ClientState> {
        self.state.clone()
    }

    /// Subscribe to client events from now on.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Wait until the state satisfies `predicate` (checked immediately too).
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&ClientState) -> bool,
    ) -> Result<ClientState, ClientError> {
        let mut state = self.state.clone();
        let result = state
            .wait_for(predicate)
            .await
            .map(|current| current.clone())
            .map_err(|_| ClientError::Stopped);
        result
    }

    /// Channel, subscription and installation operations.
    pub fn session(&self) -> &ControlSession<S> {
        &self.session
    }

    /// Stop the coordinator and wait for it to finish. Running replications
    /// are stopped.
    pub async fn shutdown(mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!("Coordinator task failed: {}", e);
            }
        }
    }
}

impl<S: DocumentStore> Drop for SyncpointClient<S> {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.commands.send(Command::Shutdown);
        }
    }
}
