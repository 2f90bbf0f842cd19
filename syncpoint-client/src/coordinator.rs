//! The coordinator task.
//!
//! One tokio task owns every piece of mutable client state and processes
//! [`Command`]s from a single mailbox in order. Authenticator callbacks,
//! replication events, document changes and public API calls all arrive as
//! commands, so state transitions are strictly serialized.
//!
//! Lifecycle decisions come from the pure state machine in syncpoint-core;
//! this module executes the resulting actions.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use syncpoint_core::{
    Action, ClientState, ControlModel, DeferredInstall, DeferredRequestQueue, Event,
    InstallationModel, OAuthToken, SessionModel, CHANNEL_TYPE, INSTALLATION_TYPE,
};
use syncpoint_types::{
    ChangeEvent, DatabaseName, Direction, DocId, ErrorKind, ErrorReport, ReplicationEvent,
    ReplicationId, RequestId,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::auth::{AuthResponder, Authenticator};
use crate::client::{ClientEvent, InstallResult, PendingInstall};
use crate::error::ClientError;
use crate::replication::{ReplicationTarget, RunningReplication};
use crate::session::{ControlSession, SessionInstall};
use crate::store::DocumentStore;

/// Mailbox messages for the coordinator.
pub(crate) enum Command {
    /// Start pairing with this authenticator.
    Authenticate {
        authenticator: Arc<dyn Authenticator>,
    },
    /// Outcome of a pairing attempt.
    AuthResult {
        attempt: u64,
        result: Result<OAuthToken, String>,
    },
    InstallChannel {
        name: String,
        local_database: Option<DatabaseName>,
        reply: oneshot::Sender<Result<InstallResult, ClientError>>,
    },
    RemovePairing {
        reply: oneshot::Sender<()>,
    },
    HandleOpenUrl {
        url: String,
        reply: oneshot::Sender<bool>,
    },
    /// Event from a running replication.
    Replication {
        id: ReplicationId,
        direction: Direction,
        target: ReplicationTarget,
        event: ReplicationEvent,
    },
    /// A control document changed.
    DocumentChanged(ChangeEvent),
    /// Change notifications were lost; re-read everything.
    Resync,
    Shutdown,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Authenticate { authenticator } => f
                .debug_struct("Authenticate")
                .field("auth_doc_type", &authenticator.auth_doc_type())
                .finish(),
            Command::AuthResult { attempt, result } => f
                .debug_struct("AuthResult")
                .field("attempt", attempt)
                .field("result", result)
                .finish(),
            Command::InstallChannel {
                name,
                local_database,
                ..
            } => f
                .debug_struct("InstallChannel")
                .field("name", name)
                .field("local_database", local_database)
                .finish(),
            Command::RemovePairing { .. } => f.write_str("RemovePairing"),
            Command::HandleOpenUrl { url, .. } => {
                f.debug_struct("HandleOpenUrl").field("url", url).finish()
            }
            Command::Replication {
                id,
                direction,
                target,
                event,
            } => f
                .debug_struct("Replication")
                .field("id", id)
                .field("direction", direction)
                .field("target", target)
                .field("event", event)
                .finish(),
            Command::DocumentChanged(change) => {
                f.debug_tuple("DocumentChanged").field(change).finish()
            }
            Command::Resync => f.write_str("Resync"),
            Command::Shutdown => f.write_str("Shutdown"),
        }
    }
}

type CompletionSender = oneshot::Sender<Result<InstallationModel, ErrorReport>>;

/// An install waiting for its channel to be set up by the server.
#[derive(Debug)]
struct AwaitingChannel {
    request_id: RequestId,
    channel_id: DocId,
    local_database: Option<DatabaseName>,
}

/// Channels the coordinator publishes on.
pub(crate) struct Outputs {
    pub(crate) state: watch::Sender<ClientState>,
    pub(crate) events: broadcast::Sender<ClientEvent>,
}

pub(crate) struct Coordinator<S: DocumentStore> {
    store: Arc<S>,
    session: ControlSession<S>,
    state: ClientState,
    attempt: u64,
    authenticator: Option<Arc<dyn Authenticator>>,
    deferred: DeferredRequestQueue,
    channel_pending: Vec<AwaitingChannel>,
    /// One entry per deferred or channel-pending request until it completes.
    completions: HashMap<RequestId, CompletionSender>,
    session_pull: Option<RunningReplication>,
    session_push: Option<RunningReplication>,
    change_forwarder: Option<JoinHandle<()>>,
    commands: mpsc::UnboundedSender<Command>,
    outputs: Outputs,
}

impl<S: DocumentStore> Coordinator<S> {
    pub(crate) fn new(
        store: Arc<S>,
        session: ControlSession<S>,
        max_deferred_requests: usize,
        commands: mpsc::UnboundedSender<Command>,
        outputs: Outputs,
    ) -> Self {
        Self {
            store,
            session,
            state: ClientState::new(),
            attempt: 0,
            authenticator: None,
            deferred: DeferredRequestQueue::new(max_deferred_requests),
            channel_pending: Vec::new(),
            completions: HashMap::new(),
            session_pull: None,
            session_push: None,
            change_forwarder: None,
            commands,
            outputs,
        }
    }

    /// Forward control-database changes into the mailbox.
    pub(crate) fn watch_changes(&mut self, mut changes: broadcast::Receiver<ChangeEvent>) {
        let commands = self.commands.clone();
        self.change_forwarder = Some(tokio::spawn(async move {
            loop {
                let command = match changes.recv().await {
                    Ok(change) => Command::DocumentChanged(change),
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!("Missed {} control database changes, resyncing", n);
                        Command::Resync
                    }
                    Err(RecvError::Closed) => break,
                };
                if commands.send(command).is_err() {
                    break;
                }
            }
        }));
    }

    /// Re-enter the lifecycle from a stored session, if there is one.
    ///
    /// An unreadable session starts unauthenticated; the next pairing
    /// overwrites it.
    pub(crate) async fn restore(&mut self) -> Result<(), ClientError> {
        let session = match self.session.session_model().await {
            Ok(Some(session)) => session,
            Ok(None) => {
                tracing::debug!("No stored session");
                return Ok(());
            }
            Err(ClientError::Document(e)) => {
                tracing::warn!("Stored session is unreadable, not restoring: {}", e);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if !session.has_credentials() {
            tracing::debug!("Stored session has no credentials");
            return Ok(());
        }
        let readiness = session.readiness();
        tracing::info!("Restoring session {} ({:?})", session.id, readiness);
        self.apply(Event::SessionRestored { readiness }).await;
        Ok(())
    }

    /// Process commands until shutdown.
    pub(crate) async fn run(mut self, mut mailbox: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = mailbox.recv().await {
            if !self.handle(command).await {
                break;
            }
        }
        self.shutdown().await;
        tracing::debug!("Coordinator stopped");
    }

    async fn shutdown(&mut self) {
        if let Some(forwarder) = self.change_forwarder.take() {
            forwarder.abort();
        }
        self.stop_session_replications().await;
        self.session.stop_all_installation_replications().await;
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Returns false once the coordinator should stop.
    async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Authenticate { authenticator } => {
                if matches!(
                    self.state,
                    ClientState::Unauthenticated | ClientState::HasError { .. }
                ) {
                    self.attempt += 1;
                    self.authenticator = Some(authenticator);
                    self.apply(Event::AuthenticateRequested {
                        attempt: self.attempt,
                    })
                    .await;
                } else {
                    tracing::debug!("Ignoring authenticate in {}", self.state);
                }
            }
            Command::AuthResult { attempt, result } => {
                let event = match result {
                    Ok(token) => Event::Authenticated { attempt, token },
                    Err(error) => Event::AuthenticationFailed { attempt, error },
                };
                self.apply(event).await;
            }
            Command::InstallChannel {
                name,
                local_database,
                reply,
            } => {
                let result = self.install_channel(name, local_database).await;
                let _ = reply.send(result);
            }
            Command::RemovePairing { reply } => {
                tracing::info!("Removing pairing");
                self.apply(Event::RemovePairingRequested).await;
                let _ = reply.send(());
            }
            Command::HandleOpenUrl { url, reply } => {
                let handled = self
                    .authenticator
                    .as_ref()
                    .map_or(false, |auth| auth.handle_open_url(&url));
                let _ = reply.send(handled);
            }
            Command::Replication {
                id,
                direction,
                target,
                event,
            } => match target {
                ReplicationTarget::Session => {
                    self.on_session_replication(id, direction, event).await
                }
                ReplicationTarget::Installation(installation) => {
                    self.on_installation_replication(installation, id, direction, event)
                        .await
                }
            },
            Command::DocumentChanged(change) => self.on_document_changed(change).await,
            Command::Resync => {
                self.recheck_session().await;
                self.complete_pending_channels().await;
            }
            Command::Shutdown => return false,
        }
        true
    }

    async fn install_channel(
        &mut self,
        name: String,
        local_database: Option<DatabaseName>,
    ) -> Result<InstallResult, ClientError> {
        if name.is_empty() {
            return Err(ClientError::InvalidOperation(
                "channel name is empty".to_string(),
            ));
        }
        match &self.state {
            ClientState::Ready => match self.session.install_channel_named(&name, local_database.clone()).await? {
                SessionInstall::Installed(installation) => Ok(InstallResult::Installed(installation)),
                SessionInstall::ChannelPending(channel) => {
                    let request_id = RequestId::new();
                    tracing::info!("Install of {:?} waits for channel {}", name, channel.id);
                    self.channel_pending.push(AwaitingChannel {
                        request_id,
                        channel_id: channel.id,
                        local_database,
                    });
                    Ok(InstallResult::ChannelPending(self.track(request_id)))
                }
            },
            ClientState::HasError { error } => Err(ClientError::InvalidOperation(format!(
                "client has an error ({}); authenticate again",
                error
            ))),
            state => {
                let request_id = self
                    .deferred
                    .enqueue(DeferredInstall::new(name.as_str(), local_database))?;
                tracing::info!("Deferred install of {:?} in {} ({})", name, state, request_id);
                Ok(InstallResult::Deferred(self.track(request_id)))
            }
        }
    }

    async fn on_session_replication(
        &mut self,
        id: ReplicationId,
        direction: Direction,
        event: ReplicationEvent,
    ) {
        let current = match direction {
            Direction::Pull => self.session_pull.as_ref(),
            Direction::Push => self.session_push.as_ref(),
        };
        if current.map(|r| r.id) != Some(id) {
            tracing::debug!("Ignoring event from stale session replication {}", id);
            return;
        }

        let event = match event {
            ReplicationEvent::Completed => match direction {
                Direction::Pull => Event::PullCompleted,
                Direction::Push => Event::PushCompleted,
            },
            ReplicationEvent::Failed { message } => {
                // The store has already dropped it
                let failed = match direction {
                    Direction::Pull => self.session_pull.take(),
                    Direction::Push => self.session_push.take(),
                };
                if let Some(failed) = failed {
                    failed.stop(&*self.store).await;
                }
                Event::ReplicationFailed {
                    direction,
                    error: message,
                }
            }
        };
        self.apply(event).await;
    }

    async fn on_installation_replication(
        &mut self,
        installation: DocId,
        id: ReplicationId,
        direction: Direction,
        event: ReplicationEvent,
    ) {
        if !self.session.replications().owns(&installation, id) {
            tracing::debug!("Ignoring event from stale replication {}", id);
            return;
        }
        match event {
            ReplicationEvent::Completed => {
                tracing::debug!("Installation {} {} caught up", installation, direction);
            }
            ReplicationEvent::Failed { message } => {
                tracing::warn!(
                    "Installation {} {} replication failed: {}",
                    installation,
                    direction,
                    message
                );
                self.session.stop_installation_replication(&installation).await;
                self.emit(ClientEvent::InstallationReplicationFailed {
                    installation,
                    message: format!("{} failed: {}", direction, message),
                });
            }
        }
    }

    async fn on_document_changed(&mut self, change: ChangeEvent) {
        if &change.doc_id == self.session.session_id() {
            if !change.deleted {
                self.recheck_session().await;
            }
            return;
        }
        match change.doc_type.as_deref() {
            // A deleted channel fails the installs waiting on it
            Some(CHANNEL_TYPE) => self.complete_pending_channels().await,
            Some(INSTALLATION_TYPE) if change.deleted => {
                self.session.stop_installation_replication(&change.doc_id).await;
            }
            _ => {}
        }
    }

    async fn recheck_session(&mut self) {
        if self.state.is_pairing() || self.state.is_ready() {
            if let Some(event) = self.check_session().await {
                self.apply(event).await;
            }
        }
    }

    // =========================================================================
    // State machine
    // =========================================================================

    /// Feed an event to the state machine and execute what it asks for.
    ///
    /// An action that produces a follow-up event ends its batch; the
    /// follow-up is applied next.
    async fn apply(&mut self, event: Event) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            let from = std::mem::take(&mut self.state);
            let (to, actions) = from.clone().on_event(event);
            self.set_state(from, to);

            for action in actions {
                if let Some(next) = self.execute(action).await {
                    queue.push_back(next);
                    break;
                }
            }
        }
    }

    fn set_state(&mut self, from: ClientState, to: ClientState) {
        if from != to {
            self.outputs.state.send_replace(to.clone());
            if from.name() != to.name() {
                tracing::info!("State {} -> {}", from, to);
                self.emit(ClientEvent::StateChanged {
                    from,
                    to: to.clone(),
                });
            }
        }
        self.state = to;
    }

    async fn execute(&mut self, action: Action) -> Option<Event> {
        match action {
            Action::BeginAuthentication { attempt } => self.begin_authentication(attempt),
            Action::SaveCredentials { token } => match self.save_credentials(token).await {
                Ok(()) => None,
                Err(e) => Some(Event::StoreFailed {
                    error: e.to_string(),
                }),
            },
            Action::StartSessionPull => self.start_session_replication(Direction::Pull).await,
            Action::StartSessionPush => self.start_session_replication(Direction::Push).await,
            Action::StopSessionReplications => {
                self.stop_session_replications().await;
                None
            }
            Action::CheckSession => self.check_session().await,
            Action::ReplayDeferred => {
                self.replay_deferred().await;
                None
            }
            Action::SyncInstallations => {
                self.sync_installations().await;
                None
            }
            Action::ClearPairing => {
                self.clear_pairing().await;
                None
            }
            Action::EmitError(report) => {
                tracing::error!("{}", report);
                self.emit(ClientEvent::Error(report));
                None
            }
        }
    }

    fn begin_authentication(&mut self, attempt: u64) -> Option<Event> {
        let Some(authenticator) = self.authenticator.clone() else {
            return Some(Event::AuthenticationFailed {
                attempt,
                error: "no authenticator".to_string(),
            });
        };
        if let Some(token) = authenticator.validate_token() {
            tracing::info!("Using stored {} token (attempt {})", token.token_type(), attempt);
            return Some(Event::Authenticated { attempt, token });
        }
        tracing::info!(
            "Starting {} pairing (attempt {})",
            authenticator.auth_doc_type(),
            attempt
        );
        authenticator.initiate_pairing(AuthResponder::new(attempt, self.commands.clone()));
        None
    }

    async fn save_credentials(&mut self, token: OAuthToken) -> Result<(), ClientError> {
        let auth_type = self
            .authenticator
            .as_ref()
            .map_or("session", |auth| auth.auth_doc_type())
            .to_string();
        let mut session = match self.session.session_model().await {
            Ok(Some(session)) => session,
            Ok(None) => SessionModel::new(self.session.session_id().clone(), auth_type.as_str()),
            Err(ClientError::Document(e)) => {
                tracing::warn!("Replacing unreadable session: {}", e);
                SessionModel::new(self.session.session_id().clone(), auth_type.as_str())
            }
            Err(e) => return Err(e),
        };
        session.set_credentials(auth_type, token);
        self.store
            .put(self.session.control_database(), session.to_document()?)
            .await?;
        tracing::debug!("Saved credentials to session {}", session.id);
        Ok(())
    }

    async fn start_session_replication(&mut self, direction: Direction) -> Option<Event> {
        match self.session.start_session_replication(direction).await {
            Ok(running) => {
                let previous = match direction {
                    Direction::Pull => self.session_pull.replace(running),
                    Direction::Push => self.session_push.replace(running),
                };
                if let Some(previous) = previous {
                    previous.stop(&*self.store).await;
                }
                None
            }
            Err(e) => Some(Event::ReplicationFailed {
                direction,
                error: e.to_string(),
            }),
        }
    }

    async fn stop_session_replications(&mut self) {
        for running in [self.session_pull.take(), self.session_push.take()]
            .into_iter()
            .flatten()
        {
            running.stop(&*self.store).await;
        }
    }

    async fn check_session(&self) -> Option<Event> {
        match self.session.session_model().await {
            Ok(Some(session)) => Some(Event::SessionChanged {
                readiness: session.readiness(),
            }),
            Ok(None) => Some(Event::StoreFailed {
                error: "session document is missing".to_string(),
            }),
            Err(e) => Some(Event::StoreFailed {
                error: e.to_string(),
            }),
        }
    }

    async fn replay_deferred(&mut self) {
        let requests = self.deferred.drain();
        if !requests.is_empty() {
            tracing::info!("Replaying {} deferred installs", requests.len());
        }
        for request in requests {
            let result = self
                .session
                .install_channel_named(&request.channel_name, request.local_database.clone())
                .await;
            match result {
                Ok(SessionInstall::Installed(installation)) => {
                    self.complete(request.request_id, Ok(installation));
                }
                Ok(SessionInstall::ChannelPending(channel)) => {
                    self.channel_pending.push(AwaitingChannel {
                        request_id: request.request_id,
                        channel_id: channel.id,
                        local_database: request.local_database,
                    });
                }
                Err(e) => {
                    tracing::warn!("Deferred install of {:?} failed: {}", request.channel_name, e);
                    self.complete(request.request_id, Err(e.report()));
                }
            }
        }
    }

    async fn sync_installations(&mut self) {
        match self.session.sync_installations().await {
            Ok(failures) => {
                for (installation, error) in failures {
                    tracing::warn!("Installation {} did not start: {}", installation, error);
                    self.emit(ClientEvent::InstallationReplicationFailed {
                        installation,
                        message: error.to_string(),
                    });
                }
            }
            Err(e) => {
                tracing::warn!("Failed to sync installations: {}", e);
                self.emit(ClientEvent::Error(e.report()));
            }
        }
        self.complete_pending_channels().await;
    }

    /// Finish installs whose channel has become ready.
    async fn complete_pending_channels(&mut self) {
        if self.channel_pending.is_empty() || !self.state.is_ready() {
            return;
        }
        for pending in std::mem::take(&mut self.channel_pending) {
            let channel = match self.session.channel(&pending.channel_id).await {
                Ok(Some(channel)) => channel,
                Ok(None) => {
                    tracing::warn!("Channel {} was deleted before it was set up", pending.channel_id);
                    self.complete(
                        pending.request_id,
                        Err(ErrorReport::new(
                            ErrorKind::InvalidOperation,
                            format!("channel {} was deleted", pending.channel_id),
                        )),
                    );
                    continue;
                }
                Err(e) => {
                    self.complete(pending.request_id, Err(e.report()));
                    continue;
                }
            };
            if !channel.is_ready() {
                self.channel_pending.push(pending);
                continue;
            }
            let result = self
                .session
                .install_channel(&channel, pending.local_database)
                .await
                .map_err(|e| e.report());
            if let Err(report) = &result {
                tracing::warn!("Install of channel {} failed: {}", channel.id, report);
            }
            self.complete(pending.request_id, result);
        }
    }

    async fn clear_pairing(&mut self) {
        self.session.stop_all_installation_replications().await;
        match self.session.clear_control_documents().await {
            Ok(count) => tracing::info!("Deleted {} control documents", count),
            Err(e) => {
                tracing::warn!("Failed to delete control documents: {}", e);
                self.emit(ClientEvent::Error(e.report()));
            }
        }

        let dropped: Vec<RequestId> = self
            .deferred
            .drain()
            .into_iter()
            .map(|r| r.request_id)
            .chain(self.channel_pending.drain(..).map(|p| p.request_id))
            .collect();
        for request in dropped {
            self.complete(
                request,
                Err(ErrorReport::new(ErrorKind::InvalidOperation, "pairing removed")),
            );
        }

        if let Some(authenticator) = self.authenticator.take() {
            authenticator.remove_pairing();
        }
    }

    /// Hand out the completion handle for a deferred or pending request.
    fn track(&mut self, request: RequestId) -> PendingInstall {
        let (tx, rx) = oneshot::channel();
        self.completions.insert(request, tx);
        PendingInstall::new(request, rx)
    }

    /// Resolve a request's handle and publish the result.
    fn complete(&mut self, request: RequestId, result: Result<InstallationModel, ErrorReport>) {
        match self.completions.remove(&request) {
            // The caller may have dropped the handle
            Some(completion) => {
                let _ = completion.send(result.clone());
            }
            None => tracing::warn!("Install request {} completed twice", request),
        }
        self.emit(ClientEvent::InstallCompleted { request, result });
    }

    fn emit(&self, event: ClientEvent) {
        // No subscribers is fine
        let _ = self.outputs.events.send(event);
    }
}
