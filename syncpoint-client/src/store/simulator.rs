//! A stand-in for the Syncpoint server, driving a [`MemoryStore`].
//!
//! The simulator watches replication starts and control-database changes and
//! answers them the way the server would:
//! - every replication reports completion as soon as it starts
//! - once the session has been pushed with credentials, the session is
//!   activated (user id, `state`, control database) or rejected
//! - new channels are set up: `state` becomes `"ready"` and a cloud
//!   database is assigned

use serde_json::{json, Map, Value};
use syncpoint_core::{ChannelModel, ControlModel, SessionModel};
use syncpoint_types::{ChangeEvent, DatabaseName, Direction, DocId, ReplicationId, ReplicationSpec};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use super::MemoryStore;
use crate::config::{ClientConfig, ConfigError};

/// Name of the server-side filter the session pull uses.
pub const SESSION_FILTER: &str = "syncpoint/by_session";

/// Simulated server behaviour. Configure, then [`start`](Self::start).
#[derive(Debug, Clone)]
pub struct ServerSimulator {
    store: MemoryStore,
    control_database: DatabaseName,
    session_id: DocId,
    user_id: String,
    reject: Option<String>,
    set_up_channels: bool,
}

/// A running simulator. Dropping it stops the simulation.
#[derive(Debug)]
pub struct SimulatorHandle {
    task: JoinHandle<()>,
}

impl Drop for SimulatorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl ServerSimulator {
    /// Simulate the server for a client using `config` on `store`.
    pub fn new(store: MemoryStore, config: &ClientConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            store,
            control_database: config.control_database()?,
            session_id: config.session_doc_id(),
            user_id: "u1".to_string(),
            reject: None,
            set_up_channels: true,
        })
    }

    /// User id assigned on activation (default: u1).
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    /// Reject the session with `message` instead of activating it.
    pub fn rejecting(mut self, message: impl Into<String>) -> Self {
        self.reject = Some(message.into());
        self
    }

    /// Leave new channels in the `"new"` state.
    pub fn without_channel_setup(mut self) -> Self {
        self.set_up_channels = false;
        self
    }

    /// Start answering. Must be called inside a tokio runtime.
    pub fn start(self) -> SimulatorHandle {
        // Subscribe before spawning so nothing that happens after start() is missed
        let mut started = self.store.replication_starts();
        let mut changes = self.store.watch(&self.control_database);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = started.recv() => match result {
                        Ok((id, spec)) => self.on_replication_started(id, &spec),
                        Err(RecvError::Lagged(n)) => {
                            tracing::warn!("Simulator missed {} replication starts", n);
                        }
                        Err(RecvError::Closed) => break,
                    },
                    result = changes.recv() => match result {
                        Ok(change) => self.on_change(&change),
                        Err(RecvError::Lagged(n)) => {
                            tracing::warn!("Simulator missed {} changes", n);
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });

        SimulatorHandle { task }
    }

    fn on_replication_started(&self, id: ReplicationId, spec: &ReplicationSpec) {
        tracing::debug!(
            "Simulator: {} {} {} <-> {}",
            id,
            spec.direction,
            spec.local,
            spec.remote.url()
        );
        self.store.complete_replication(id);

        if spec.local == self.control_database && spec.direction == Direction::Push {
            self.answer_session();
        }
    }

    fn answer_session(&self) {
        let Some(doc) = self.store.document(&self.control_database, &self.session_id) else {
            return;
        };
        let session = match SessionModel::from_document(&doc) {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!("Simulator: unreadable session: {}", e);
                return;
            }
        };
        if !session.has_credentials() || session.user_id.is_some() || session.error.is_some() {
            return;
        }

        let mut fields = Map::new();
        match &self.reject {
            Some(message) => {
                fields.insert("error".into(), Value::String(message.clone()));
            }
            None => {
                fields.insert("user_id".into(), json!(self.user_id));
                fields.insert("state".into(), json!("active"));
                fields.insert(
                    "control_database".into(),
                    json!(format!("control-{}", self.user_id)),
                );
            }
        }
        if let Err(e) = self
            .store
            .merge_fields(&self.control_database, &self.session_id, fields)
        {
            tracing::warn!("Simulator: failed to answer session: {}", e);
        }
    }

    fn on_change(&self, change: &ChangeEvent) {
        if !self.set_up_channels || change.deleted {
            return;
        }
        if change.doc_type.as_deref() != Some(ChannelModel::DOC_TYPE) {
            return;
        }
        let Some(doc) = self.store.document(&self.control_database, &change.doc_id) else {
            return;
        };
        let Ok(channel) = ChannelModel::from_document(&doc) else {
            return;
        };
        if channel.is_ready() {
            return;
        }

        let mut fields = Map::new();
        fields.insert("state".into(), json!("ready"));
        fields.insert(
            "cloud_database".into(),
            json!(format!("channel-{}", channel.id)),
        );
        if let Err(e) = self
            .store
            .merge_fields(&self.control_database, &channel.id, fields)
        {
            tracing::warn!("Simulator: failed to set up channel {}: {}", channel.id, e);
        }
    }
}
