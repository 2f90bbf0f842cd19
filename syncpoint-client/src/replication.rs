//! Running replications and the tasks that forward their events.
//!
//! Every replication the client starts gets a forwarder task that turns its
//! event stream into coordinator commands. Stopping a replication aborts the
//! forwarder before asking the store to stop, so no events leak from a
//! replication the client has let go of.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use syncpoint_types::{Direction, DocId, ReplicationId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::coordinator::Command;
use crate::store::{DocumentStore, ReplicationHandle, StoreError};

/// What a replication belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ReplicationTarget {
    /// One of the two session replications.
    Session,
    /// One of an installation's two replications.
    Installation(DocId),
}

/// A replication the client started, with its forwarder.
#[derive(Debug)]
pub(crate) struct RunningReplication {
    pub(crate) id: ReplicationId,
    pub(crate) direction: Direction,
    forwarder: JoinHandle<()>,
}

impl RunningReplication {
    /// Spawn the forwarder for a freshly started replication.
    pub(crate) fn spawn(
        handle: ReplicationHandle,
        direction: Direction,
        target: ReplicationTarget,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        let ReplicationHandle { id, mut events } = handle;
        let forwarder = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let command = Command::Replication {
                    id,
                    direction,
                    target: target.clone(),
                    event,
                };
                if commands.send(command).is_err() {
                    break;
                }
            }
        });

        Self {
            id,
            direction,
            forwarder,
        }
    }

    /// Abort the forwarder and stop the replication in the store.
    ///
    /// A replication the store no longer knows (it failed on its own) is
    /// not an error.
    pub(crate) async fn stop<S: DocumentStore>(self, store: &S) {
        self.forwarder.abort();
        match store.stop_replication(self.id).await {
            Ok(()) => tracing::debug!("Stopped {} replication {}", self.direction, self.id),
            Err(StoreError::UnknownReplication(_)) => {}
            Err(e) => tracing::warn!("Failed to stop replication {}: {}", self.id, e),
        }
    }
}

/// Replications of local installations, keyed by installation id.
///
/// Shared between the coordinator and every [`ControlSession`](crate::ControlSession)
/// handle.
#[derive(Debug, Clone, Default)]
pub(crate) struct InstallationReplications {
    inner: Arc<Mutex<HashMap<DocId, Vec<RunningReplication>>>>,
}

impl InstallationReplications {
    fn lock(&self) -> MutexGuard<'_, HashMap<DocId, Vec<RunningReplication>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_running(&self, installation: &DocId) -> bool {
        self.lock().contains_key(installation)
    }

    /// Whether `replication` is one of `installation`'s current replications.
    pub(crate) fn owns(&self, installation: &DocId, replication: ReplicationId) -> bool {
        self.lock()
            .get(installation)
            .map_or(false, |running| running.iter().any(|r| r.id == replication))
    }

    /// Register replications; if some are already registered for this
    /// installation, the new ones are handed back to be stopped.
    pub(crate) fn insert(
        &self,
        installation: DocId,
        replications: Vec<RunningReplication>,
    ) -> Option<Vec<RunningReplication>> {
        let mut inner = self.lock();
        if inner.contains_key(&installation) {
            return Some(replications);
        }
        inner.insert(installation, replications);
        None
    }

    pub(crate) fn remove(&self, installation: &DocId) -> Option<Vec<RunningReplication>> {
        self.lock().remove(installation)
    }

    pub(crate) fn take_all(&self) -> Vec<RunningReplication> {
        self.lock().drain().flat_map(|(_, running)| running).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}
