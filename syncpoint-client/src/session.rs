//! Channel, subscription and installation operations.
//!
//! [`ControlSession`] reads and writes the control documents in the local
//! control database. Changes reach the server through the session's push
//! replication; server-side updates (a channel becoming ready, a session
//! activating) arrive through the pull.
//!
//! Writes are serialized: every clone shares one write lock, held for the
//! whole of a find-or-create, so concurrent callers (the application and
//! the coordinator replaying installs) never create duplicates.

use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;

use syncpoint_core::{
    ChannelModel, ControlModel, InstallationModel, SessionModel, SubscriptionModel,
    CHANNEL_TYPE, INSTALLATION_TYPE, SESSION_TYPE, SUBSCRIPTION_TYPE,
};
use syncpoint_types::{
    DatabaseName, Direction, DocId, Document, RemoteDatabase, ReplicationFilter, ReplicationSpec,
};
use tokio::sync::{mpsc, Mutex};

use crate::config::ClientConfig;
use crate::coordinator::Command;
use crate::error::ClientError;
use crate::replication::{InstallationReplications, ReplicationTarget, RunningReplication};
use crate::store::{DocumentStore, SESSION_FILTER};

/// Result of a session-level install.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionInstall {
    /// The channel is installed locally.
    Installed(InstallationModel),
    /// The channel exists and is subscribed, but the server has not set it
    /// up yet.
    ChannelPending(ChannelModel),
}

/// Handle for channel operations on the local control database.
///
/// Cheap to clone; every clone works on the same store and shares one
/// write lock.
#[derive(Debug)]
pub struct ControlSession<S> {
    store: Arc<S>,
    config: Arc<ClientConfig>,
    control_db: DatabaseName,
    session_id: DocId,
    replications: InstallationReplications,
    commands: mpsc::UnboundedSender<Command>,
    writes: Arc<Mutex<()>>,
}

impl<S> Clone for ControlSession<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: Arc::clone(&self.config),
            control_db: self.control_db.clone(),
            session_id: self.session_id.clone(),
            replications: self.replications.clone(),
            commands: self.commands.clone(),
            writes: Arc::clone(&self.writes),
        }
    }
}

impl<S: DocumentStore> ControlSession<S> {
    pub(crate) fn new(
        store: Arc<S>,
        config: Arc<ClientConfig>,
        control_db: DatabaseName,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        let session_id = config.session_doc_id();
        Self {
            store,
            config,
            control_db,
            session_id,
            replications: InstallationReplications::default(),
            commands,
            writes: Arc::new(Mutex::new(())),
        }
    }

    /// Id of this device's session document.
    pub fn session_id(&self) -> &DocId {
        &self.session_id
    }

    /// Name of the local control database.
    pub fn control_database(&self) -> &DatabaseName {
        &self.control_db
    }

    pub(crate) fn replications(&self) -> &InstallationReplications {
        &self.replications
    }

    // =========================================================================
    // Loading
    // =========================================================================

    /// The session document, if it exists.
    pub async fn session_model(&self) -> Result<Option<SessionModel>, ClientError> {
        self.load(&self.session_id).await
    }

    async fn user_id(&self) -> Result<Option<String>, ClientError> {
        Ok(self.session_model().await?.and_then(|s| s.user_id))
    }

    async fn load<M: ControlModel>(&self, id: &DocId) -> Result<Option<M>, ClientError> {
        match self.store.get(&self.control_db, id).await? {
            Some(doc) => Ok(Some(M::from_document(&doc)?)),
            None => Ok(None),
        }
    }

    async fn load_all<M: ControlModel>(&self) -> Result<Vec<M>, ClientError> {
        let docs = self
            .store
            .query(&self.control_db, &|doc: &Document| doc.is_type(M::DOC_TYPE))
            .await?;
        docs.iter()
            .map(|doc| M::from_document(doc).map_err(ClientError::from))
            .collect()
    }

    async fn save<M: ControlModel>(&self, model: &M) -> Result<(), ClientError> {
        self.store.put(&self.control_db, model.to_document()?).await?;
        Ok(())
    }

    async fn local_installations(&self) -> Result<Vec<InstallationModel>, ClientError> {
        let mut installations = self.load_all::<InstallationModel>().await?;
        installations.retain(|i| i.is_local(&self.session_id));
        Ok(installations)
    }

    // =========================================================================
    // Channels
    // =========================================================================

    /// Create a new channel. Names are not unique: an existing channel with
    /// the same name is left alone and a second one is created.
    pub async fn make_channel_with_name(&self, name: &str) -> Result<ChannelModel, ClientError> {
        let _writes = self.writes.lock().await;
        self.create_channel(name).await
    }

    async fn create_channel(&self, name: &str) -> Result<ChannelModel, ClientError> {
        if name.is_empty() {
            return Err(ClientError::InvalidOperation(
                "channel name is empty".to_string(),
            ));
        }
        let channel = ChannelModel::new(name, self.user_id().await?);
        self.save(&channel).await?;
        tracing::info!("Created channel {:?} ({})", name, channel.id);
        Ok(channel)
    }

    /// The first channel with `name`, if any.
    pub async fn channel_with_name(&self, name: &str) -> Result<Option<ChannelModel>, ClientError> {
        Ok(self
            .load_all::<ChannelModel>()
            .await?
            .into_iter()
            .find(|c| c.name == name))
    }

    /// A channel by id.
    pub async fn channel(&self, id: &DocId) -> Result<Option<ChannelModel>, ClientError> {
        self.load(id).await
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// The user's subscription to `channel`, if any.
    pub async fn subscription_for(
        &self,
        channel: &ChannelModel,
    ) -> Result<Option<SubscriptionModel>, ClientError> {
        Ok(self
            .load_all::<SubscriptionModel>()
            .await?
            .into_iter()
            .find(|s| s.channel_id == channel.id))
    }

    /// Subscribe to `channel`, reusing an existing subscription.
    pub async fn subscribe(&self, channel: &ChannelModel) -> Result<SubscriptionModel, ClientError> {
        let _writes = self.writes.lock().await;
        self.find_or_subscribe(channel).await
    }

    async fn find_or_subscribe(
        &self,
        channel: &ChannelModel,
    ) -> Result<SubscriptionModel, ClientError> {
        if let Some(existing) = self.subscription_for(channel).await? {
            return Ok(existing);
        }
        let subscription = SubscriptionModel::new(channel, self.user_id().await?);
        self.save(&subscription).await?;
        tracing::info!("Subscribed to channel {} ({})", channel.id, subscription.id);
        Ok(subscription)
    }

    /// Remove a subscription and every installation of it.
    pub async fn unsubscribe(&self, subscription: &SubscriptionModel) -> Result<(), ClientError> {
        let _writes = self.writes.lock().await;
        let dependents: Vec<_> = self
            .load_all::<InstallationModel>()
            .await?
            .into_iter()
            .filter(|i| i.subscription_id == subscription.id)
            .collect();
        for installation in &dependents {
            self.remove_installation(installation).await?;
        }
        self.store.delete(&self.control_db, &subscription.id).await?;
        tracing::info!(
            "Unsubscribed {} ({} installations removed)",
            subscription.id,
            dependents.len()
        );
        Ok(())
    }

    // =========================================================================
    // Installations
    // =========================================================================

    /// This device's installation of `subscription`, if any.
    pub async fn installation_for_subscription(
        &self,
        subscription: &SubscriptionModel,
    ) -> Result<Option<InstallationModel>, ClientError> {
        Ok(self
            .local_installations()
            .await?
            .into_iter()
            .find(|i| i.subscription_id == subscription.id))
    }

    /// This device's installation of `channel`, if any.
    pub async fn installation_for_channel(
        &self,
        channel: &ChannelModel,
    ) -> Result<Option<InstallationModel>, ClientError> {
        Ok(self
            .local_installations()
            .await?
            .into_iter()
            .find(|i| i.channel_id == channel.id))
    }

    /// Install `subscription` into `local_database` (a new randomly named
    /// database if `None`) and start syncing it with the channel.
    ///
    /// Always creates a new installation, even if one already exists for
    /// this subscription. Use [`install_channel`](Self::install_channel) to
    /// reuse an existing one.
    pub async fn make_installation(
        &self,
        subscription: &SubscriptionModel,
        local_database: Option<DatabaseName>,
    ) -> Result<InstallationModel, ClientError> {
        let _writes = self.writes.lock().await;
        self.create_installation(subscription, local_database).await
    }

    async fn create_installation(
        &self,
        subscription: &SubscriptionModel,
        local_database: Option<DatabaseName>,
    ) -> Result<InstallationModel, ClientError> {
        let channel = self.channel(&subscription.channel_id).await?.ok_or_else(|| {
            ClientError::InvalidOperation(format!(
                "channel {} of subscription {} does not exist",
                subscription.channel_id, subscription.id
            ))
        })?;
        let cloud_database = ready_cloud_database(&channel)?;

        let local = match local_database {
            Some(db) => db,
            None => DatabaseName::generate(&self.config.local_database_prefix)?,
        };
        self.store.create_database(&local).await?;

        let installation = InstallationModel::new(subscription, self.session_id.clone(), local);
        self.save(&installation).await?;

        if let Err(e) = self
            .start_installation_replication(&installation, cloud_database)
            .await
        {
            // Do not leave an installation behind that never syncs
            if let Err(del) = self.store.delete(&self.control_db, &installation.id).await {
                tracing::warn!("Failed to remove installation {}: {}", installation.id, del);
            }
            return Err(e);
        }

        tracing::info!(
            "Installed channel {} into {} ({})",
            channel.id,
            installation.local_db_name,
            installation.id
        );
        Ok(installation)
    }

    /// Subscribe to `channel` (reusing a subscription) and install it,
    /// returning the existing local installation if there is one.
    pub async fn install_channel(
        &self,
        channel: &ChannelModel,
        local_database: Option<DatabaseName>,
    ) -> Result<InstallationModel, ClientError> {
        let _writes = self.writes.lock().await;
        self.find_or_install(channel, local_database).await
    }

    async fn find_or_install(
        &self,
        channel: &ChannelModel,
        local_database: Option<DatabaseName>,
    ) -> Result<InstallationModel, ClientError> {
        let subscription = self.find_or_subscribe(channel).await?;
        if let Some(existing) = self.installation_for_subscription(&subscription).await? {
            if let Ok(cloud_database) = ready_cloud_database(channel) {
                self.start_installation_replication(&existing, cloud_database)
                    .await?;
            }
            return Ok(existing);
        }
        self.create_installation(&subscription, local_database).await
    }

    /// Find or create the channel called `name`, subscribe, and install it.
    ///
    /// If the channel is not ready yet the subscription still exists and
    /// [`SessionInstall::ChannelPending`] is returned.
    pub async fn install_channel_named(
        &self,
        name: &str,
        local_database: Option<DatabaseName>,
    ) -> Result<SessionInstall, ClientError> {
        let _writes = self.writes.lock().await;
        let channel = match self.channel_with_name(name).await? {
            Some(channel) => channel,
            None => self.create_channel(name).await?,
        };
        self.find_or_subscribe(&channel).await?;

        if !channel.is_ready() {
            tracing::debug!("Channel {:?} not ready yet", name);
            return Ok(SessionInstall::ChannelPending(channel));
        }
        let installation = self.find_or_install(&channel, local_database).await?;
        Ok(SessionInstall::Installed(installation))
    }

    /// Stop syncing an installation and delete it. The local database is kept.
    pub async fn uninstall(&self, installation: &InstallationModel) -> Result<(), ClientError> {
        let _writes = self.writes.lock().await;
        self.remove_installation(installation).await
    }

    async fn remove_installation(&self, installation: &InstallationModel) -> Result<(), ClientError> {
        self.stop_installation_replication(&installation.id).await;
        self.store.delete(&self.control_db, &installation.id).await?;
        tracing::info!("Uninstalled {}", installation.id);
        Ok(())
    }

    /// Whether `installation` is currently being replicated by this client.
    pub fn is_replicating(&self, installation: &InstallationModel) -> bool {
        self.replications.is_running(&installation.id)
    }

    /// Number of installations currently being replicated.
    pub fn replicating_count(&self) -> usize {
        self.replications.len()
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Channels the server has set up.
    pub fn ready_channels(&self) -> ModelQuery<S, ChannelModel> {
        ModelQuery::new(self.clone(), |c: &ChannelModel, _: &QueryContext| c.is_ready(), false)
    }

    /// Subscriptions in the `"active"` state.
    pub fn active_subscriptions(&self) -> ModelQuery<S, SubscriptionModel> {
        ModelQuery::new(self.clone(), |s: &SubscriptionModel, _: &QueryContext| s.is_active(), false)
    }

    /// Subscriptions with an installation on this device.
    pub fn installed_subscriptions(&self) -> ModelQuery<S, SubscriptionModel> {
        ModelQuery::new(
            self.clone(),
            |s: &SubscriptionModel, ctx: &QueryContext| ctx.installed.contains(&s.id),
            true,
        )
    }

    /// Installations on this device.
    pub fn all_installations(&self) -> ModelQuery<S, InstallationModel> {
        ModelQuery::new(
            self.clone(),
            |i: &InstallationModel, ctx: &QueryContext| i.is_local(&ctx.session_id),
            false,
        )
    }

    // =========================================================================
    // Replication (crate-internal)
    // =========================================================================

    async fn start_installation_replication(
        &self,
        installation: &InstallationModel,
        cloud_database: &str,
    ) -> Result<(), ClientError> {
        if self.replications.is_running(&installation.id) {
            return Ok(());
        }

        let remote = RemoteDatabase::new(self.config.server_url.as_str(), cloud_database);
        let local = installation.local_db_name.clone();
        let target = ReplicationTarget::Installation(installation.id.clone());

        let pull = self
            .start(ReplicationSpec::pull(local.clone(), remote.clone()), &target)
            .await?;
        let push = match self.start(ReplicationSpec::push(local, remote), &target).await {
            Ok(push) => push,
            Err(e) => {
                pull.stop(&*self.store).await;
                return Err(e);
            }
        };

        if let Some(duplicates) = self
            .replications
            .insert(installation.id.clone(), vec![pull, push])
        {
            for running in duplicates {
                running.stop(&*self.store).await;
            }
        }
        Ok(())
    }

    async fn start(
        &self,
        spec: ReplicationSpec,
        target: &ReplicationTarget,
    ) -> Result<RunningReplication, ClientError> {
        let direction = spec.direction;
        tracing::debug!(
            "Starting {} replication {} <-> {}",
            direction,
            spec.local,
            spec.remote.url()
        );
        let handle = self
            .store
            .start_replication(spec)
            .await
            .map_err(|e| ClientError::ReplicationFailed(e.to_string()))?;
        Ok(RunningReplication::spawn(
            handle,
            direction,
            target.clone(),
            self.commands.clone(),
        ))
    }

    pub(crate) async fn stop_installation_replication(&self, installation: &DocId) {
        if let Some(running) = self.replications.remove(installation) {
            for replication in running {
                replication.stop(&*self.store).await;
            }
        }
    }

    pub(crate) async fn stop_all_installation_replications(&self) {
        for replication in self.replications.take_all() {
            replication.stop(&*self.store).await;
        }
    }

    /// Start replication for every valid local installation not already
    /// replicating. Returns the installations that failed.
    pub(crate) async fn sync_installations(&self) -> Result<Vec<(DocId, ClientError)>, ClientError> {
        let _writes = self.writes.lock().await;
        let mut failures = Vec::new();
        for installation in self.local_installations().await? {
            if self.replications.is_running(&installation.id) {
                continue;
            }
            let subscription: Option<SubscriptionModel> =
                self.load(&installation.subscription_id).await?;
            let channel: Option<ChannelModel> = self.load(&installation.channel_id).await?;
            let cloud_database = match (&subscription, &channel) {
                (Some(_), Some(channel)) => match ready_cloud_database(channel) {
                    Ok(cloud) => cloud.to_string(),
                    Err(_) => continue,
                },
                _ => {
                    tracing::debug!("Skipping orphaned installation {}", installation.id);
                    continue;
                }
            };
            if let Err(e) = self
                .start_installation_replication(&installation, &cloud_database)
                .await
            {
                failures.push((installation.id.clone(), e));
            }
        }
        Ok(failures)
    }

    /// Delete every control document (session, channels, subscriptions,
    /// installations). Returns how many were deleted.
    pub(crate) async fn clear_control_documents(&self) -> Result<usize, ClientError> {
        let _writes = self.writes.lock().await;
        let control_types = [SESSION_TYPE, CHANNEL_TYPE, SUBSCRIPTION_TYPE, INSTALLATION_TYPE];
        let docs = self
            .store
            .query(&self.control_db, &|doc: &Document| {
                doc.doc_type().map_or(false, |t| control_types.contains(&t))
            })
            .await?;
        let mut deleted = 0;
        for doc in docs {
            if self.store.delete(&self.control_db, doc.id()).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Session pull or push spec, keyed by the stored token.
    pub(crate) async fn session_replication_spec(
        &self,
        direction: Direction,
    ) -> Result<ReplicationSpec, ClientError> {
        let session = self.session_model().await?.ok_or_else(|| {
            ClientError::InvalidOperation("no session document".to_string())
        })?;
        let token = session.oauth_creds.as_ref().ok_or_else(|| {
            ClientError::InvalidOperation("session has no credentials".to_string())
        })?;

        let remote_name = session
            .control_database
            .clone()
            .unwrap_or_else(|| self.config.handshake_database.clone());
        let remote = RemoteDatabase::new(self.config.server_url.as_str(), remote_name);

        Ok(match direction {
            Direction::Pull => ReplicationSpec::pull(self.control_db.clone(), remote).with_filter(
                ReplicationFilter::new(SESSION_FILTER)
                    .with_param("session_key", token.session_key())
                    .with_param("session_id", self.session_id.as_str()),
            ),
            Direction::Push => ReplicationSpec::push(self.control_db.clone(), remote),
        })
    }

    pub(crate) async fn start_session_replication(
        &self,
        direction: Direction,
    ) -> Result<RunningReplication, ClientError> {
        let spec = self.session_replication_spec(direction).await?;
        self.start(spec, &ReplicationTarget::Session).await
    }
}

fn ready_cloud_database(channel: &ChannelModel) -> Result<&str, ClientError> {
    if !channel.is_ready() {
        return Err(ClientError::InvalidOperation(format!(
            "channel {} is not ready",
            channel.id
        )));
    }
    channel.cloud_database.as_deref().ok_or_else(|| {
        ClientError::InvalidOperation(format!("channel {} has no cloud database", channel.id))
    })
}

/// What a query filter can see besides the model itself.
pub(crate) struct QueryContext {
    session_id: DocId,
    installed: HashSet<DocId>,
}

/// A lazy, restartable query over one kind of control document.
///
/// Nothing is read until [`fetch`](Self::fetch); every fetch re-reads the
/// store, so the result reflects the documents at that moment.
pub struct ModelQuery<S, M> {
    session: ControlSession<S>,
    filter: fn(&M, &QueryContext) -> bool,
    needs_installations: bool,
    _model: PhantomData<fn() -> M>,
}

impl<S: DocumentStore, M: ControlModel> ModelQuery<S, M> {
    fn new(
        session: ControlSession<S>,
        filter: fn(&M, &QueryContext) -> bool,
        needs_installations: bool,
    ) -> Self {
        Self {
            session,
            filter,
            needs_installations,
            _model: PhantomData,
        }
    }

    /// Run the query.
    pub async fn fetch(&self) -> Result<Vec<M>, ClientError> {
        let installed = if self.needs_installations {
            self.session
                .local_installations()
                .await?
                .into_iter()
                .map(|i| i.subscription_id)
                .collect()
        } else {
            HashSet::new()
        };
        let context = QueryContext {
            session_id: self.session.session_id.clone(),
            installed,
        };

        let mut models = self.session.load_all::<M>().await?;
        models.retain(|m| (self.filter)(m, &context));
        Ok(models)
    }

    /// Run the query and count the results.
    pub async fn count(&self) -> Result<usize, ClientError> {
        Ok(self.fetch().await?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DocumentFilter, MemoryStore, ReplicationHandle, StoreError};
    use serde_json::{json, Map};
    use syncpoint_core::OAuthToken;
    use syncpoint_types::{ChangeEvent, ErrorKind, ReplicationId};
    use tokio::sync::broadcast;

    struct Fixture {
        store: MemoryStore,
        session: ControlSession<MemoryStore>,
        _commands: mpsc::UnboundedReceiver<Command>,
    }

    async fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let config = Arc::new(ClientConfig::default());
        let ctl = config.control_database().unwrap();
        store.create_database(&ctl).await.unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let session = ControlSession::new(Arc::new(store.clone()), config, ctl, tx);
        Fixture {
            store,
            session,
            _commands: rx,
        }
    }

    /// Yields to the scheduler before every store call, so interleavings
    /// between concurrent operations actually happen.
    struct YieldingStore(MemoryStore);

    #[async_trait::async_trait]
    impl DocumentStore for YieldingStore {
        async fn create_database(&self, db: &DatabaseName) -> Result<(), StoreError> {
            tokio::task::yield_now().await;
            self.0.create_database(db).await
        }

        async fn get(&self, db: &DatabaseName, id: &DocId) -> Result<Option<Document>, StoreError> {
            tokio::task::yield_now().await;
            self.0.get(db, id).await
        }

        async fn put(&self, db: &DatabaseName, doc: Document) -> Result<(), StoreError> {
            tokio::task::yield_now().await;
            self.0.put(db, doc).await
        }

        async fn delete(&self, db: &DatabaseName, id: &DocId) -> Result<bool, StoreError> {
            tokio::task::yield_now().await;
            self.0.delete(db, id).await
        }

        async fn query(
            &self,
            db: &DatabaseName,
            filter: DocumentFilter<'_>,
        ) -> Result<Vec<Document>, StoreError> {
            tokio::task::yield_now().await;
            self.0.query(db, filter).await
        }

        async fn changes(
            &self,
            db: &DatabaseName,
        ) -> Result<broadcast::Receiver<ChangeEvent>, StoreError> {
            self.0.changes(db).await
        }

        async fn start_replication(
            &self,
            spec: ReplicationSpec,
        ) -> Result<ReplicationHandle, StoreError> {
            tokio::task::yield_now().await;
            self.0.start_replication(spec).await
        }

        async fn stop_replication(&self, id: ReplicationId) -> Result<(), StoreError> {
            self.0.stop_replication(id).await
        }
    }

    async fn yielding_session(
        store: &MemoryStore,
    ) -> (ControlSession<YieldingStore>, mpsc::UnboundedReceiver<Command>) {
        let config = Arc::new(ClientConfig::default());
        let ctl = config.control_database().unwrap();
        store.create_database(&ctl).await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let session = ControlSession::new(Arc::new(YieldingStore(store.clone())), config, ctl, tx);
        (session, rx)
    }

    fn ready(f: &Fixture, channel: &ChannelModel) -> ChannelModel {
        let mut fields = Map::new();
        fields.insert("state".into(), json!("ready"));
        fields.insert("cloud_database".into(), json!("cloud-notes"));
        f.store
            .merge_fields(f.session.control_database(), &channel.id, fields)
            .unwrap();
        let mut channel = channel.clone();
        channel.mark_ready("cloud-notes");
        channel
    }

    async fn ready_channel(f: &Fixture, name: &str) -> ChannelModel {
        let channel = f.session.make_channel_with_name(name).await.unwrap();
        ready(f, &channel)
    }

    // =========================================================================
    // Channels and subscriptions
    // =========================================================================

    #[tokio::test]
    async fn make_channel_always_creates() {
        let f = fixture().await;
        let a = f.session.make_channel_with_name("notes").await.unwrap();
        let b = f.session.make_channel_with_name("notes").await.unwrap();

        assert_ne!(a.id, b.id);
        assert_eq!(a.state, "new");
        let found = f.session.channel_with_name("notes").await.unwrap().unwrap();
        assert!(found.id == a.id || found.id == b.id);
    }

    #[tokio::test]
    async fn empty_channel_name_rejected() {
        let f = fixture().await;
        let err = f.session.make_channel_with_name("").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOperation);
    }

    #[tokio::test]
    async fn channel_owner_is_session_user() {
        let f = fixture().await;
        let mut session = SessionModel::new(f.session.session_id().clone(), "t");
        session.activate("u1");
        f.store
            .put(f.session.control_database(), session.to_document().unwrap())
            .await
            .unwrap();

        let channel = f.session.make_channel_with_name("notes").await.unwrap();
        assert_eq!(channel.owner_id.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn resubscribing_returns_same_subscription() {
        let f = fixture().await;
        let channel = f.session.make_channel_with_name("notes").await.unwrap();

        let first = f.session.subscribe(&channel).await.unwrap();
        let second = f.session.subscribe(&channel).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(f.session.active_subscriptions().count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_subscribes_share_one_subscription() {
        let store = MemoryStore::new();
        let (session, _commands) = yielding_session(&store).await;
        let channel = session.make_channel_with_name("notes").await.unwrap();
        let other = session.clone();

        let (a, b) = tokio::join!(session.subscribe(&channel), other.subscribe(&channel));

        assert_eq!(a.unwrap().id, b.unwrap().id);
        assert_eq!(session.active_subscriptions().count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_named_installs_share_one_channel() {
        let store = MemoryStore::new();
        let (session, _commands) = yielding_session(&store).await;
        let other = session.clone();

        let (a, b) = tokio::join!(
            session.install_channel_named("notes", None),
            other.install_channel_named("notes", None)
        );

        let channel_of = |result: SessionInstall| match result {
            SessionInstall::ChannelPending(channel) => channel.id,
            unexpected => panic!("expected ChannelPending, got {:?}", unexpected),
        };
        assert_eq!(channel_of(a.unwrap()), channel_of(b.unwrap()));
        assert_eq!(session.load_all::<ChannelModel>().await.unwrap().len(), 1);
        assert_eq!(session.active_subscriptions().count().await.unwrap(), 1);
    }

    // =========================================================================
    // Installations
    // =========================================================================

    #[tokio::test]
    async fn make_installation_requires_ready_channel() {
        let f = fixture().await;
        let channel = f.session.make_channel_with_name("notes").await.unwrap();
        let sub = f.session.subscribe(&channel).await.unwrap();

        let err = f.session.make_installation(&sub, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOperation);
        assert_eq!(f.store.active_replication_count(), 0);
    }

    #[tokio::test]
    async fn make_installation_creates_database_and_replicates_both_ways() {
        let f = fixture().await;
        let channel = ready_channel(&f, "notes").await;
        let sub = f.session.subscribe(&channel).await.unwrap();

        let inst = f.session.make_installation(&sub, None).await.unwrap();

        assert!(inst.local_db_name.as_str().starts_with("channel-"));
        assert!(f.store.database_exists(&inst.local_db_name));
        assert!(inst.is_local(f.session.session_id()));
        assert!(f.session.is_replicating(&inst));

        let specs: Vec<_> = f
            .store
            .active_replications()
            .into_iter()
            .map(|(_, spec)| spec)
            .collect();
        assert_eq!(specs.len(), 2);
        assert!(specs.iter().all(|s| s.local == inst.local_db_name));
        assert!(specs.iter().all(|s| s.remote.name == "cloud-notes"));
        assert!(specs.iter().any(|s| s.direction == Direction::Pull));
        assert!(specs.iter().any(|s| s.direction == Direction::Push));
    }

    #[tokio::test]
    async fn make_installation_twice_duplicates() {
        let f = fixture().await;
        let channel = ready_channel(&f, "notes").await;
        let sub = f.session.subscribe(&channel).await.unwrap();

        let a = f.session.make_installation(&sub, None).await.unwrap();
        let b = f.session.make_installation(&sub, None).await.unwrap();

        assert_ne!(a.id, b.id);
        assert_eq!(f.session.all_installations().count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn install_channel_reuses_installation() {
        let f = fixture().await;
        let channel = ready_channel(&f, "notes").await;

        let a = f.session.install_channel(&channel, None).await.unwrap();
        let b = f.session.install_channel(&channel, None).await.unwrap();

        assert_eq!(a.id, b.id);
        assert_eq!(f.store.active_replication_count(), 2);
        assert_eq!(
            f.session.installation_for_channel(&channel).await.unwrap(),
            Some(a)
        );
    }

    #[tokio::test]
    async fn concurrent_install_channel_reuses_installation() {
        let store = MemoryStore::new();
        let (session, _commands) = yielding_session(&store).await;
        let channel = session.make_channel_with_name("notes").await.unwrap();
        let mut fields = Map::new();
        fields.insert("state".into(), json!("ready"));
        fields.insert("cloud_database".into(), json!("cloud-notes"));
        store
            .merge_fields(session.control_database(), &channel.id, fields)
            .unwrap();
        let channel = session.channel(&channel.id).await.unwrap().unwrap();
        let other = session.clone();

        let (a, b) = tokio::join!(
            session.install_channel(&channel, None),
            other.install_channel(&channel, None)
        );

        assert_eq!(a.unwrap().id, b.unwrap().id);
        assert_eq!(session.all_installations().count().await.unwrap(), 1);
        assert_eq!(store.active_replication_count(), 2);
    }

    #[tokio::test]
    async fn install_into_named_database() {
        let f = fixture().await;
        let channel = ready_channel(&f, "notes").await;
        let target = DatabaseName::parse("my_notes").unwrap();

        let inst = f
            .session
            .install_channel(&channel, Some(target.clone()))
            .await
            .unwrap();
        assert_eq!(inst.local_db_name, target);
        assert!(f.store.database_exists(&target));
    }

    #[tokio::test]
    async fn failed_replication_start_leaves_no_installation() {
        let f = fixture().await;
        let channel = ready_channel(&f, "notes").await;
        let sub = f.session.subscribe(&channel).await.unwrap();
        f.store.fail_next_replication("refused");

        let err = f.session.make_installation(&sub, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReplicationFailed);
        assert_eq!(f.session.all_installations().count().await.unwrap(), 0);
        assert_eq!(f.store.active_replication_count(), 0);
    }

    #[tokio::test]
    async fn install_channel_named_creates_and_waits_for_channel() {
        let f = fixture().await;

        let result = f.session.install_channel_named("notes", None).await.unwrap();
        let channel = match result {
            SessionInstall::ChannelPending(channel) => channel,
            other => panic!("expected ChannelPending, got {:?}", other),
        };
        assert_eq!(channel.name, "notes");
        assert!(f.session.subscription_for(&channel).await.unwrap().is_some());

        ready(&f, &channel);
        let result = f.session.install_channel_named("notes", None).await.unwrap();
        assert!(matches!(result, SessionInstall::Installed(_)));
        // Still one channel, one subscription
        assert_eq!(f.session.active_subscriptions().count().await.unwrap(), 1);
        assert_eq!(f.session.ready_channels().count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn other_devices_installations_are_not_local() {
        let f = fixture().await;
        let channel = ready_channel(&f, "notes").await;
        let sub = f.session.subscribe(&channel).await.unwrap();
        let remote = InstallationModel::new(
            &sub,
            DocId::new("other-device"),
            DatabaseName::parse("their_notes").unwrap(),
        );
        f.store
            .apply_remote(f.session.control_database(), remote.to_document().unwrap())
            .unwrap();

        assert_eq!(f.session.all_installations().count().await.unwrap(), 0);
        assert!(f.session.installation_for_subscription(&sub).await.unwrap().is_none());
        assert_eq!(f.session.installed_subscriptions().count().await.unwrap(), 0);
    }

    // =========================================================================
    // Removal
    // =========================================================================

    #[tokio::test]
    async fn uninstall_stops_replication_and_deletes() {
        let f = fixture().await;
        let channel = ready_channel(&f, "notes").await;
        let inst = f.session.install_channel(&channel, None).await.unwrap();

        f.session.uninstall(&inst).await.unwrap();

        assert_eq!(f.store.active_replication_count(), 0);
        assert!(!f.session.is_replicating(&inst));
        assert_eq!(f.session.all_installations().count().await.unwrap(), 0);
        // Local data stays
        assert!(f.store.database_exists(&inst.local_db_name));
    }

    #[tokio::test]
    async fn unsubscribe_cascades() {
        let f = fixture().await;
        let channel = ready_channel(&f, "notes").await;
        let sub = f.session.subscribe(&channel).await.unwrap();
        f.session.make_installation(&sub, None).await.unwrap();
        f.session.make_installation(&sub, None).await.unwrap();

        f.session.unsubscribe(&sub).await.unwrap();

        assert_eq!(f.session.all_installations().count().await.unwrap(), 0);
        assert!(f.session.subscription_for(&channel).await.unwrap().is_none());
        assert_eq!(f.store.active_replication_count(), 0);
    }

    // =========================================================================
    // Queries
    // =========================================================================

    #[tokio::test]
    async fn queries_are_lazy_and_restartable() {
        let f = fixture().await;
        let query = f.session.ready_channels();
        assert_eq!(query.count().await.unwrap(), 0);

        ready_channel(&f, "a").await;
        f.session.make_channel_with_name("b").await.unwrap();
        assert_eq!(query.count().await.unwrap(), 1);

        ready_channel(&f, "c").await;
        let names: HashSet<_> = query
            .fetch()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, HashSet::from(["a".to_string(), "c".to_string()]));
    }

    #[tokio::test]
    async fn installed_subscriptions_only_lists_installed() {
        let f = fixture().await;
        let installed = ready_channel(&f, "a").await;
        let bare = ready_channel(&f, "b").await;
        f.session.install_channel(&installed, None).await.unwrap();
        f.session.subscribe(&bare).await.unwrap();

        let subs = f.session.installed_subscriptions().fetch().await.unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].channel_id, installed.id);
        assert_eq!(f.session.active_subscriptions().count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn malformed_document_is_store_failure() {
        let f = fixture().await;
        f.store
            .apply_remote(
                f.session.control_database(),
                Document::new(DocId::new("broken"), "channel"),
            )
            .unwrap();

        let err = f.session.ready_channels().fetch().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StoreFailure);
    }

    // =========================================================================
    // Internal helpers
    // =========================================================================

    #[tokio::test]
    async fn sync_installations_restarts_valid_local_installations() {
        let f = fixture().await;
        let channel = ready_channel(&f, "notes").await;
        let inst = f.session.install_channel(&channel, None).await.unwrap();
        f.session.stop_all_installation_replications().await;
        assert_eq!(f.store.active_replication_count(), 0);

        let failures = f.session.sync_installations().await.unwrap();
        assert!(failures.is_empty());
        assert!(f.session.is_replicating(&inst));
        assert_eq!(f.store.active_replication_count(), 2);

        // Already running: nothing new
        f.session.sync_installations().await.unwrap();
        assert_eq!(f.store.active_replication_count(), 2);
    }

    #[tokio::test]
    async fn sync_installations_skips_orphans() {
        let f = fixture().await;
        let channel = ready_channel(&f, "notes").await;
        let inst = f.session.install_channel(&channel, None).await.unwrap();
        f.session.stop_all_installation_replications().await;
        f.store
            .delete(f.session.control_database(), &channel.id)
            .await
            .unwrap();

        f.session.sync_installations().await.unwrap();
        assert!(!f.session.is_replicating(&inst));
    }

    #[tokio::test]
    async fn session_pull_is_filtered_by_token_digest() {
        let f = fixture().await;
        let token = OAuthToken::new("secret-token", "oauth").unwrap();
        let mut session = SessionModel::new(f.session.session_id().clone(), "t");
        session.set_credentials("t", token.clone());
        f.store
            .put(f.session.control_database(), session.to_document().unwrap())
            .await
            .unwrap();

        let pull = f
            .session
            .session_replication_spec(Direction::Pull)
            .await
            .unwrap();
        let filter = pull.filter.unwrap();
        assert_eq!(filter.name, SESSION_FILTER);
        assert_eq!(filter.params["session_key"], token.session_key());
        assert!(!filter.params.values().any(|v| v.contains("secret-token")));
        assert_eq!(pull.remote.name, "sp_handshake");

        let push = f
            .session
            .session_replication_spec(Direction::Push)
            .await
            .unwrap();
        assert!(push.filter.is_none());
    }

    #[tokio::test]
    async fn session_replication_uses_assigned_control_database() {
        let f = fixture().await;
        let mut session = SessionModel::new(f.session.session_id().clone(), "t");
        session.set_credentials("t", OAuthToken::new("tok", "oauth").unwrap());
        session.control_database = Some("control-u1".into());
        f.store
            .put(f.session.control_database(), session.to_document().unwrap())
            .await
            .unwrap();

        let spec = f
            .session
            .session_replication_spec(Direction::Push)
            .await
            .unwrap();
        assert_eq!(spec.remote.name, "control-u1");
    }

    #[tokio::test]
    async fn clear_control_documents_keeps_other_documents() {
        let f = fixture().await;
        let channel = ready_channel(&f, "notes").await;
        f.session.install_channel(&channel, None).await.unwrap();
        f.store
            .apply_remote(
                f.session.control_database(),
                Document::new(DocId::new("app-note"), "note"),
            )
            .unwrap();

        let deleted = f.session.clear_control_documents().await.unwrap();
        assert_eq!(deleted, 3);
        assert_eq!(f.store.document_count(f.session.control_database()), 1);
    }
}
