//! Installations: a subscription bound to a local database on one device.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use syncpoint_types::{DatabaseName, DocId};

use super::{ControlModel, SubscriptionModel};

/// `type` of installation documents.
pub const INSTALLATION_TYPE: &str = "installation";

const STATE_CREATED: &str = "created";

fn default_state() -> String {
    STATE_CREATED.to_string()
}

/// An installation document.
///
/// Installations of other devices replicate in through the control database;
/// only those whose `session_id` matches this device are local.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallationModel {
    /// Document id.
    #[serde(rename = "_id")]
    pub id: DocId,
    /// The subscription being installed.
    pub subscription_id: DocId,
    /// The subscription's channel.
    pub channel_id: DocId,
    /// Session of the device that owns this installation.
    pub session_id: DocId,
    /// Local database synced with the channel's cloud database.
    pub local_db_name: DatabaseName,
    /// Lifecycle state, `"created"` when made locally.
    #[serde(default = "default_state")]
    pub state: String,
    /// Fields this model does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InstallationModel {
    /// A new installation of `subscription` on the device owning `session_id`.
    pub fn new(subscription: &SubscriptionModel, session_id: DocId, local_db_name: DatabaseName) -> Self {
        Self {
            id: DocId::generate(),
            subscription_id: subscription.id.clone(),
            channel_id: subscription.channel_id.clone(),
            session_id,
            local_db_name,
            state: default_state(),
            extra: Map::new(),
        }
    }

    /// Is this installation specific to the device with `session_id`?
    pub fn is_local(&self, session_id: &DocId) -> bool {
        &self.session_id == session_id
    }
}

impl ControlModel for InstallationModel {
    const DOC_TYPE: &'static str = INSTALLATION_TYPE;

    fn id(&self) -> &DocId {
        &self.id
    }

    fn state(&self) -> &str {
        &self.state
    }
}
