//! Channels: named server-hosted databases a user can subscribe to.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use syncpoint_types::DocId;

use super::ControlModel;

/// `type` of channel documents.
pub const CHANNEL_TYPE: &str = "channel";

const STATE_NEW: &str = "new";
const STATE_READY: &str = "ready";

fn default_state() -> String {
    STATE_NEW.to_string()
}

/// A channel document. Names are not unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelModel {
    /// Document id.
    #[serde(rename = "_id")]
    pub id: DocId,
    /// Display name.
    pub name: String,
    /// User who created the channel; not necessarily the local user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    /// `"new"` until the server sets it up, then `"ready"`.
    #[serde(default = "default_state")]
    pub state: String,
    /// Whether this is the user's default channel.
    #[serde(default)]
    pub is_default: bool,
    /// Server-side database to sync installations with, set once ready.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_database: Option<String>,
    /// Fields this model does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChannelModel {
    /// A new channel with a generated id, in the `"new"` state.
    pub fn new(name: impl Into<String>, owner_id: Option<String>) -> Self {
        Self {
            id: DocId::generate(),
            name: name.into(),
            owner_id,
            state: default_state(),
            is_default: false,
            cloud_database: None,
            extra: Map::new(),
        }
    }

    /// Is the channel set up on the server and ready for use?
    pub fn is_ready(&self) -> bool {
        self.state == STATE_READY
    }

    /// Mark the channel ready (server side of channel setup).
    pub fn mark_ready(&mut self, cloud_database: impl Into<String>) {
        self.state = STATE_READY.to_string();
        self.cloud_database = Some(cloud_database.into());
    }
}

impl ControlModel for ChannelModel {
    const DOC_TYPE: &'static str = CHANNEL_TYPE;

    fn id(&self) -> &DocId {
        &self.id
    }

    fn state(&self) -> &str {
        &self.state
    }
}
