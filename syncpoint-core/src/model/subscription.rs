//! Subscriptions: a user's interest in a channel, across devices.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use syncpoint_types::DocId;

use super::{ChannelModel, ControlModel, STATE_ACTIVE};

/// `type` of subscription documents.
pub const SUBSCRIPTION_TYPE: &str = "subscription";

fn default_state() -> String {
    STATE_ACTIVE.to_string()
}

/// A subscription document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionModel {
    /// Document id.
    #[serde(rename = "_id")]
    pub id: DocId,
    /// The channel subscribed to.
    pub channel_id: DocId,
    /// Subscribing user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    /// `"active"` when created locally.
    #[serde(default = "default_state")]
    pub state: String,
    /// Fields this model does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SubscriptionModel {
    /// A new active subscription to `channel`.
    pub fn new(channel: &ChannelModel, owner_id: Option<String>) -> Self {
        Self {
            id: DocId::generate(),
            channel_id: channel.id.clone(),
            owner_id,
            state: default_state(),
            extra: Map::new(),
        }
    }
}

impl ControlModel for SubscriptionModel {
    const DOC_TYPE: &'static str = SUBSCRIPTION_TYPE;

    fn id(&self) -> &DocId {
        &self.id
    }

    fn state(&self) -> &str {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use syncpoint_types::{Document, DocumentError};

    #[test]
    fn new_subscription_points_at_channel() {
        let channel = ChannelModel::new("notes", None);
        let sub = SubscriptionModel::new(&channel, Some("u1".into()));
        assert_eq!(sub.channel_id, channel.id);
        assert!(sub.is_active());
    }

    #[test]
    fn encodes_channel_reference() {
        let channel = ChannelModel::new("notes", None);
        let doc = SubscriptionModel::new(&channel, None).to_document().unwrap();
        assert_eq!(doc.get_str("channel_id"), Some(channel.id.as_str()));
        assert_eq!(doc.get_str("state"), Some("active"));
        assert!(doc.is_type(SUBSCRIPTION_TYPE));
    }

    #[test]
    fn channel_id_is_required() {
        let d: Document =
            serde_json::from_value(json!({"_id": "s1", "type": "subscription", "state": "active"}))
                .unwrap();
        assert!(matches!(
            SubscriptionModel::from_document(&d),
            Err(DocumentError::Malformed { .. })
        ));
    }
}
