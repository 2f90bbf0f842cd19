//! Typed views of the control documents.
//!
//! Each model maps explicitly to and from a [`Document`]. Required fields are
//! checked on load; a document that fails to decode is reported as
//! [`DocumentError::Malformed`] rather than filled with defaults. Fields a
//! model does not know about are carried in `extra` so that rewriting a
//! document never drops what the server put there.

mod channel;
mod installation;
mod session;
mod subscription;

pub use channel::{ChannelModel, CHANNEL_TYPE};
pub use installation::{InstallationModel, INSTALLATION_TYPE};
pub use session::{SessionModel, SESSION_TYPE};
pub use subscription::{SubscriptionModel, SUBSCRIPTION_TYPE};

use serde::de::DeserializeOwned;
use serde::Serialize;
use syncpoint_types::{DocId, Document, DocumentError};

/// `state` value of a model the server has registered.
pub const STATE_ACTIVE: &str = "active";

/// Behaviour shared by every control document model.
pub trait ControlModel: Serialize + DeserializeOwned + Sized {
    /// Value of the `type` discriminator.
    const DOC_TYPE: &'static str;

    /// Document id.
    fn id(&self) -> &DocId;

    /// Raw `state` field.
    fn state(&self) -> &str;

    /// Has this object been registered with the server?
    fn is_active(&self) -> bool {
        self.state() == STATE_ACTIVE
    }

    /// Decode from a stored document, checking the discriminator.
    fn from_document(doc: &Document) -> Result<Self, DocumentError> {
        doc.decode(Self::DOC_TYPE)
    }

    /// Encode into a document stamped with the discriminator.
    fn to_document(&self) -> Result<Document, DocumentError> {
        Document::encode(self, Self::DOC_TYPE)
    }
}

/// Any control document, tagged by its `type`.
#[derive(Debug, Clone, PartialEq)]
pub enum Model {
    /// The session singleton.
    Session(SessionModel),
    /// A channel.
    Channel(ChannelModel),
    /// A subscription.
    Subscription(SubscriptionModel),
    /// An installation.
    Installation(InstallationModel),
}

impl Model {
    /// Decode a document by its `type`; `None` for types that are not
    /// control documents.
    pub fn from_document(doc: &Document) -> Option<Result<Self, DocumentError>> {
        let model = match doc.doc_type()? {
            SESSION_TYPE => SessionModel::from_document(doc).map(Model::Session),
            CHANNEL_TYPE => ChannelModel::from_document(doc).map(Model::Channel),
            SUBSCRIPTION_TYPE => SubscriptionModel::from_document(doc).map(Model::Subscription),
            INSTALLATION_TYPE => InstallationModel::from_document(doc).map(Model::Installation),
            _ => return None,
        };
        Some(model)
    }

    /// Document id.
    pub fn id(&self) -> &DocId {
        match self {
            Model::Session(m) => m.id(),
            Model::Channel(m) => m.id(),
            Model::Subscription(m) => m.id(),
            Model::Installation(m) => m.id(),
        }
    }

    /// Raw `state` field.
    pub fn state(&self) -> &str {
        match self {
            Model::Session(m) => m.state(),
            Model::Channel(m) => m.state(),
            Model::Subscription(m) => m.state(),
            Model::Installation(m) => m.state(),
        }
    }

    /// Has this object been registered with the server?
    pub fn is_active(&self) -> bool {
        match self {
            Model::Session(m) => m.is_active(),
            Model::Channel(m) => m.is_active(),
            Model::Subscription(m) => m.is_active(),
            Model::Installation(m) => m.is_active(),
        }
    }
}
