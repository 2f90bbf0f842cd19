//! The session singleton.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use syncpoint_types::DocId;

use super::{ControlModel, STATE_ACTIVE};
use crate::credentials::OAuthToken;
use crate::state::SessionReadiness;

/// `type` of the session document.
pub const SESSION_TYPE: &str = "session";

const STATE_NEW: &str = "new";

fn default_state() -> String {
    STATE_NEW.to_string()
}

/// The per-device control document tracking authentication and activation.
///
/// Created the first time authentication produces a token. The coordinator
/// writes `oauth_creds` and `state`; the server writes `user_id`, `error`
/// and `control_database`, which arrive by replication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionModel {
    /// Document id (fixed per client).
    #[serde(rename = "_id")]
    pub id: DocId,
    /// Authenticator's document type, e.g. `session-fb`.
    pub auth_type: String,
    /// `"new"` until activated.
    #[serde(default = "default_state")]
    pub state: String,
    /// Server-assigned user id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Credentials the server validates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_creds: Option<OAuthToken>,
    /// Server-written failure: a string, or an object with `message`/`reason`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    /// Remote control database assigned by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_database: Option<String>,
    /// Fields this model does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SessionModel {
    /// Create a fresh, unauthenticated session.
    pub fn new(id: DocId, auth_type: impl Into<String>) -> Self {
        Self {
            id,
            auth_type: auth_type.into(),
            state: default_state(),
            user_id: None,
            oauth_creds: None,
            error: None,
            control_database: None,
            extra: Map::new(),
        }
    }

    /// Store new credentials and reset activation.
    ///
    /// Any previous server verdict (user id, error) belongs to the old
    /// credentials and is cleared.
    pub fn set_credentials(&mut self, auth_type: impl Into<String>, token: OAuthToken) {
        self.auth_type = auth_type.into();
        self.oauth_creds = Some(token);
        self.state = default_state();
        self.user_id = None;
        self.error = None;
    }

    /// Whether credentials are present.
    pub fn has_credentials(&self) -> bool {
        self.oauth_creds.is_some()
    }

    /// The server's error message, if it wrote one.
    pub fn error_message(&self) -> Option<String> {
        let error = self.error.as_ref()?;
        let message = match error {
            Value::Null => return None,
            Value::String(s) => s.clone(),
            Value::Object(obj) => obj
                .get("message")
                .or_else(|| obj.get("reason"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string()),
            other => other.to_string(),
        };
        Some(message)
    }

    /// Activation status as the state machine sees it.
    ///
    /// An error wins over a user id.
    pub fn readiness(&self) -> SessionReadiness {
        if let Some(message) = self.error_message() {
            return SessionReadiness::Rejected(message);
        }
        match self.user_id.as_deref() {
            Some(user) if !user.is_empty() => SessionReadiness::Active,
            _ => SessionReadiness::Pending,
        }
    }

    /// Mark the session active (server side of activation).
    pub fn activate(&mut self, user_id: impl Into<String>) {
        self.user_id = Some(user_id.into());
        self.state = STATE_ACTIVE.to_string();
    }
}

impl ControlModel for SessionModel {
    const DOC_TYPE: &'static str = SESSION_TYPE;

    fn id(&self) -> &DocId {
        &self.id
    }

    fn state(&self) -> &str {
        &self.state
    }
}
