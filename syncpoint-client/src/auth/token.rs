//! Authenticator for tokens obtained out of band.

use std::sync::{Mutex, PoisonError};
use syncpoint_core::OAuthToken;

use super::{AuthResponder, Authenticator};

/// Default `auth_type` written to the session.
const DEFAULT_AUTH_DOC_TYPE: &str = "session-token";

/// Pairs with a token the application already holds (from a CLI flag, a
/// keychain, an earlier OAuth flow).
#[derive(Debug)]
pub struct TokenAuthenticator {
    auth_doc_type: String,
    token: Mutex<Option<OAuthToken>>,
}

impl TokenAuthenticator {
    /// Authenticate with `token`.
    pub fn new(token: OAuthToken) -> Self {
        Self {
            auth_doc_type: DEFAULT_AUTH_DOC_TYPE.to_string(),
            token: Mutex::new(Some(token)),
        }
    }

    /// Set the session `auth_type`.
    pub fn with_auth_doc_type(mut self, auth_doc_type: impl Into<String>) -> Self {
        self.auth_doc_type = auth_doc_type.into();
        self
    }

    fn current(&self) -> Option<OAuthToken> {
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Authenticator for TokenAuthenticator {
    fn auth_doc_type(&self) -> &str {
        &self.auth_doc_type
    }

    fn initiate_pairing(&self, responder: AuthResponder) {
        match self.current() {
            Some(token) => responder.authenticated(token),
            None => responder.failed("no token available (pairing was removed)"),
        }
    }

    fn validate_token(&self) -> Option<OAuthToken> {
        self.current()
    }

    fn remove_pairing(&self) {
        tracing::debug!("Forgetting stored token");
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}
