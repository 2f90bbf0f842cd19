//! Authenticator abstraction for Syncpoint.
//!
//! An authenticator turns user interaction (an OAuth flow, a stored token,
//! a test fixture) into an [`OAuthToken`]. The client asks for one with
//! [`Authenticator::initiate_pairing`], handing over an [`AuthResponder`]
//! that the authenticator must eventually consume, from any thread.

mod mock;
mod token;

pub use mock::MockAuthenticator;
pub use token::TokenAuthenticator;

use std::fmt;
use syncpoint_core::OAuthToken;
use tokio::sync::mpsc;

use crate::coordinator::Command;

/// Produces authentication tokens for pairing.
pub trait Authenticator: Send + Sync + 'static {
    /// Value written to the session's `auth_type` field.
    fn auth_doc_type(&self) -> &str;

    /// Start obtaining a token and report through `responder`.
    ///
    /// Must not block; long-running flows should move the responder to
    /// another task.
    fn initiate_pairing(&self, responder: AuthResponder);

    /// A previously obtained token that is still usable, if any.
    fn validate_token(&self) -> Option<OAuthToken> {
        None
    }

    /// Forget any stored credentials.
    fn remove_pairing(&self) {}

    /// Handle a URL opened by the platform (OAuth redirect). Returns whether
    /// the URL was recognised.
    fn handle_open_url(&self, _url: &str) -> bool {
        false
    }
}

/// One-shot callback for a pairing attempt.
///
/// Consumed by [`authenticated`](Self::authenticated) or
/// [`failed`](Self::failed). Dropping it unused reports a failure, so every
/// attempt produces exactly one outcome.
pub struct AuthResponder {
    attempt: u64,
    commands: Option<mpsc::UnboundedSender<Command>>,
}

impl AuthResponder {
    pub(crate) fn new(attempt: u64, commands: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            attempt,
            commands: Some(commands),
        }
    }

    /// The attempt this responder answers.
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Report a token.
    pub fn authenticated(mut self, token: OAuthToken) {
        self.send(Ok(token));
    }

    /// Report a raw `(token, token_type)` pair, failing if it is unusable.
    pub fn authenticated_with(self, token: &str, token_type: &str) {
        match OAuthToken::new(token, token_type) {
            Ok(token) => self.authenticated(token),
            Err(e) => self.failed(e.to_string()),
        }
    }

    /// Report a failure.
    pub fn failed(mut self, error: impl Into<String>) {
        self.send(Err(error.into()));
    }

    fn send(&mut self, result: Result<OAuthToken, String>) {
        if let Some(commands) = self.commands.take() {
            // A stopped client no longer cares
            let _ = commands.send(Command::AuthResult {
                attempt: self.attempt,
                result,
            });
        }
    }
}

impl Drop for AuthResponder {
    fn drop(&mut self) {
        if self.commands.is_some() {
            tracing::warn!("Auth responder for attempt {} dropped unused", self.attempt);
            self.send(Err("authenticator abandoned the pairing attempt".to_string()));
        }
    }
}

impl fmt::Debug for AuthResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthResponder")
            .field("attempt", &self.attempt)
            .field("answered", &self.commands.is_none())
            .finish()
    }
}
