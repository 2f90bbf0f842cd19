//! Mock authenticator for testing.
//!
//! Captures responders so tests decide when and how each attempt resolves,
//! and counts every call the client makes.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use syncpoint_core::OAuthToken;

use super::{AuthResponder, Authenticator};

/// Mock authenticator for testing.
///
/// Cloning shares state, so a test can keep one clone while the client
/// holds another.
#[derive(Debug, Clone, Default)]
pub struct MockAuthenticator {
    inner: Arc<Mutex<MockAuthenticatorInner>>,
}

#[derive(Debug, Default)]
struct MockAuthenticatorInner {
    stored_token: Option<OAuthToken>,
    respond_with: Option<Result<OAuthToken, String>>,
    pending: Vec<AuthResponder>,
    accept_urls: bool,
    opened_urls: Vec<String>,
    pairing_calls: usize,
    remove_calls: usize,
}

impl MockAuthenticator {
    /// Create a mock that holds every responder until told otherwise.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockAuthenticatorInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Report `token` from `validate_token()`, skipping the pairing flow.
    pub fn with_stored_token(self, token: OAuthToken) -> Self {
        self.lock().stored_token = Some(token);
        self
    }

    /// Answer every pairing request immediately with `token`.
    pub fn responding_with(self, token: OAuthToken) -> Self {
        self.lock().respond_with = Some(Ok(token));
        self
    }

    /// Fail every pairing request immediately with `error`.
    pub fn failing_with(self, error: &str) -> Self {
        self.lock().respond_with = Some(Err(error.to_string()));
        self
    }

    /// Recognise every URL passed to `handle_open_url()`.
    pub fn accepting_urls(self) -> Self {
        self.lock().accept_urls = true;
        self
    }

    /// Take the oldest captured responder.
    pub fn take_responder(&self) -> Option<AuthResponder> {
        let mut inner = self.lock();
        if inner.pending.is_empty() {
            None
        } else {
            Some(inner.pending.remove(0))
        }
    }

    /// Number of captured, unanswered responders.
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Number of `initiate_pairing()` calls.
    pub fn pairing_calls(&self) -> usize {
        self.lock().pairing_calls
    }

    /// Number of `remove_pairing()` calls.
    pub fn remove_pairing_calls(&self) -> usize {
        self.lock().remove_calls
    }

    /// URLs passed to `handle_open_url()`.
    pub fn opened_urls(&self) -> Vec<String> {
        self.lock().opened_urls.clone()
    }
}

impl Authenticator for MockAuthenticator {
    fn auth_doc_type(&self) -> &str {
        "session-mock"
    }

    fn initiate_pairing(&self, responder: AuthResponder) {
        let answer = {
            let mut inner = self.lock();
            inner.pairing_calls += 1;
            match inner.respond_with.clone() {
                Some(answer) => answer,
                None => {
                    inner.pending.push(responder);
                    return;
                }
            }
        };
        // Answer outside the lock
        match answer {
            Ok(token) => responder.authenticated(token),
            Err(error) => responder.failed(error),
        }
    }

    fn validate_token(&self) -> Option<OAuthToken> {
        self.lock().stored_token.clone()
    }

    fn remove_pairing(&self) {
        let dropped = {
            let mut inner = self.lock();
            inner.remove_calls += 1;
            inner.stored_token = None;
            std::mem::take(&mut inner.pending)
        };
        drop(dropped);
    }

    fn handle_open_url(&self, url: &str) -> bool {
        let mut inner = self.lock();
        inner.opened_urls.push(url.to_string());
        inner.accept_urls
    }
}
