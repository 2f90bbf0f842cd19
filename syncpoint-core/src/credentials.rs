//! Pairing credentials for Syncpoint.
//!
//! This module provides:
//! - [`OAuthToken`]: the opaque `(token, token_type)` pair an authenticator
//!   produces, stored in the session document under `oauth_creds`
//! - Session key derivation: the server-side pull filter is keyed by a digest
//!   of the token so the raw token never appears in replication parameters
//!
//! The pairing flow:
//! 1. The application hands an authenticator to the client
//! 2. The authenticator produces an `OAuthToken` (or fails)
//! 3. The token is written into the session document and pushed to the server
//! 4. The server activates the session and assigns a user id

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Maximum accepted token length, in bytes.
pub const MAX_TOKEN_LEN: usize = 8 * 1024;

/// Domain separator for session key derivation.
const SESSION_KEY_CONTEXT: &[u8] = b"syncpoint-session-key-v1";

/// Error type for credential construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialsError {
    /// The token is empty.
    EmptyToken,
    /// The token type is empty.
    EmptyTokenType,
    /// The token exceeds [`MAX_TOKEN_LEN`].
    TokenTooLong(usize),
}

impl std::fmt::Display for CredentialsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialsError::EmptyToken => write!(f, "auth token is empty"),
            CredentialsError::EmptyTokenType => write!(f, "auth token type is empty"),
            CredentialsError::TokenTooLong(len) => {
                write!(f, "auth token too long ({} bytes, max {})", len, MAX_TOKEN_LEN)
            }
        }
    }
}

impl std::error::Error for CredentialsError {}

/// An opaque authentication token plus its type (e.g. `"oauth"`, `"fb_access_token"`).
///
/// Deserialization applies the same checks as [`OAuthToken::new`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(try_from = "RawOAuthToken")]
pub struct OAuthToken {
    token_type: String,
    token: String,
}

impl OAuthToken {
    /// Create a token, rejecting empty or oversized values.
    pub fn new(token: impl Into<String>, token_type: impl Into<String>) -> Result<Self, CredentialsError> {
        let token = token.into();
        let token_type = token_type.into();
        if token.is_empty() {
            return Err(CredentialsError::EmptyToken);
        }
        if token_type.is_empty() {
            return Err(CredentialsError::EmptyTokenType);
        }
        if token.len() > MAX_TOKEN_LEN {
            return Err(CredentialsError::TokenTooLong(token.len()));
        }
        Ok(Self { token_type, token })
    }

    /// The token type.
    pub fn token_type(&self) -> &str {
        &self.token_type
    }

    /// The raw token. Avoid logging this.
    pub fn expose_token(&self) -> &str {
        &self.token
    }

    /// Derive the key the server uses to find this session.
    ///
    /// Hex-encoded SHA-256 over a context string, the token type and the token.
    pub fn session_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(SESSION_KEY_CONTEXT);
        hasher.update(self.token_type.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.token.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Unchecked wire form of [`OAuthToken`].
#[derive(Deserialize, Zeroize, ZeroizeOnDrop)]
struct RawOAuthToken {
    token_type: String,
    token: String,
}

impl TryFrom<RawOAuthToken> for OAuthToken {
    type Error = CredentialsError;

    fn try_from(mut raw: RawOAuthToken) -> Result<Self, Self::Error> {
        OAuthToken::new(
            std::mem::take(&mut raw.token),
            std::mem::take(&mut raw.token_type),
        )
    }
}

// Intentionally opaque debug to avoid logging tokens
impl std::fmt::Debug for OAuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OAuthToken({}, [REDACTED])", self.token_type)
    }
}
