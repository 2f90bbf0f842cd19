//! Client configuration.
//!
//! Configuration can be built in code (`ClientConfig::default()` plus the
//! `with_*` methods) or loaded from a TOML file. Every field has a default,
//! so a file only needs the values it changes:
//!
//! ```toml
//! server_url = "https://sync.example.com"
//! control_database = "syncpoint_control"
//! max_deferred_requests = 32
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};
use syncpoint_types::{DatabaseName, DocId};

/// Event slots kept free beyond one install completion per deferred request,
/// for state changes and errors.
pub const EVENT_HEADROOM: usize = 16;

/// Configuration for a [`SyncpointClient`](crate::SyncpointClient).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Base URL of the Syncpoint-enabled server (default: http://127.0.0.1:5984).
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Local control database holding the session and channel documents
    /// (default: syncpoint_control).
    #[serde(default = "default_control_database")]
    pub control_database: String,
    /// Remote database the session is exchanged through before the server
    /// assigns a control database (default: sp_handshake).
    #[serde(default = "default_handshake_database")]
    pub handshake_database: String,
    /// Fixed id of the session document (default: syncpoint-session).
    #[serde(default = "default_session_doc_id")]
    pub session_doc_id: String,
    /// Prefix for generated local database names (default: channel).
    #[serde(default = "default_local_database_prefix")]
    pub local_database_prefix: String,
    /// Maximum install requests held while the session is not ready (default: 64).
    #[serde(default = "default_max_deferred_requests")]
    pub max_deferred_requests: usize,
    /// Buffer size of the client event stream (default: 256). Must be at
    /// least `max_deferred_requests + EVENT_HEADROOM`.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

// Default value functions
fn default_server_url() -> String {
    "http://127.0.0.1:5984".to_string()
}

fn default_control_database() -> String {
    "syncpoint_control".to_string()
}

fn default_handshake_database() -> String {
    "sp_handshake".to_string()
}

fn default_session_doc_id() -> String {
    "syncpoint-session".to_string()
}

fn default_local_database_prefix() -> String {
    "channel".to_string()
}

fn default_max_deferred_requests() -> usize {
    64
}

fn default_event_capacity() -> usize {
    256
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            control_database: default_control_database(),
            handshake_database: default_handshake_database(),
            session_doc_id: default_session_doc_id(),
            local_database_prefix: default_local_database_prefix(),
            max_deferred_requests: default_max_deferred_requests(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed. The result is
    /// not validated; call [`validate`](Self::validate).
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Set the server URL.
    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = url.into();
        self
    }

    /// Set the local control database name.
    pub fn with_control_database(mut self, name: impl Into<String>) -> Self {
        self.control_database = name.into();
        self
    }

    /// Set the remote handshake database name.
    pub fn with_handshake_database(mut self, name: impl Into<String>) -> Self {
        self.handshake_database = name.into();
        self
    }

    /// Set the session document id.
    pub fn with_session_doc_id(mut self, id: impl Into<String>) -> Self {
        self.session_doc_id = id.into();
        self
    }

    /// Set the prefix for generated local database names.
    pub fn with_local_database_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.local_database_prefix = prefix.into();
        self
    }

    /// Set the deferred request limit.
    pub fn with_max_deferred_requests(mut self, max: usize) -> Self {
        self.max_deferred_requests = max;
        self
    }

    /// Set the event stream buffer size.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// The control database name, validated.
    pub fn control_database(&self) -> Result<DatabaseName, ConfigError> {
        DatabaseName::parse(self.control_database.as_str()).map_err(|e| ConfigError::Invalid {
            field: "control_database",
            reason: e.to_string(),
        })
    }

    /// The session document id.
    pub fn session_doc_id(&self) -> DocId {
        DocId::new(self.session_doc_id.as_str())
    }

    /// Check every field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason: &str| ConfigError::Invalid {
            field,
            reason: reason.to_string(),
        };

        if !(self.server_url.starts_with("http://") || self.server_url.starts_with("https://")) {
            return Err(invalid("server_url", "must start with http:// or https://"));
        }
        self.control_database()?;
        if self.handshake_database.is_empty() {
            return Err(invalid("handshake_database", "must not be empty"));
        }
        if self.session_doc_id.is_empty() {
            return Err(invalid("session_doc_id", "must not be empty"));
        }
        // Generated names are "<prefix>-<uuid>"; a prefix too long for that fails here
        DatabaseName::generate(self.local_database_prefix.as_str()).map_err(|e| {
            ConfigError::Invalid {
                field: "local_database_prefix",
                reason: e.to_string(),
            }
        })?;
        if self.max_deferred_requests == 0 {
            return Err(invalid("max_deferred_requests", "must be at least 1"));
        }
        if self.event_capacity < self.max_deferred_requests.saturating_add(EVENT_HEADROOM) {
            return Err(ConfigError::Invalid {
                field: "event_capacity",
                reason: format!(
                    "must be at least max_deferred_requests + {} ({})",
                    EVENT_HEADROOM,
                    self.max_deferred_requests.saturating_add(EVENT_HEADROOM)
                ),
            });
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// A field has an unusable value.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}
