//! Client lifecycle state machine for Syncpoint.
//!
//! This module provides a pure, side-effect-free state machine for the
//! pairing lifecycle. The state machine takes events as input and produces
//! a new state plus a list of actions to execute.
//!
//! The actual I/O (writing the session document, starting replications,
//! calling the authenticator) is performed by syncpoint-client, not by this
//! module. Every event is accepted in every state; events that make no sense
//! in the current state leave it unchanged and produce no actions.

use std::fmt;

use syncpoint_types::{Direction, ErrorKind, ErrorReport};

use crate::credentials::OAuthToken;

/// Client lifecycle state - NO I/O, just state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    /// No session and no pairing in progress.
    Unauthenticated,
    /// Waiting for the authenticator to produce a token.
    Authenticating {
        /// Attempt whose callback is awaited; others are ignored.
        attempt: u64,
    },
    /// Token stored; pulling and then pushing the session document.
    Activating {
        /// Whether the first pull completed and the push was started.
        push_started: bool,
    },
    /// Both session replications are running; waiting for the server to
    /// activate the session.
    UpdatingSession,
    /// Session activated by the server.
    Ready,
    /// Authentication, activation or a session replication failed.
    HasError {
        /// What went wrong.
        error: ErrorReport,
    },
}

impl ClientState {
    /// Create a new state machine in the Unauthenticated state.
    pub fn new() -> Self {
        Self::Unauthenticated
    }

    /// Process an event and return the new state plus actions to execute.
    ///
    /// This is a pure function - no side effects. The caller (syncpoint-client)
    /// is responsible for executing the returned actions in order.
    pub fn on_event(self, event: Event) -> (Self, Vec<Action>) {
        match (self, event) {
            // Pairing removal is accepted from anywhere
            (_, Event::RemovePairingRequested) => (
                Self::Unauthenticated,
                vec![Action::StopSessionReplications, Action::ClearPairing],
            ),

            // From Unauthenticated
            (Self::Unauthenticated, Event::SessionRestored { readiness }) => match readiness {
                SessionReadiness::Active => (
                    Self::UpdatingSession,
                    vec![
                        Action::StartSessionPull,
                        Action::StartSessionPush,
                        Action::CheckSession,
                    ],
                ),
                SessionReadiness::Pending => (
                    Self::Activating {
                        push_started: false,
                    },
                    vec![Action::StartSessionPull],
                ),
                SessionReadiness::Rejected(message) => {
                    let error = ErrorReport::new(ErrorKind::ServerRejected, message);
                    (
                        Self::HasError {
                            error: error.clone(),
                        },
                        vec![Action::EmitError(error)],
                    )
                }
            },
            (Self::Unauthenticated, Event::AuthenticateRequested { attempt }) => (
                Self::Authenticating { attempt },
                vec![Action::BeginAuthentication { attempt }],
            ),

            // From HasError: only a fresh authenticate recovers
            (Self::HasError { .. }, Event::AuthenticateRequested { attempt }) => (
                Self::Authenticating { attempt },
                vec![
                    Action::StopSessionReplications,
                    Action::BeginAuthentication { attempt },
                ],
            ),

            // From Authenticating
            (Self::Authenticating { attempt }, Event::Authenticated { attempt: got, token })
                if attempt == got =>
            {
                (
                    Self::Activating {
                        push_started: false,
                    },
                    vec![Action::SaveCredentials { token }, Action::StartSessionPull],
                )
            }
            (Self::Authenticating { attempt }, Event::AuthenticationFailed { attempt: got, error })
                if attempt == got =>
            {
                fail(ErrorKind::AuthenticationFailed, error, false)
            }

            // From Activating
            (
                Self::Activating {
                    push_started: false,
                },
                Event::PullCompleted,
            ) => (
                Self::Activating { push_started: true },
                vec![Action::StartSessionPush],
            ),
            (Self::Activating { push_started: true }, Event::PushCompleted) => {
                (Self::UpdatingSession, vec![Action::CheckSession])
            }

            // From UpdatingSession
            (Self::UpdatingSession, Event::SessionChanged { readiness }) => match readiness {
                SessionReadiness::Active => (
                    Self::Ready,
                    vec![Action::ReplayDeferred, Action::SyncInstallations],
                ),
                SessionReadiness::Pending => (Self::UpdatingSession, vec![]),
                SessionReadiness::Rejected(message) => {
                    fail(ErrorKind::ServerRejected, message, true)
                }
            },

            // Server rejection is observed in every post-token state
            (
                Self::Activating { .. } | Self::Ready,
                Event::SessionChanged {
                    readiness: SessionReadiness::Rejected(message),
                },
            ) => fail(ErrorKind::ServerRejected, message, true),

            // Session replication failures are fatal to the session
            (
                Self::Activating { .. } | Self::UpdatingSession | Self::Ready,
                Event::ReplicationFailed { direction, error },
            ) => fail(
                ErrorKind::ReplicationFailed,
                format!("session {} failed: {}", direction, error),
                true,
            ),

            // Store failures while the session is being written or synced
            (
                Self::Authenticating { .. }
                | Self::Activating { .. }
                | Self::UpdatingSession
                | Self::Ready,
                Event::StoreFailed { error },
            ) => fail(ErrorKind::StoreFailure, error, true),

            // Invalid or stale events - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    /// Check if the session is ready for channel operations.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Check if the client is in the error state.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::HasError { .. })
    }

    /// Check if a pairing is under way but not yet ready.
    pub fn is_pairing(&self) -> bool {
        matches!(
            self,
            Self::Authenticating { .. } | Self::Activating { .. } | Self::UpdatingSession
        )
    }

    /// Short state name, without associated data.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "Unauthenticated",
            Self::Authenticating { .. } => "Authenticating",
            Self::Activating { .. } => "Activating",
            Self::UpdatingSession => "UpdatingSession",
            Self::Ready => "Ready",
            Self::HasError { .. } => "HasError",
        }
    }
}

impl Default for ClientState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HasError { error } => write!(f, "HasError({})", error),
            other => f.write_str(other.name()),
        }
    }
}

fn fail(kind: ErrorKind, message: String, stop_replications: bool) -> (ClientState, Vec<Action>) {
    let error = ErrorReport::new(kind, message);
    let mut actions = Vec::with_capacity(2);
    if stop_replications {
        actions.push(Action::StopSessionReplications);
    }
    actions.push(Action::EmitError(error.clone()));
    (ClientState::HasError { error }, actions)
}

/// What the session document says about activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionReadiness {
    /// No user id yet and no error.
    Pending,
    /// The server assigned a user id and reported no error.
    Active,
    /// The server wrote an error into the session.
    Rejected(String),
}

/// Events that can occur in the client lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A session document with credentials was found at startup.
    SessionRestored {
        /// Readiness of the stored session.
        readiness: SessionReadiness,
    },
    /// The application asked to authenticate.
    AuthenticateRequested {
        /// Number of the new attempt.
        attempt: u64,
    },
    /// The authenticator produced a token.
    Authenticated {
        /// Attempt the callback belongs to.
        attempt: u64,
        /// The token.
        token: OAuthToken,
    },
    /// The authenticator gave up.
    AuthenticationFailed {
        /// Attempt the callback belongs to.
        attempt: u64,
        /// Why.
        error: String,
    },
    /// The session pull caught up.
    PullCompleted,
    /// The session push caught up.
    PushCompleted,
    /// A session replication failed.
    ReplicationFailed {
        /// Which one.
        direction: Direction,
        /// Error from the store.
        error: String,
    },
    /// The session document changed (or was re-read).
    SessionChanged {
        /// Readiness after the change.
        readiness: SessionReadiness,
    },
    /// Writing or reading the session document failed.
    StoreFailed {
        /// Error from the store.
        error: String,
    },
    /// The application asked to forget the pairing.
    RemovePairingRequested,
}

/// Actions to be executed by the syncpoint-client.
///
/// These are instructions, not side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Ask the authenticator for a token on behalf of `attempt`.
    BeginAuthentication {
        /// Attempt number the callback must carry.
        attempt: u64,
    },
    /// Write the token into the session document (creating it if needed).
    SaveCredentials {
        /// The token.
        token: OAuthToken,
    },
    /// Start pulling the session from the remote control database.
    StartSessionPull,
    /// Start pushing the session to the remote control database.
    StartSessionPush,
    /// Stop both session replications.
    StopSessionReplications,
    /// Re-read the session document and report its readiness.
    CheckSession,
    /// Replay the deferred install requests in FIFO order.
    ReplayDeferred,
    /// Start replication for every valid local installation.
    SyncInstallations,
    /// Delete the control documents, drop deferred requests, and tell the
    /// authenticator to forget its state.
    ClearPairing,
    /// Report an error to observers.
    EmitError(ErrorReport),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> OAuthToken {
        OAuthToken::new("tok", "oauth").unwrap()
    }

    fn has_error(state: &ClientState, kind: ErrorKind) -> bool {
        matches!(state, ClientState::HasError { error } if error.kind == kind)
    }

    // =========================================================================
    // Happy path
    // =========================================================================

    #[test]
    fn starts_unauthenticated() {
        let state = ClientState::new();
        assert!(matches!(state, ClientState::Unauthenticated));
        assert_eq!(state.name(), "Unauthenticated");
    }

    #[test]
    fn authenticate_request_transitions_to_authenticating() {
        let (state, actions) =
            ClientState::Unauthenticated.on_event(Event::AuthenticateRequested { attempt: 1 });

        assert_eq!(state, ClientState::Authenticating { attempt: 1 });
        assert_eq!(actions, vec![Action::BeginAuthentication { attempt: 1 }]);
    }

    #[test]
    fn token_saves_credentials_and_starts_pull() {
        let state = ClientState::Authenticating { attempt: 1 };
        let (state, actions) = state.on_event(Event::Authenticated {
            attempt: 1,
            token: token(),
        });

        assert_eq!(
            state,
            ClientState::Activating {
                push_started: false
            }
        );
        assert_eq!(
            actions,
            vec![
                Action::SaveCredentials { token: token() },
                Action::StartSessionPull
            ]
        );
    }

    #[test]
    fn first_pull_completion_starts_push() {
        let state = ClientState::Activating {
            push_started: false,
        };
        let (state, actions) = state.on_event(Event::PullCompleted);

        assert_eq!(state, ClientState::Activating { push_started: true });
        assert_eq!(actions, vec![Action::StartSessionPush]);
    }

    #[test]
    fn repeated_pull_completion_does_not_restart_push() {
        let state = ClientState::Activating { push_started: true };
        let (state, actions) = state.on_event(Event::PullCompleted);

        assert_eq!(state, ClientState::Activating { push_started: true });
        assert!(actions.is_empty());
    }

    #[test]
    fn push_completion_moves_to_updating_session() {
        let state = ClientState::Activating { push_started: true };
        let (state, actions) = state.on_event(Event::PushCompleted);

        assert_eq!(state, ClientState::UpdatingSession);
        assert_eq!(actions, vec![Action::CheckSession]);
    }

    #[test]
    fn push_completion_before_push_started_is_ignored() {
        let state = ClientState::Activating {
            push_started: false,
        };
        let (state, actions) = state.on_event(Event::PushCompleted);

        assert!(matches!(state, ClientState::Activating { push_started: false }));
        assert!(actions.is_empty());
    }

    #[test]
    fn active_session_becomes_ready_and_replays() {
        let (state, actions) = ClientState::UpdatingSession.on_event(Event::SessionChanged {
            readiness: SessionReadiness::Active,
        });

        assert_eq!(state, ClientState::Ready);
        assert_eq!(
            actions,
            vec![Action::ReplayDeferred, Action::SyncInstallations]
        );
    }

    #[test]
    fn pending_session_keeps_updating() {
        let (state, actions) = ClientState::UpdatingSession.on_event(Event::SessionChanged {
            readiness: SessionReadiness::Pending,
        });

        assert_eq!(state, ClientState::UpdatingSession);
        assert!(actions.is_empty());
    }

    #[test]
    fn full_pairing_sequence() {
        let events = vec![
            Event::AuthenticateRequested { attempt: 1 },
            Event::Authenticated {
                attempt: 1,
                token: token(),
            },
            Event::PullCompleted,
            Event::PushCompleted,
            Event::SessionChanged {
                readiness: SessionReadiness::Active,
            },
        ];

        let mut state = ClientState::new();
        let mut names = vec![state.name()];
        for event in events {
            let (next, _) = state.on_event(event);
            if next.name() != *names.last().unwrap() {
                names.push(next.name());
            }
            state = next;
        }

        assert_eq!(
            names,
            vec![
                "Unauthenticated",
                "Authenticating",
                "Activating",
                "UpdatingSession",
                "Ready"
            ]
        );
    }

    // =========================================================================
    // Attempts and stale callbacks
    // =========================================================================

    #[test]
    fn stale_attempt_callback_is_ignored() {
        let state = ClientState::Authenticating { attempt: 2 };
        let (state, actions) = state.on_event(Event::Authenticated {
            attempt: 1,
            token: token(),
        });

        assert_eq!(state, ClientState::Authenticating { attempt: 2 });
        assert!(actions.is_empty());
    }

    #[test]
    fn second_callback_after_token_is_ignored() {
        let (state, _) = ClientState::Authenticating { attempt: 1 }.on_event(Event::Authenticated {
            attempt: 1,
            token: token(),
        });
        let (state, actions) = state.on_event(Event::AuthenticationFailed {
            attempt: 1,
            error: "late".into(),
        });

        assert!(matches!(state, ClientState::Activating { .. }));
        assert!(actions.is_empty());
    }

    #[test]
    fn authenticate_while_pairing_is_a_noop() {
        let state = ClientState::Activating { push_started: true };
        let (state, actions) = state.on_event(Event::AuthenticateRequested { attempt: 5 });

        assert_eq!(state, ClientState::Activating { push_started: true });
        assert!(actions.is_empty());
    }

    // =========================================================================
    // Errors
    // =========================================================================

    #[test]
    fn authentication_failure_moves_to_error() {
        let state = ClientState::Authenticating { attempt: 1 };
        let (state, actions) = state.on_event(Event::AuthenticationFailed {
            attempt: 1,
            error: "denied".into(),
        });

        assert!(has_error(&state, ErrorKind::AuthenticationFailed));
        assert_eq!(actions.len(), 1);
        assert!(matches!(&actions[0], Action::EmitError(r) if r.message == "denied"));
    }

    #[test]
    fn server_rejection_in_updating_session() {
        let (state, actions) = ClientState::UpdatingSession.on_event(Event::SessionChanged {
            readiness: SessionReadiness::Rejected("rejected".into()),
        });

        assert!(has_error(&state, ErrorKind::ServerRejected));
        assert_eq!(actions[0], Action::StopSessionReplications);
        assert!(matches!(&actions[1], Action::EmitError(r) if r.kind == ErrorKind::ServerRejected));
    }

    #[test]
    fn server_rejection_after_ready() {
        let (state, _) = ClientState::Ready.on_event(Event::SessionChanged {
            readiness: SessionReadiness::Rejected("revoked".into()),
        });
        assert!(has_error(&state, ErrorKind::ServerRejected));
    }

    #[test]
    fn ready_ignores_active_session_changes() {
        let (state, actions) = ClientState::Ready.on_event(Event::SessionChanged {
            readiness: SessionReadiness::Active,
        });
        assert_eq!(state, ClientState::Ready);
        assert!(actions.is_empty());
    }

    #[test]
    fn session_replication_failure_moves_to_error() {
        let state = ClientState::Activating {
            push_started: false,
        };
        let (state, actions) = state.on_event(Event::ReplicationFailed {
            direction: Direction::Pull,
            error: "unreachable".into(),
        });

        assert!(has_error(&state, ErrorKind::ReplicationFailed));
        assert!(actions.contains(&Action::StopSessionReplications));
    }

    #[test]
    fn store_failure_while_authenticating_moves_to_error() {
        let state = ClientState::Authenticating { attempt: 1 };
        let (state, _) = state.on_event(Event::StoreFailed {
            error: "disk full".into(),
        });
        assert!(has_error(&state, ErrorKind::StoreFailure));
    }

    #[test]
    fn error_is_sticky_until_authenticate() {
        let state = ClientState::HasError {
            error: ErrorReport::new(ErrorKind::ServerRejected, "rejected"),
        };
        let (state, actions) = state.on_event(Event::SessionChanged {
            readiness: SessionReadiness::Active,
        });
        assert!(state.is_error());
        assert!(actions.is_empty());

        let (state, actions) = state.on_event(Event::AuthenticateRequested { attempt: 2 });
        assert_eq!(state, ClientState::Authenticating { attempt: 2 });
        assert_eq!(
            actions,
            vec![
                Action::StopSessionReplications,
                Action::BeginAuthentication { attempt: 2 }
            ]
        );
    }

    // =========================================================================
    // Restore and removal
    // =========================================================================

    #[test]
    fn restore_active_session_resumes_both_replications() {
        let (state, actions) = ClientState::Unauthenticated.on_event(Event::SessionRestored {
            readiness: SessionReadiness::Active,
        });

        assert_eq!(state, ClientState::UpdatingSession);
        assert_eq!(
            actions,
            vec![
                Action::StartSessionPull,
                Action::StartSessionPush,
                Action::CheckSession
            ]
        );
    }

    #[test]
    fn restore_pending_session_resumes_activation() {
        let (state, actions) = ClientState::Unauthenticated.on_event(Event::SessionRestored {
            readiness: SessionReadiness::Pending,
        });

        assert!(matches!(state, ClientState::Activating { push_started: false }));
        assert_eq!(actions, vec![Action::StartSessionPull]);
    }

    #[test]
    fn restore_rejected_session_is_an_error() {
        let (state, _) = ClientState::Unauthenticated.on_event(Event::SessionRestored {
            readiness: SessionReadiness::Rejected("bad token".into()),
        });
        assert!(has_error(&state, ErrorKind::ServerRejected));
    }

    #[test]
    fn remove_pairing_from_every_state() {
        let states = vec![
            ClientState::Unauthenticated,
            ClientState::Authenticating { attempt: 1 },
            ClientState::Activating { push_started: true },
            ClientState::UpdatingSession,
            ClientState::Ready,
            ClientState::HasError {
                error: ErrorReport::new(ErrorKind::StoreFailure, "x"),
            },
        ];

        for state in states {
            let (next, actions) = state.on_event(Event::RemovePairingRequested);
            assert_eq!(next, ClientState::Unauthenticated);
            assert_eq!(
                actions,
                vec![Action::StopSessionReplications, Action::ClearPairing]
            );
        }
    }

    #[test]
    fn display_includes_error() {
        let state = ClientState::HasError {
            error: ErrorReport::new(ErrorKind::ServerRejected, "rejected"),
        };
        assert_eq!(state.to_string(), "HasError(server rejected: rejected)");
        assert_eq!(ClientState::Ready.to_string(), "Ready");
    }
}
