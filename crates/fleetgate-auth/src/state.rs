//! Client-side authentication state machine
//!
//! A pure reducer: `transition(state, event)` never fails. Events that make
//! no sense in the current state leave it unchanged, except that logout and
//! session expiry always return to `Anonymous`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AuthState {
    #[default]
    Anonymous,
    Authenticating,
    AwaitingTwoFactor {
        session_id: String,
    },
    Authenticated {
        session_id: String,
        user_id: Uuid,
    },
    Failed {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuthEvent {
    LoginStarted,
    LoginSucceeded { session_id: String, user_id: Uuid },
    TwoFactorRequired { session_id: String },
    TwoFactorVerified { user_id: Uuid },
    LoginFailed { reason: String },
    LoggedOut,
    SessionExpired,
}

impl AuthState {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated { .. })
    }

    /// Session id held in this state, if any
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::AwaitingTwoFactor { session_id } | Self::Authenticated { session_id, .. } => {
                Some(session_id)
            }
            _ => None,
        }
    }
}

/// Next state for `event`
pub fn transition(state: AuthState, event: AuthEvent) -> AuthState {
    use AuthEvent as E;
    use AuthState as S;

    match (state, event) {
        (_, E::LoggedOut) | (_, E::SessionExpired) => S::Anonymous,

        (S::Anonymous | S::Failed { .. }, E::LoginStarted) => S::Authenticating,

        (S::Authenticating, E::LoginSucceeded { session_id, user_id }) => {
            S::Authenticated { session_id, user_id }
        }
        (S::Authenticating, E::TwoFactorRequired { session_id }) => {
            S::AwaitingTwoFactor { session_id }
        }
        (S::Authenticating | S::AwaitingTwoFactor { .. }, E::LoginFailed { reason }) => {
            S::Failed { reason }
        }

        (S::AwaitingTwoFactor { session_id }, E::TwoFactorVerified { user_id }) => {
            S::Authenticated { session_id, user_id }
        }

        (state, event) => {
            tracing::debug!(?state, ?event, "Ignoring auth event invalid for current state");
            state
        }
    }
}
