//! Call lifecycle state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallingState {
    #[default]
    Idle,
    Joining,
    Joined,
    Ringing,
    Reconnecting,
    /// Automatic recovery gave up. Only a manual join leaves this state.
    ReconnectingFailed,
    Migrating,
    Offline,
    Left,
}

impl CallingState {
    pub fn is_left(&self) -> bool {
        matches!(self, Self::Left)
    }

    /// Joined, or on the way back to joined without user action.
    pub fn is_in_session(&self) -> bool {
        matches!(self, Self::Joined | Self::Migrating | Self::Reconnecting)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Joining => "joining",
            Self::Joined => "joined",
            Self::Ringing => "ringing",
            Self::Reconnecting => "reconnecting",
            Self::ReconnectingFailed => "reconnecting-failed",
            Self::Migrating => "migrating",
            Self::Offline => "offline",
            Self::Left => "left",
        }
    }
}

impl std::fmt::Display for CallingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events that move a call between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTransition {
    /// Explicit join or get-or-create request.
    Join,
    /// The join attempt gave up.
    JoinFailed,
    /// Incoming ring, or an outgoing ring was sent.
    Ring,
    /// A session was established.
    SessionEstablished,
    /// The session transport was lost and recovery starts.
    ConnectionLost,
    /// Recovery restored a resynchronized session.
    Restored,
    /// Recovery exhausted its retry budget.
    RetriesExhausted,
    MigrationStarted,
    MigrationCompleted,
    /// The replacement session failed; the old one is kept.
    MigrationAborted,
    /// No network connectivity at all.
    NetworkLost,
    Leave,
}

#[derive(Debug, Default)]
pub struct CallStateMachine {
    state: CallingState,
}

impl CallStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CallingState {
        self.state
    }

    /// Apply a state transition. Returns the new state, or an error (leaving
    /// the state untouched) if the transition is invalid.
    pub fn apply_transition(
        &mut self,
        transition: CallTransition,
    ) -> Result<CallingState, InvalidTransition> {
        use CallTransition as T;
        use CallingState as S;

        let new_state = match (self.state, transition) {
            (_, T::Leave) => S::Left,
            (S::Left, _) => return Err(self.invalid(transition)),
            (_, T::NetworkLost) => S::Offline,

            (S::Idle | S::Ringing | S::ReconnectingFailed, T::Join) => S::Joining,
            (S::Joining, T::JoinFailed) => S::Idle,
            (S::Idle, T::Ring) => S::Ringing,
            (S::Ringing, T::Ring) => S::Ringing,
            (S::Joining, T::SessionEstablished) => S::Joined,

            (S::Joining | S::Joined | S::Migrating | S::Offline, T::ConnectionLost) => S::Reconnecting,
            (S::Reconnecting, T::Restored) => S::Joined,
            (S::Reconnecting, T::RetriesExhausted) => S::ReconnectingFailed,

            (S::Joined, T::MigrationStarted) => S::Migrating,
            (S::Migrating, T::MigrationCompleted | T::MigrationAborted) => S::Joined,

            _ => return Err(self.invalid(transition)),
        };
        self.state = new_state;
        Ok(new_state)
    }

    fn invalid(&self, transition: CallTransition) -> InvalidTransition {
        InvalidTransition {
            current_state: self.state,
            attempted: transition,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub current_state: CallingState,
    pub attempted: CallTransition,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {:?} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}
