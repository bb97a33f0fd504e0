//! Session lifecycle and call states.

use core::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of a client session.
///
/// The state only ever moves forward: once a session is `Failed` or
/// `Stopped` it never leaves that state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Connected = 1,
    Failed = 2,
    Stopped = 3,
}

impl SessionState {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Connecting),
            1 => Some(Self::Connected),
            2 => Some(Self::Failed),
            3 => Some(Self::Stopped),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// `Failed` and `Stopped` are terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Stopped)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Failed => write!(f, "failed"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Lifecycle of a server session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServerSessionState {
    Reading = 0,
    Handling = 1,
    Writing = 2,
    Closed = 3,
}

impl ServerSessionState {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Reading),
            1 => Some(Self::Handling),
            2 => Some(Self::Writing),
            3 => Some(Self::Closed),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Outcome kind carried inside a response envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallState {
    Unset,
    Executed,
    Failed,
}

impl Default for CallState {
    fn default() -> Self {
        Self::Unset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_state_round_trips_through_u8() {
        for state in [
            SessionState::Connecting,
            SessionState::Connected,
            SessionState::Failed,
            SessionState::Stopped,
        ] {
            assert_eq!(SessionState::from_u8(state.as_u8()), Some(state));
        }
        assert_eq!(SessionState::from_u8(42), None);
    }

    #[test]
    fn only_failed_and_stopped_are_terminal() {
        assert!(!SessionState::Connecting.is_terminal());
        assert!(!SessionState::Connected.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert!(SessionState::Stopped.is_terminal());
    }
}
