//! Session identity and lifecycle states

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Local identifier of a session, used for logging and bookkeeping only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Short form for log lines (first 8 hex digits)
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Initial state, no handshake attempted
    Disconnected,
    /// Performing cryptographic handshake
    Handshaking,
    /// Keys agreed, traffic may flow
    Established,
    /// Flushing in-flight frames before teardown
    Closing,
    /// Terminal state
    Closed,
}

impl SessionState {
    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// States only move forward; `Closed` is terminal and reachable from every
    /// other state.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Disconnected, Handshaking)
                | (Handshaking, Established)
                | (Disconnected | Handshaking | Established, Closing)
                | (Disconnected | Handshaking | Established | Closing, Closed)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == SessionState::Closed
    }

    pub fn is_established(self) -> bool {
        self == SessionState::Established
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Handshaking => write!(f, "Handshaking"),
            Self::Established => write!(f, "Established"),
            Self::Closing => write!(f, "Closing"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    const ALL: [SessionState; 5] = [Disconnected, Handshaking, Established, Closing, Closed];

    #[test]
    fn test_happy_path_transitions() {
        assert!(Disconnected.can_transition_to(Handshaking));
        assert!(Handshaking.can_transition_to(Established));
        assert!(Established.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Closed));
    }

    #[test]
    fn test_handshake_failure_goes_straight_to_closed() {
        assert!(Handshaking.can_transition_to(Closed));
    }

    #[test]
    fn test_closed_is_terminal() {
        for next in ALL {
            assert!(!Closed.can_transition_to(next));
        }
        assert!(Closed.is_terminal());
    }

    #[test]
    fn test_no_backwards_transitions() {
        assert!(!Established.can_transition_to(Handshaking));
        assert!(!Closing.can_transition_to(Established));
        assert!(!Handshaking.can_transition_to(Disconnected));
        for state in ALL {
            assert!(!state.can_transition_to(state));
        }
    }

    #[test]
    fn test_session_id_short_form() {
        let id = SessionId::new();
        assert_eq!(id.short().len(), 8);
        assert!(id.to_string().replace('-', "").starts_with(&id.short()));
    }
}
