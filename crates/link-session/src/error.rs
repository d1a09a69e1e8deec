//! Session error taxonomy

use crypto_session::CryptoError;
use net_transport::TransportError;
use shared_protocol::{ProtocolError, SessionState};
use thiserror::Error;

/// Session error
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Replay detected: expected sequence {expected}, got {received}")]
    ReplayDetected { expected: u64, received: u64 },

    #[error("Cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("Session closed")]
    SessionClosed,

    #[error("Transfer {transfer_id:016x} failed checksum verification")]
    TransferChecksumMismatch { transfer_id: u64 },

    #[error("Transfer {transfer_id:016x} aborted")]
    TransferAborted { transfer_id: u64 },

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Protocol error: {0}")]
    Protocol(ProtocolError),

    #[error("Transport error: {0}")]
    Transport(TransportError),

    #[error("Crypto error: {0}")]
    Crypto(CryptoError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SessionError {
    /// Whether this error ends the session
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::MalformedFrame(_)
                | Self::HandshakeFailed(_)
                | Self::AuthenticationFailed(_)
                | Self::ReplayDetected { .. }
                | Self::SessionClosed
                | Self::Transport(_)
                | Self::Crypto(_)
        )
    }
}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        if e.is_malformed() {
            Self::MalformedFrame(e.to_string())
        } else {
            Self::Protocol(e)
        }
    }
}

impl From<CryptoError> for SessionError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::HandshakeFailed(reason) => Self::HandshakeFailed(reason),
            CryptoError::AuthenticationFailed(reason) => Self::AuthenticationFailed(reason),
            CryptoError::ReplayDetected { expected, received } => {
                Self::ReplayDetected { expected, received }
            }
            other => Self::Crypto(other),
        }
    }
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Protocol(protocol) => protocol.into(),
            other => Self::Transport(other),
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_wire_data_maps_to_malformed_frame() {
        let err: SessionError = TransportError::Protocol(ProtocolError::FrameTooLarge {
            size: 10,
            max: 5,
        })
        .into();
        assert!(matches!(err, SessionError::MalformedFrame(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_crypto_errors_map_onto_taxonomy() {
        let err: SessionError = CryptoError::ReplayDetected {
            expected: 4,
            received: 2,
        }
        .into();
        assert!(matches!(
            err,
            SessionError::ReplayDetected {
                expected: 4,
                received: 2
            }
        ));

        let err: SessionError = CryptoError::AuthenticationFailed("bad tag".into()).into();
        assert!(matches!(err, SessionError::AuthenticationFailed(_)));
    }

    #[test]
    fn test_transfer_errors_are_recoverable() {
        assert!(!SessionError::TransferChecksumMismatch { transfer_id: 1 }.is_fatal());
        assert!(!SessionError::TransferAborted { transfer_id: 1 }.is_fatal());
        assert!(!SessionError::from(ProtocolError::InvalidChunk("x".into())).is_fatal());
        assert!(
            !SessionError::InvalidState {
                operation: "send",
                state: SessionState::Disconnected
            }
            .is_fatal()
        );
    }
}
