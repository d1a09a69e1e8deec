//! Error types for the protocol

use thiserror::Error;

/// Protocol error
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Unknown frame kind 0x{kind:02x} ({frame_len} bytes)")]
    UnknownFrameKind { kind: u8, frame_len: usize },

    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Invalid transfer manifest: {0}")]
    InvalidManifest(String),

    #[error("Invalid file chunk: {0}")]
    InvalidChunk(String),

    #[error("Invalid state transition: {from:?} -> {to:?}")]
    InvalidStateTransition {
        from: crate::SessionState,
        to: crate::SessionState,
    },
}

impl ProtocolError {
    /// Whether the error describes corrupt or oversized wire data
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            Self::MalformedFrame(_) | Self::UnknownFrameKind { .. } | Self::FrameTooLarge { .. }
        )
    }
}

/// Result type alias for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;
