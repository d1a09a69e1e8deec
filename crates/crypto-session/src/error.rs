//! Crypto session error types

use thiserror::Error;

/// Cryptographic operation error
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Replay detected: expected sequence {expected}, got {received}")]
    ReplayDetected { expected: u64, received: u64 },

    #[error("Sequence space exhausted: maximum frame count reached")]
    SequenceExhausted,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),
}

pub type CryptoResult<T> = Result<T, CryptoError>;
