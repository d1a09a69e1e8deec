//! Crypto Session - End-to-End Encryption for SecureLink
//!
//! Provides an authenticated X25519 key exchange (with optional Ed25519
//! identities), HKDF-SHA256 derivation of per-direction sub-keys, and a
//! ChaCha20Poly1305 channel with strict sequence checking.

mod channel;
mod error;
mod handshake;
mod identity;

pub use channel::*;
pub use error::*;
pub use handshake::*;
pub use identity::*;

/// Nonce size for ChaCha20Poly1305 (96 bits / 12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Public key size (256 bits / 32 bytes)
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Symmetric sub-key size (256 bits / 32 bytes)
pub const KEY_SIZE: usize = 32;

/// Ed25519 signature size
pub const SIGNATURE_SIZE: usize = 64;

/// Key confirmation tag size
pub const CONFIRMATION_TAG_SIZE: usize = 16;
