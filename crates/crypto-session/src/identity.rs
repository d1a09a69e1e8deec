//! Long-term Ed25519 identities used to sign handshakes

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use crate::{CryptoError, CryptoResult, PUBLIC_KEY_SIZE, SIGNATURE_SIZE};

/// Signing identity of the local endpoint
pub struct IdentityKeyPair {
    signing_key: SigningKey,
}

impl IdentityKeyPair {
    /// Generate a new random identity
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore an identity from its 32-byte secret
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(secret),
        }
    }

    /// Export the secret so the caller can persist it
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing_key.to_bytes())
    }

    /// Get the public key bytes
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Short hex fingerprint of the public key, for display
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_key_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// First 8 bytes of a public key as hex
pub fn fingerprint(public_key: &[u8; PUBLIC_KEY_SIZE]) -> String {
    hex::encode(&public_key[..8])
}

/// Verify an identity signature.
///
/// Every failure, including a malformed key or signature, is reported as
/// [`CryptoError::AuthenticationFailed`].
pub fn verify_signature(
    public_key: &[u8; PUBLIC_KEY_SIZE],
    message: &[u8],
    signature: &[u8],
) -> CryptoResult<()> {
    let verifying_key = VerifyingKey::from_bytes(public_key).map_err(|_| {
        CryptoError::AuthenticationFailed("identity key is not a valid Ed25519 point".to_string())
    })?;

    let signature: [u8; SIGNATURE_SIZE] = signature.try_into().map_err(|_| {
        CryptoError::AuthenticationFailed(format!(
            "signature is {} bytes, expected {}",
            signature.len(),
            SIGNATURE_SIZE
        ))
    })?;

    verifying_key
        .verify_strict(message, &Signature::from_bytes(&signature))
        .map_err(|_| {
            CryptoError::AuthenticationFailed("identity signature does not verify".to_string())
        })
}
