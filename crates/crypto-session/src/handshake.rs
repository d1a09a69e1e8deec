//! Authenticated ephemeral key exchange
//!
//! Both peers send a [`HandshakeMessage`] carrying a fresh X25519 public key
//! and, optionally, an Ed25519 identity signature over it. The X25519 result
//! is expanded with HKDF-SHA256, salted with both ephemeral keys in sorted
//! order, into one sub-key per direction. Key confirmation tags then prove
//! that both sides derived the same keys and agree on which identities took
//! part.

use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use shared_protocol::{HandshakeMessage, PROTOCOL_VERSION};
use subtle::ConstantTimeEq;
use tracing::debug;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

use crate::{
    CONFIRMATION_TAG_SIZE, CryptoError, CryptoResult, IdentityKeyPair, KEY_SIZE, PUBLIC_KEY_SIZE,
    fingerprint, verify_signature,
};

const KEY_DERIVATION_INFO: &[u8] = b"securelink v1 session keys";
const TRANSCRIPT_CONTEXT: &[u8] = b"securelink-transcript-v1";
const CONFIRMATION_CONTEXT: &[u8] = b"securelink-key-confirm-v1";

/// Ephemeral secret held between [`begin_handshake`] and [`complete_handshake`]
pub struct HandshakeSecret {
    secret: EphemeralSecret,
    public: PublicKey,
    identity: Option<[u8; PUBLIC_KEY_SIZE]>,
}

impl HandshakeSecret {
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        *self.public.as_bytes()
    }
}

/// What the local side requires of the remote identity
#[derive(Debug, Clone, Default)]
pub struct PeerPolicy {
    /// Pin the remote Ed25519 identity. When set, an unsigned handshake or a
    /// different key fails authentication.
    pub expected_peer: Option<[u8; PUBLIC_KEY_SIZE]>,
}

impl PeerPolicy {
    pub fn expect_peer(public_key: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self {
            expected_peer: Some(public_key),
        }
    }
}

/// Start a handshake with a fresh ephemeral key pair
pub fn begin_handshake(
    local_identity: Option<&IdentityKeyPair>,
) -> (HandshakeMessage, HandshakeSecret) {
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);

    let mut message = HandshakeMessage::new(*public.as_bytes());
    let mut signed_as = None;
    if let Some(identity) = local_identity {
        let identity_public = identity.public_key_bytes();
        let signed = HandshakeMessage::signed_data(
            message.version,
            &message.ephemeral_public_key,
            &identity_public,
        );
        message = message.with_identity(identity_public, identity.sign(&signed).to_vec());
        signed_as = Some(identity_public);
        debug!("Signed handshake with identity {}", identity.fingerprint());
    }

    (
        message,
        HandshakeSecret {
            secret,
            public,
            identity: signed_as,
        },
    )
}

/// Finish the key exchange against the peer's handshake message
pub fn complete_handshake(
    secret: HandshakeSecret,
    remote: &HandshakeMessage,
    policy: &PeerPolicy,
) -> CryptoResult<SessionKeys> {
    if remote.version != PROTOCOL_VERSION {
        return Err(CryptoError::HandshakeFailed(format!(
            "unsupported protocol version {} (expected {})",
            remote.version, PROTOCOL_VERSION
        )));
    }

    let local_public = secret.public_key_bytes();
    if remote.ephemeral_public_key == local_public {
        return Err(CryptoError::HandshakeFailed(
            "peer echoed our own ephemeral key".to_string(),
        ));
    }

    let remote_identity = verify_identity(remote, policy)?;

    let shared = secret
        .secret
        .diffie_hellman(&PublicKey::from(remote.ephemeral_public_key));
    if !shared.was_contributory() {
        return Err(CryptoError::HandshakeFailed(
            "key agreement produced a low-order result".to_string(),
        ));
    }

    SessionKeys::derive(
        shared.as_bytes(),
        (local_public, secret.identity),
        (remote.ephemeral_public_key, remote_identity),
    )
}

fn verify_identity(
    remote: &HandshakeMessage,
    policy: &PeerPolicy,
) -> CryptoResult<Option<[u8; PUBLIC_KEY_SIZE]>> {
    let Some(proof) = &remote.identity else {
        if policy.expected_peer.is_some() {
            return Err(CryptoError::AuthenticationFailed(
                "peer did not present an identity".to_string(),
            ));
        }
        return Ok(None);
    };

    if let Some(expected) = policy.expected_peer {
        if expected != proof.public_key {
            return Err(CryptoError::AuthenticationFailed(format!(
                "peer identity {} does not match expected {}",
                fingerprint(&proof.public_key),
                fingerprint(&expected)
            )));
        }
    }

    let signed = HandshakeMessage::signed_data(
        remote.version,
        &remote.ephemeral_public_key,
        &proof.public_key,
    );
    verify_signature(&proof.public_key, &signed, &proof.signature)?;

    debug!("Verified peer identity {}", fingerprint(&proof.public_key));
    Ok(Some(proof.public_key))
}

/// Direction-specific keys produced by a completed handshake
pub struct SessionKeys {
    send_key: Zeroizing<[u8; KEY_SIZE]>,
    recv_key: Zeroizing<[u8; KEY_SIZE]>,
    transcript: [u8; 32],
    local_public: [u8; PUBLIC_KEY_SIZE],
    remote_public: [u8; PUBLIC_KEY_SIZE],
    remote_identity: Option<[u8; PUBLIC_KEY_SIZE]>,
}

impl SessionKeys {
    /// Each side is given as its ephemeral key and optional verified identity
    fn derive(
        shared_secret: &[u8; 32],
        (local_public, local_identity): (
            [u8; PUBLIC_KEY_SIZE],
            Option<[u8; PUBLIC_KEY_SIZE]>,
        ),
        (remote_public, remote_identity): (
            [u8; PUBLIC_KEY_SIZE],
            Option<[u8; PUBLIC_KEY_SIZE]>,
        ),
    ) -> CryptoResult<Self> {
        let local_is_low = local_public < remote_public;
        let (low, high) = if local_is_low {
            (local_public, remote_public)
        } else {
            (remote_public, local_public)
        };

        let mut salt = [0u8; 2 * PUBLIC_KEY_SIZE];
        salt[..PUBLIC_KEY_SIZE].copy_from_slice(&low);
        salt[PUBLIC_KEY_SIZE..].copy_from_slice(&high);

        let mut okm = Zeroizing::new([0u8; 2 * KEY_SIZE]);
        Hkdf::<Sha256>::new(Some(&salt), shared_secret)
            .expand(KEY_DERIVATION_INFO, okm.as_mut_slice())
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

        let mut low_to_high = Zeroizing::new([0u8; KEY_SIZE]);
        let mut high_to_low = Zeroizing::new([0u8; KEY_SIZE]);
        low_to_high.copy_from_slice(&okm[..KEY_SIZE]);
        high_to_low.copy_from_slice(&okm[KEY_SIZE..]);

        let (send_key, recv_key) = if local_is_low {
            (low_to_high, high_to_low)
        } else {
            (high_to_low, low_to_high)
        };

        let (low_identity, high_identity) = if local_is_low {
            (local_identity, remote_identity)
        } else {
            (remote_identity, local_identity)
        };

        let mut hasher = blake3::Hasher::new();
        hasher.update(TRANSCRIPT_CONTEXT);
        hasher.update(&salt);
        for identity in [low_identity, high_identity] {
            match identity {
                Some(key) => {
                    hasher.update(&[1]);
                    hasher.update(&key);
                }
                None => {
                    hasher.update(&[0]);
                }
            }
        }

        Ok(Self {
            send_key,
            recv_key,
            transcript: *hasher.finalize().as_bytes(),
            local_public,
            remote_public,
            remote_identity,
        })
    }

    /// Tag proving to the peer that we hold the matching keys
    pub fn confirmation_tag(&self) -> [u8; CONFIRMATION_TAG_SIZE] {
        confirmation(&self.send_key, &self.transcript)
    }

    /// Check the peer's confirmation tag against our receive key
    pub fn verify_confirmation(&self, tag: &[u8]) -> CryptoResult<()> {
        let expected = confirmation(&self.recv_key, &self.transcript);
        if tag.len() != expected.len() {
            return Err(CryptoError::HandshakeFailed(
                "key confirmation tag has the wrong length".to_string(),
            ));
        }

        if !bool::from(expected.as_slice().ct_eq(tag)) {
            return Err(CryptoError::HandshakeFailed(
                "peer derived different session keys".to_string(),
            ));
        }
        Ok(())
    }

    pub fn local_public_key(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.local_public
    }

    pub fn remote_public_key(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.remote_public
    }

    /// Verified Ed25519 identity of the peer, if it presented one
    pub fn remote_identity(&self) -> Option<&[u8; PUBLIC_KEY_SIZE]> {
        self.remote_identity.as_ref()
    }

    /// Hash of both ephemeral keys and identities; identical on both peers
    pub fn transcript_hash(&self) -> &[u8; 32] {
        &self.transcript
    }

    pub(crate) fn send_key(&self) -> &[u8; KEY_SIZE] {
        &self.send_key
    }

    pub(crate) fn recv_key(&self) -> &[u8; KEY_SIZE] {
        &self.recv_key
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys")
            .field("local_public", &fingerprint(&self.local_public))
            .field("remote_public", &fingerprint(&self.remote_public))
            .field("remote_identity", &self.remote_identity.as_ref().map(fingerprint))
            .finish_non_exhaustive()
    }
}

fn confirmation(key: &[u8; KEY_SIZE], transcript: &[u8; 32]) -> [u8; CONFIRMATION_TAG_SIZE] {
    let mut hasher = blake3::Hasher::new_keyed(key);
    hasher.update(CONFIRMATION_CONTEXT);
    hasher.update(transcript);
    let mut tag = [0u8; CONFIRMATION_TAG_SIZE];
    tag.copy_from_slice(&hasher.finalize().as_bytes()[..CONFIRMATION_TAG_SIZE]);
    tag
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(
        a_identity: Option<&IdentityKeyPair>,
        b_identity: Option<&IdentityKeyPair>,
        a_policy: &PeerPolicy,
        b_policy: &PeerPolicy,
    ) -> (CryptoResult<SessionKeys>, CryptoResult<SessionKeys>) {
        let (a_message, a_secret) = begin_handshake(a_identity);
        let (b_message, b_secret) = begin_handshake(b_identity);
        (
            complete_handshake(a_secret, &b_message, a_policy),
            complete_handshake(b_secret, &a_message, b_policy),
        )
    }

    #[test]
    fn test_peers_derive_mirrored_keys() {
        let policy = PeerPolicy::default();
        let (a, b) = exchange(None, None, &policy, &policy);
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.send_key(), b.recv_key());
        assert_eq!(a.recv_key(), b.send_key());
        assert_ne!(a.send_key(), a.recv_key());
        assert_eq!(a.transcript_hash(), b.transcript_hash());

        b.verify_confirmation(&a.confirmation_tag()).unwrap();
        a.verify_confirmation(&b.confirmation_tag()).unwrap();
    }

    #[test]
    fn test_confirmation_tags_are_directional() {
        let policy = PeerPolicy::default();
        let (a, b) = exchange(None, None, &policy, &policy);
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_ne!(a.confirmation_tag(), b.confirmation_tag());
        // A reflected tag must not verify
        assert!(a.verify_confirmation(&a.confirmation_tag()).is_err());
    }

    #[test]
    fn test_fresh_ephemeral_key_per_handshake() {
        let (first, _) = begin_handshake(None);
        let (second, _) = begin_handshake(None);
        assert_ne!(first.ephemeral_public_key, second.ephemeral_public_key);
    }

    #[test]
    fn test_tampered_wire_bytes_fail_confirmation() {
        let policy = PeerPolicy::default();
        let (a_message, a_secret) = begin_handshake(None);
        let (b_message, b_secret) = begin_handshake(None);

        // bincode layout: version byte, then the 32-byte ephemeral key
        let mut bytes = a_message.to_bytes().unwrap();
        bytes[17] ^= 0x01;
        let tampered = HandshakeMessage::from_bytes(&bytes).unwrap();

        let a_keys = complete_handshake(a_secret, &b_message, &policy).unwrap();
        let b_keys = complete_handshake(b_secret, &tampered, &policy).unwrap();
        let err = b_keys.verify_confirmation(&a_keys.confirmation_tag());
        assert!(matches!(err, Err(CryptoError::HandshakeFailed(_))));
    }

    #[test]
    fn test_tampering_any_key_byte_breaks_key_agreement() {
        let policy = PeerPolicy::default();
        for position in 0..32 {
            let (a_message, a_secret) = begin_handshake(None);
            let (b_message, b_secret) = begin_handshake(None);

            let mut tampered = a_message.clone();
            tampered.ephemeral_public_key[position] ^= 0x80;

            let a_keys = complete_handshake(a_secret, &b_message, &policy).unwrap();
            match complete_handshake(b_secret, &tampered, &policy) {
                Ok(b_keys) => {
                    let err = b_keys.verify_confirmation(&a_keys.confirmation_tag());
                    assert!(matches!(err, Err(CryptoError::HandshakeFailed(_))));
                }
                Err(err) => assert!(matches!(err, CryptoError::HandshakeFailed(_))),
            }
        }
    }

    #[test]
    fn test_reflected_handshake_rejected() {
        let (message, secret) = begin_handshake(None);
        let err = complete_handshake(secret, &message, &PeerPolicy::default());
        assert!(matches!(err, Err(CryptoError::HandshakeFailed(_))));
    }

    #[test]
    fn test_low_order_point_rejected() {
        let (_, secret) = begin_handshake(None);
        let remote = HandshakeMessage::new([0u8; 32]);
        let err = complete_handshake(secret, &remote, &PeerPolicy::default());
        assert!(matches!(err, Err(CryptoError::HandshakeFailed(_))));
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let (_, secret) = begin_handshake(None);
        let (mut remote, _) = begin_handshake(None);
        remote.version = PROTOCOL_VERSION + 1;
        let err = complete_handshake(secret, &remote, &PeerPolicy::default());
        assert!(matches!(err, Err(CryptoError::HandshakeFailed(_))));
    }

    #[test]
    fn test_signed_handshake_with_pinned_peers() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();

        let (a, b) = exchange(
            Some(&alice),
            Some(&bob),
            &PeerPolicy::expect_peer(bob.public_key_bytes()),
            &PeerPolicy::expect_peer(alice.public_key_bytes()),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.remote_identity(), Some(&bob.public_key_bytes()));
        assert_eq!(b.remote_identity(), Some(&alice.public_key_bytes()));
    }

    #[test]
    fn test_unpinned_signature_is_still_verified() {
        let alice = IdentityKeyPair::generate();
        let (mut message, _) = begin_handshake(Some(&alice));
        if let Some(proof) = message.identity.as_mut() {
            proof.signature[0] ^= 0xFF;
        }

        let (_, secret) = begin_handshake(None);
        let err = complete_handshake(secret, &message, &PeerPolicy::default());
        assert!(matches!(err, Err(CryptoError::AuthenticationFailed(_))));
    }

    #[test]
    fn test_signature_covers_ephemeral_key() {
        let alice = IdentityKeyPair::generate();
        let (mut message, _) = begin_handshake(Some(&alice));
        message.ephemeral_public_key[5] ^= 0x01;

        let (_, secret) = begin_handshake(None);
        let err = complete_handshake(
            secret,
            &message,
            &PeerPolicy::expect_peer(alice.public_key_bytes()),
        );
        assert!(matches!(err, Err(CryptoError::AuthenticationFailed(_))));
    }

    #[test]
    fn test_missing_identity_never_downgrades() {
        let alice = IdentityKeyPair::generate();
        let (message, _) = begin_handshake(None);
        let (_, secret) = begin_handshake(None);

        let err = complete_handshake(
            secret,
            &message,
            &PeerPolicy::expect_peer(alice.public_key_bytes()),
        );
        assert!(matches!(err, Err(CryptoError::AuthenticationFailed(_))));
    }

    #[test]
    fn test_unexpected_identity_rejected() {
        let alice = IdentityKeyPair::generate();
        let mallory = IdentityKeyPair::generate();
        let (message, _) = begin_handshake(Some(&mallory));
        let (_, secret) = begin_handshake(None);

        let err = complete_handshake(
            secret,
            &message,
            &PeerPolicy::expect_peer(alice.public_key_bytes()),
        );
        assert!(matches!(err, Err(CryptoError::AuthenticationFailed(_))));
    }

    #[test]
    fn test_relabelled_identity_fails_confirmation() {
        let alice = IdentityKeyPair::generate();
        let mallory = IdentityKeyPair::generate();
        let policy = PeerPolicy::default();

        let (a_message, a_secret) = begin_handshake(Some(&alice));
        let (b_message, b_secret) = begin_handshake(None);

        // Mallory claims Alice's ephemeral key under her own identity
        let mallory_public = mallory.public_key_bytes();
        let signed = HandshakeMessage::signed_data(
            a_message.version,
            &a_message.ephemeral_public_key,
            &mallory_public,
        );
        let relabelled = HandshakeMessage::new(a_message.ephemeral_public_key)
            .with_identity(mallory_public, mallory.sign(&signed).to_vec());

        let a_keys = complete_handshake(a_secret, &b_message, &policy).unwrap();
        let b_keys = complete_handshake(b_secret, &relabelled, &policy).unwrap();
        assert_eq!(b_keys.remote_identity(), Some(&mallory_public));

        assert_ne!(a_keys.transcript_hash(), b_keys.transcript_hash());
        let err = b_keys.verify_confirmation(&a_keys.confirmation_tag());
        assert!(matches!(err, Err(CryptoError::HandshakeFailed(_))));
        assert!(a_keys.verify_confirmation(&b_keys.confirmation_tag()).is_err());
    }

    #[test]
    fn test_wrong_length_confirmation_rejected() {
        let policy = PeerPolicy::default();
        let (a, b) = exchange(None, None, &policy, &policy);
        let (a, b) = (a.unwrap(), b.unwrap());

        let tag = a.confirmation_tag();
        assert!(b.verify_confirmation(&tag[..CONFIRMATION_TAG_SIZE - 1]).is_err());
        assert!(b.verify_confirmation(&[]).is_err());
    }

    #[test]
    fn test_debug_output_has_no_key_material() {
        let policy = PeerPolicy::default();
        let (a, _) = exchange(None, None, &policy, &policy);
        let debug = format!("{:?}", a.unwrap());
        assert!(debug.starts_with("SessionKeys"));
        assert!(!debug.contains("send_key"));
    }
}
