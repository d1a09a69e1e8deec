//! Encrypted frame channel with ChaCha20Poly1305
//!
//! Each direction has its own sub-key and its own sequence counter. The
//! nonce is derived from the sequence number, so it is unique per key without
//! any coordination, and the kind and sequence are bound in as associated
//! data.

use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce, Tag,
    aead::{AeadInPlace, KeyInit},
};
use shared_protocol::{Frame, FrameKind, TAG_SIZE, associated_data};

use crate::{CryptoError, CryptoResult, KEY_SIZE, NONCE_SIZE, SessionKeys};

/// Nonce format: [4 zero bytes][8-byte big-endian sequence]
fn nonce_for(sequence: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[4..].copy_from_slice(&sequence.to_be_bytes());
    nonce
}

/// Outbound half: owns the send sub-key and `send_sequence`
pub struct ChannelSender {
    cipher: ChaCha20Poly1305,
    send_sequence: u64,
}

impl ChannelSender {
    fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            send_sequence: 0,
        }
    }

    /// Encrypt `plaintext` into the next frame of this direction.
    ///
    /// The first sealed frame carries sequence 1.
    pub fn seal(&mut self, kind: FrameKind, plaintext: &[u8]) -> CryptoResult<Frame> {
        let sequence = self
            .send_sequence
            .checked_add(1)
            .ok_or(CryptoError::SequenceExhausted)?;

        let nonce = nonce_for(sequence);
        let mut buffer = plaintext.to_vec();
        let tag = self
            .cipher
            .encrypt_in_place_detached(
                Nonce::from_slice(&nonce),
                &associated_data(kind, sequence),
                &mut buffer,
            )
            .map_err(|e| CryptoError::Encryption(e.to_string()))?;

        self.send_sequence = sequence;

        let mut auth_tag = [0u8; TAG_SIZE];
        auth_tag.copy_from_slice(tag.as_slice());
        Ok(Frame::new(kind, sequence, buffer, auth_tag))
    }

    /// Sequence number of the last sealed frame
    pub fn send_sequence(&self) -> u64 {
        self.send_sequence
    }
}

/// Inbound half: owns the receive sub-key and `recv_sequence`
pub struct ChannelReceiver {
    cipher: ChaCha20Poly1305,
    recv_sequence: u64,
}

impl ChannelReceiver {
    fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            recv_sequence: 0,
        }
    }

    /// Decrypt and verify the next frame.
    ///
    /// Only `recv_sequence + 1` is accepted; anything else is a replay or a
    /// reordering. The counter advances only when authentication succeeds.
    pub fn open(&mut self, frame: &Frame) -> CryptoResult<Vec<u8>> {
        let expected = self
            .recv_sequence
            .checked_add(1)
            .ok_or(CryptoError::SequenceExhausted)?;
        if frame.sequence() != expected {
            return Err(CryptoError::ReplayDetected {
                expected,
                received: frame.sequence(),
            });
        }

        let nonce = nonce_for(expected);
        let mut buffer = frame.payload().to_vec();
        self.cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&nonce),
                &associated_data(frame.kind(), expected),
                &mut buffer,
                Tag::from_slice(frame.auth_tag()),
            )
            .map_err(|_| {
                CryptoError::AuthenticationFailed(format!(
                    "{} frame {} failed authentication",
                    frame.kind(),
                    expected
                ))
            })?;

        self.recv_sequence = expected;
        Ok(buffer)
    }

    /// Sequence number of the last accepted frame
    pub fn recv_sequence(&self) -> u64 {
        self.recv_sequence
    }
}

/// Established encrypted channel
pub struct SecureChannel {
    sender: ChannelSender,
    receiver: ChannelReceiver,
}

impl SecureChannel {
    /// Create a channel from the keys of a completed handshake
    pub fn new(keys: &SessionKeys) -> Self {
        Self {
            sender: ChannelSender::new(keys.send_key()),
            receiver: ChannelReceiver::new(keys.recv_key()),
        }
    }

    pub fn seal(&mut self, kind: FrameKind, plaintext: &[u8]) -> CryptoResult<Frame> {
        self.sender.seal(kind, plaintext)
    }

    pub fn open(&mut self, frame: &Frame) -> CryptoResult<Vec<u8>> {
        self.receiver.open(frame)
    }

    pub fn send_sequence(&self) -> u64 {
        self.sender.send_sequence()
    }

    pub fn recv_sequence(&self) -> u64 {
        self.receiver.recv_sequence()
    }

    /// Split into independently owned send and receive halves
    pub fn split(self) -> (ChannelSender, ChannelReceiver) {
        (self.sender, self.receiver)
    }
}
