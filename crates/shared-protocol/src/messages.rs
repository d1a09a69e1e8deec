//! Messages carried inside frames

use std::path::{Component, Path};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{
    FILE_CHUNK_HEADER_SIZE, MAX_TRANSFER_CHUNKS, PROTOCOL_VERSION, ProtocolError, ProtocolResult,
};

/// Domain separator for handshake signatures
const HANDSHAKE_SIGNATURE_CONTEXT: &[u8] = b"securelink-handshake-v1";

/// Long-term identity attached to a handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityProof {
    /// Ed25519 public key
    pub public_key: [u8; 32],
    /// Ed25519 signature over [`HandshakeMessage::signed_data`]
    pub signature: Vec<u8>,
}

/// First message of the key exchange, sent by both peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeMessage {
    /// Protocol version
    pub version: u8,
    /// X25519 ephemeral public key for this session
    pub ephemeral_public_key: [u8; 32],
    /// Optional signed identity
    pub identity: Option<IdentityProof>,
}

impl HandshakeMessage {
    /// Create an unsigned handshake message
    pub fn new(ephemeral_public_key: [u8; 32]) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            ephemeral_public_key,
            identity: None,
        }
    }

    /// Attach a signed identity
    pub fn with_identity(mut self, public_key: [u8; 32], signature: Vec<u8>) -> Self {
        self.identity = Some(IdentityProof {
            public_key,
            signature,
        });
        self
    }

    /// Get the data covered by the identity signature
    pub fn signed_data(
        version: u8,
        ephemeral_public_key: &[u8; 32],
        identity_public_key: &[u8; 32],
    ) -> Vec<u8> {
        let mut data = Vec::with_capacity(HANDSHAKE_SIGNATURE_CONTEXT.len() + 1 + 64);
        data.extend_from_slice(HANDSHAKE_SIGNATURE_CONTEXT);
        data.push(version);
        data.extend_from_slice(ephemeral_public_key);
        data.extend_from_slice(identity_public_key);
        data
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

/// Announces a file transfer before its chunks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferManifest {
    /// Sender-assigned transfer ID, unique within the session
    pub transfer_id: u64,
    /// Bare file name (no directories)
    pub filename: String,
    /// Total file size in bytes
    pub total_size: u64,
    /// Size of every chunk except possibly the last
    pub chunk_size: u32,
    /// BLAKE3 hash of the whole file
    pub checksum: [u8; 32],
}

impl TransferManifest {
    /// Number of chunks the file is split into (zero for an empty file)
    pub fn chunk_count(&self) -> u64 {
        if self.chunk_size == 0 {
            return 0;
        }
        self.total_size.div_ceil(self.chunk_size as u64)
    }

    /// Expected data length of chunk `index`
    pub fn chunk_len(&self, index: u32) -> Option<usize> {
        let index = index as u64;
        let count = self.chunk_count();
        if index >= count {
            return None;
        }
        let start = index * self.chunk_size as u64;
        let len = (self.total_size - start).min(self.chunk_size as u64);
        Some(len as usize)
    }

    /// Byte offset of chunk `index` in the file
    pub fn chunk_offset(&self, index: u32) -> u64 {
        index as u64 * self.chunk_size as u64
    }

    /// Check the manifest against local limits
    pub fn validate(&self, max_chunk_size: usize, max_total_size: u64) -> ProtocolResult<()> {
        if !is_plain_file_name(&self.filename) {
            return Err(ProtocolError::InvalidManifest(format!(
                "file name {:?} is not a plain file name",
                self.filename
            )));
        }
        if self.chunk_size == 0 {
            return Err(ProtocolError::InvalidManifest(
                "chunk size is zero".to_string(),
            ));
        }
        if self.chunk_size as usize > max_chunk_size {
            return Err(ProtocolError::InvalidManifest(format!(
                "chunk size {} exceeds {}",
                self.chunk_size, max_chunk_size
            )));
        }
        if self.total_size > max_total_size {
            return Err(ProtocolError::InvalidManifest(format!(
                "file size {} exceeds {}",
                self.total_size, max_total_size
            )));
        }
        if self.chunk_count() > MAX_TRANSFER_CHUNKS {
            return Err(ProtocolError::InvalidManifest(format!(
                "{} chunks exceeds {}",
                self.chunk_count(),
                MAX_TRANSFER_CHUNKS
            )));
        }
        Ok(())
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

/// Whether `name` is a single, normal path component
pub fn is_plain_file_name(name: &str) -> bool {
    if name.is_empty() || name.contains('/') || name.contains('\\') {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// One piece of a file transfer.
///
/// Layout: `[8-byte transfer id][4-byte chunk index][data]`, big-endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    pub transfer_id: u64,
    pub index: u32,
    pub data: Bytes,
}

impl FileChunk {
    pub fn new(transfer_id: u64, index: u32, data: impl Into<Bytes>) -> Self {
        Self {
            transfer_id,
            index,
            data: data.into(),
        }
    }

    /// Encode to bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FILE_CHUNK_HEADER_SIZE + self.data.len());
        buf.put_u64(self.transfer_id);
        buf.put_u32(self.index);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    /// Decode from bytes without copying the chunk data
    pub fn decode(mut bytes: Bytes) -> ProtocolResult<Self> {
        if bytes.len() < FILE_CHUNK_HEADER_SIZE {
            return Err(ProtocolError::InvalidChunk(format!(
                "chunk of {} bytes is shorter than its header",
                bytes.len()
            )));
        }
        let transfer_id = bytes.get_u64();
        let index = bytes.get_u32();
        Ok(Self {
            transfer_id,
            index,
            data: bytes,
        })
    }
}

/// Graceful session termination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseMessage {
    pub reason: String,
}

impl CloseMessage {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(total_size: u64, chunk_size: u32) -> TransferManifest {
        TransferManifest {
            transfer_id: 1,
            filename: "report.pdf".to_string(),
            total_size,
            chunk_size,
            checksum: [0; 32],
        }
    }

    #[test]
    fn test_handshake_message_bytes() {
        let message = HandshakeMessage::new([7; 32]).with_identity([8; 32], vec![9; 64]);
        let bytes = message.to_bytes().unwrap();
        assert_eq!(HandshakeMessage::from_bytes(&bytes).unwrap(), message);
    }

    #[test]
    fn test_truncated_handshake_message_rejected() {
        let bytes = HandshakeMessage::new([7; 32]).to_bytes().unwrap();
        assert!(HandshakeMessage::from_bytes(&bytes[..bytes.len() - 2]).is_err());
    }

    #[test]
    fn test_signed_data_binds_keys() {
        let a = HandshakeMessage::signed_data(1, &[1; 32], &[2; 32]);
        let b = HandshakeMessage::signed_data(1, &[1; 32], &[3; 32]);
        let c = HandshakeMessage::signed_data(2, &[1; 32], &[2; 32]);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with(HANDSHAKE_SIGNATURE_CONTEXT));
    }

    #[test]
    fn test_chunk_math() {
        let empty = manifest(0, 1024);
        assert_eq!(empty.chunk_count(), 0);
        assert_eq!(empty.chunk_len(0), None);

        let exact = manifest(2048, 1024);
        assert_eq!(exact.chunk_count(), 2);
        assert_eq!(exact.chunk_len(1), Some(1024));

        let ragged = manifest(2500, 1024);
        assert_eq!(ragged.chunk_count(), 3);
        assert_eq!(ragged.chunk_len(0), Some(1024));
        assert_eq!(ragged.chunk_len(2), Some(452));
        assert_eq!(ragged.chunk_len(3), None);
        assert_eq!(ragged.chunk_offset(2), 2048);
    }

    #[test]
    fn test_manifest_validation() {
        assert!(manifest(10, 4).validate(1024, 100).is_ok());
        assert!(manifest(10, 0).validate(1024, 100).is_err());
        assert!(manifest(10, 2048).validate(1024, 100).is_err());
        assert!(manifest(1000, 4).validate(1024, 100).is_err());
        assert!(
            manifest(MAX_TRANSFER_CHUNKS + 1, 1)
                .validate(1024, u64::MAX)
                .is_err()
        );

        for name in ["", ".", "..", "../etc/passwd", "dir/file", "C:\\evil", "/abs"] {
            let mut m = manifest(10, 4);
            m.filename = name.to_string();
            assert!(m.validate(1024, 100).is_err(), "accepted {:?}", name);
        }
    }

    #[test]
    fn test_file_chunk_layout() {
        let chunk = FileChunk::new(0x0102_0304_0506_0708, 9, Bytes::from_static(b"abc"));
        let encoded = chunk.encode();
        assert_eq!(&encoded[..8], &0x0102_0304_0506_0708u64.to_be_bytes());
        assert_eq!(&encoded[8..12], &9u32.to_be_bytes());
        assert_eq!(&encoded[12..], b"abc");
        assert_eq!(FileChunk::decode(encoded).unwrap(), chunk);
    }

    #[test]
    fn test_short_file_chunk_rejected() {
        let err = FileChunk::decode(Bytes::from_static(&[0; 11])).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidChunk(_)));
    }

    #[test]
    fn test_close_message_bytes() {
        let close = CloseMessage::new("bye");
        let bytes = close.to_bytes().unwrap();
        assert_eq!(CloseMessage::from_bytes(&bytes).unwrap(), close);
    }
}
