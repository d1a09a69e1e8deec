//! Session configuration

use std::path::PathBuf;
use std::time::Duration;

use crypto_session::{PUBLIC_KEY_SIZE, PeerPolicy};
use serde::{Deserialize, Serialize};
use shared_protocol::{
    DEFAULT_CHUNK_SIZE, DEFAULT_MAX_FRAME_SIZE, FILE_CHUNK_HEADER_SIZE, FRAME_OVERHEAD,
};

use crate::{SessionError, SessionResult};

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Largest accepted value of a frame's length prefix
    pub max_frame_size: usize,
    /// Chunk size used for outgoing files
    pub chunk_size: u32,
    /// Directory receiving incoming files
    pub download_dir: PathBuf,
    /// Largest incoming file accepted, in bytes
    pub max_transfer_size: u64,
    /// Incoming transfers allowed in flight at once
    pub max_inbound_transfers: usize,
    /// Time allowed for the whole handshake, in milliseconds
    pub handshake_timeout_ms: u64,
    /// Hex-encoded Ed25519 key the peer must authenticate with
    pub expected_peer: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            download_dir: PathBuf::from("downloads"),
            max_transfer_size: 16 * 1024 * 1024 * 1024,
            max_inbound_transfers: 16,
            handshake_timeout_ms: 10_000,
            expected_peer: None,
        }
    }
}

impl SessionConfig {
    /// Parse a JSON configuration; missing fields take their defaults
    pub fn from_json(json: &str) -> SessionResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| SessionError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Require the peer to sign its handshake with `public_key`
    pub fn with_expected_peer(mut self, public_key: [u8; PUBLIC_KEY_SIZE]) -> Self {
        self.expected_peer = Some(hex::encode(public_key));
        self
    }

    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: u32) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Largest chunk that still fits in one frame
    pub fn max_chunk_size(&self) -> usize {
        self.max_frame_size
            .saturating_sub(FRAME_OVERHEAD + FILE_CHUNK_HEADER_SIZE)
    }

    /// Largest text message that fits in one frame
    pub fn max_message_size(&self) -> usize {
        self.max_frame_size.saturating_sub(FRAME_OVERHEAD)
    }

    /// Identity requirements derived from `expected_peer`
    pub fn peer_policy(&self) -> SessionResult<PeerPolicy> {
        let Some(encoded) = &self.expected_peer else {
            return Ok(PeerPolicy::default());
        };

        let bytes = hex::decode(encoded.trim())
            .map_err(|e| SessionError::Config(format!("expected_peer is not hex: {}", e)))?;
        let key: [u8; PUBLIC_KEY_SIZE] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            SessionError::Config(format!(
                "expected_peer must be {} bytes, got {}",
                PUBLIC_KEY_SIZE,
                bytes.len()
            ))
        })?;
        Ok(PeerPolicy::expect_peer(key))
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> SessionResult<()> {
        if self.max_frame_size <= FRAME_OVERHEAD + FILE_CHUNK_HEADER_SIZE
            || self.max_frame_size > u32::MAX as usize
        {
            return Err(SessionError::Config(format!(
                "max_frame_size {} is out of range",
                self.max_frame_size
            )));
        }
        if self.chunk_size == 0 {
            return Err(SessionError::Config("chunk_size must be non-zero".into()));
        }
        if self.chunk_size as usize > self.max_chunk_size() {
            return Err(SessionError::Config(format!(
                "chunk_size {} does not fit in max_frame_size {}",
                self.chunk_size, self.max_frame_size
            )));
        }
        if self.max_inbound_transfers == 0 {
            return Err(SessionError::Config(
                "max_inbound_transfers must be non-zero".into(),
            ));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(SessionError::Config(
                "handshake_timeout_ms must be non-zero".into(),
            ));
        }
        self.peer_policy()?;
        Ok(())
    }
}
