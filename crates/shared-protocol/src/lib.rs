//! Shared Protocol Definitions for SecureLink
//!
//! This crate contains the wire format (frames), the messages carried inside
//! frames, and the session state enum shared by every SecureLink crate.

mod error;
mod frame;
mod messages;
mod session;

pub use error::*;
pub use frame::*;
pub use messages::*;
pub use session::*;

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of the big-endian length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Size of the frame kind tag
pub const KIND_SIZE: usize = 1;

/// Size of the big-endian sequence number
pub const SEQUENCE_SIZE: usize = 8;

/// Authentication tag size (128 bits / 16 bytes)
pub const TAG_SIZE: usize = 16;

/// Bytes counted by the length prefix in addition to the payload
pub const FRAME_OVERHEAD: usize = KIND_SIZE + SEQUENCE_SIZE + TAG_SIZE;

/// Largest payload accepted by default (1 MiB)
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

/// Default maximum value of the length prefix
pub const DEFAULT_MAX_FRAME_SIZE: usize = DEFAULT_MAX_PAYLOAD + FRAME_OVERHEAD;

/// Default file chunk size (64 KiB)
pub const DEFAULT_CHUNK_SIZE: u32 = 64 * 1024;

/// Header bytes in front of the data of every file chunk (transfer id + index)
pub const FILE_CHUNK_HEADER_SIZE: usize = 8 + 4;

/// Upper bound on the number of chunks in one transfer
pub const MAX_TRANSFER_CHUNKS: u64 = 1 << 22;
