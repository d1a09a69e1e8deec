//! Network Transport - framed I/O for SecureLink
//!
//! Carries [`shared_protocol::Frame`]s over any reliable, ordered byte stream
//! supplied by the caller (TCP socket, QUIC stream, in-memory pipe). The crate
//! never opens connections itself.

mod error;
mod framed;

pub use error::*;
pub use framed::*;

use tokio::io::{AsyncRead, AsyncWrite};

/// Reliable, ordered duplex byte stream supplied by the caller
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Read buffer growth step
pub const READ_CHUNK_SIZE: usize = 16 * 1024;
