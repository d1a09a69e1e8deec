//! Transport error types

use shared_protocol::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Connection closed mid-frame ({0} bytes buffered)")]
    TruncatedFrame(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type TransportResult<T> = Result<T, TransportError>;
