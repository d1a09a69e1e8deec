//! Link Session - encrypted messaging and file transfer for SecureLink
//!
//! Drives the handshake from `crypto-session` over a `net-transport` framed
//! stream, gates every operation on the session state, and reassembles
//! incoming files with progress reporting.
//!
//! ```no_run
//! # async fn demo(stream: tokio::net::TcpStream) -> link_session::SessionResult<()> {
//! use link_session::{SessionConfig, connect};
//!
//! let mut session = connect(stream, None, SessionConfig::default()).await?;
//! session.send(b"hello").await?;
//! let reply = session.receive().await?;
//! session.close().await?;
//! # let _ = reply;
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod progress;
mod session;
mod transfer;

pub use config::*;
pub use error::*;
pub use progress::*;
pub use session::*;
pub use transfer::*;

pub use crypto_session::IdentityKeyPair;
pub use shared_protocol::{SessionId, SessionState, TransferManifest};
