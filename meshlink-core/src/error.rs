//! Mesh error types.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors surfaced by the connection manager.
///
/// Per-peer I/O failures are handled inside the manager (degrade to a shell
/// or tear down) and only show up here when an operation has no peer to fall
/// back on, e.g. binding the listening socket.
#[derive(Debug, Error)]
pub enum MeshError {
    /// I/O error during network operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Outbound dial did not complete in time.
    #[error("connection timeout to {addr}")]
    ConnectTimeout { addr: SocketAddr },

    /// Frame exceeds the configured maximum.
    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Failed to serialize or deserialize a message.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The discovery collaborator rejected a call.
    #[error("discovery error: {0}")]
    Discovery(String),

    /// Operation requires `start` first.
    #[error("not started")]
    NotStarted,
}

impl From<bincode::Error> for MeshError {
    fn from(err: bincode::Error) -> Self {
        MeshError::Serialization(err.to_string())
    }
}

/// Result type for mesh operations.
pub type MeshResult<T> = Result<T, MeshError>;
