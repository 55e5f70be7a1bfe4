//! Network error types

use crate::addrbook::AddrBookError;
use crate::NodeId;
use std::time::Duration;
use thiserror::Error;

pub type NetworkResult<T> = Result<T, NetworkError>;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Message encoding error: {0}")]
    Encoding(String),

    #[error("Database error: {0}")]
    Db(#[from] chain_db::DbError),

    #[error("Address book error: {0}")]
    AddrBook(#[from] AddrBookError),

    #[error("Invalid node ID: {0}")]
    InvalidNodeId(String),

    #[error("Invalid network address: {0}")]
    InvalidAddress(String),

    #[error("Handshake error: {0}")]
    Handshake(String),

    #[error("Authentication failure: {0}")]
    AuthenticationFailure(String),

    #[error("Failed to decrypt secret connection frame")]
    Decryption,

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Dialed our own node ID")]
    SelfDial,

    #[error("Duplicate peer: {0}")]
    DuplicatePeer(NodeId),

    #[error("Already dialing or connected to {0}")]
    AlreadyDialing(String),

    #[error("Peer rejected: {0}")]
    RejectedPeer(String),

    #[error("Too early to dial (backoff {backoff:?}, last dialed {since_last:?} ago)")]
    TooEarlyToDial {
        backoff: Duration,
        since_last: Duration,
    },

    #[error("Reached max attempts ({0}) to dial")]
    MaxAttemptsToDial(u32),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Network timeout")]
    Timeout,

    #[error("Service stopped")]
    Stopped,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl NetworkError {
    /// The remote failed to prove it owns the identity it presented
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, NetworkError::AuthenticationFailure(_))
    }

    /// The remote sent something the protocol does not allow
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            NetworkError::Protocol(_) | NetworkError::Encoding(_) | NetworkError::Decryption
        )
    }
}

impl From<bincode::error::EncodeError> for NetworkError {
    fn from(err: bincode::error::EncodeError) -> Self {
        NetworkError::Encoding(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for NetworkError {
    fn from(err: bincode::error::DecodeError) -> Self {
        NetworkError::Encoding(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for NetworkError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        NetworkError::Timeout
    }
}
