//! Error types shared across the negotiation and transfer layers

use thiserror::Error;

/// Failures reported by a peer-connection backend
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("remote description is not set")]
    NoRemoteDescription,
    #[error("peer connection is closed")]
    Closed,
    #[error("peer connection error: {0}")]
    Backend(String),
}

/// Failures reported by a data channel backend
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("data channel is not open")]
    NotOpen,
    #[error("data channel error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    /// A role or phase change that the state machine does not allow
    #[error("invalid {machine} transition: {from} -> {to}")]
    InvalidTransition {
        machine: &'static str,
        from: &'static str,
        to: &'static str,
    },
    #[error("no room has been joined")]
    NoRoom,
    #[error("negotiation session is closed")]
    Closed,
    #[error("signaling channel is closed")]
    SignalingClosed,
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl NegotiationError {
    /// Rejected transitions are not fatal to the session
    pub fn is_rejected_transition(&self) -> bool {
        matches!(self, NegotiationError::InvalidTransition { .. })
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("file is empty")]
    EmptyFile,
    #[error("data channel is not open")]
    ChannelClosed,
    #[error("source ended after {sent} of {expected} bytes")]
    SourceTruncated { expected: u64, sent: u64 },
    #[error("transfer of {name} ended after {received} of {expected} bytes")]
    Incomplete {
        name: String,
        received: u64,
        expected: u64,
    },
    #[error("transfer rejected: {0}")]
    Rejected(String),
    #[error("malformed control frame: {0}")]
    Frame(#[from] serde_json::Error),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("failed to connect to signaling server: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("signaling connection is closed")]
    Closed,
}
