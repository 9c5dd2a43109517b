//! Peer-connection primitive
//!
//! The negotiation engine and the transfer protocol only talk to these
//! traits. [`crate::rtc`] implements them on top of the `webrtc` crate and
//! [`crate::sim`] provides an in-memory network for tests.

use crate::error::{ChannelError, ConnectionError};
use crate::protocol::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Label of the channel that carries file transfers
pub const DATA_CHANNEL_LABEL: &str = "file";

/// Backend connection state as reported by the primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Events raised by a peer connection
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A local connectivity candidate was discovered
    LocalCandidate(IceCandidate),
    StateChanged(ConnectionState),
    /// The remote side opened a data channel
    DataChannel(ChannelHandle),
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError>;

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), ConnectionError>;

    async fn set_remote_description(&self, desc: SessionDescription)
    -> Result<(), ConnectionError>;

    /// Fails with [`ConnectionError::NoRemoteDescription`] when called too early
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError>;

    async fn create_data_channel(&self, label: &str) -> Result<ChannelHandle, ConnectionError>;

    async fn close(&self) -> Result<(), ConnectionError>;
}

/// Factory for peer connections
///
/// Every connection reports its events on the sender handed to `connect`.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<dyn PeerConnection>, ConnectionError>;
}

/// Payload of one channel message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Bytes),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(ChannelMessage),
    Closed,
    Error(String),
}

/// Ordered, reliable message channel between two peers
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    async fn send_text(&self, text: String) -> Result<(), ChannelError>;

    async fn send_binary(&self, data: Bytes) -> Result<(), ChannelError>;

    /// Bytes queued locally and not yet handed to the transport
    async fn buffered_amount(&self) -> usize;

    /// Resolve once the buffered amount is at or below `low_water`
    async fn wait_for_drain(&self, low_water: usize) -> Result<(), ChannelError>;

    async fn close(&self) -> Result<(), ChannelError>;
}

/// A data channel together with its event stream
pub struct ChannelHandle {
    pub channel: Arc<dyn DataChannel>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("label", &self.channel.label())
            .field("open", &self.channel.is_open())
            .finish()
    }
}
