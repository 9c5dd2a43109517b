//! Browser-compatible peer-to-peer file transfer
//!
//! Two peers meet in a room on the broker, negotiate a direct connection by
//! exchanging session descriptions and connectivity candidates, then move
//! files over an ordered, reliable data channel.

pub mod config;
pub mod connection;
pub mod error;
pub mod ids;
pub mod negotiation;
pub mod protocol;
pub mod rtc;
pub mod session;
pub mod signaling;
pub mod sim;
pub mod transfer;

pub use config::ClientConfig;
pub use connection::{
    ChannelEvent, ChannelHandle, ChannelMessage, ConnectionEvent, ConnectionState, Connector,
    DataChannel, PeerConnection,
};
pub use error::{ChannelError, ConnectionError, NegotiationError, SignalingError, TransferError};
pub use ids::{generate_peer_id, generate_room_code};
pub use negotiation::{NegotiationEngine, NegotiationEvent, Phase, Role};
pub use protocol::{IceCandidate, SdpKind, SessionDescription, SignalMessage};
pub use session::{SessionCommand, SessionEvent, SessionOptions, run_session};
pub use signaling::SignalingClient;
