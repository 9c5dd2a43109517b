//! Peer connections backed by the `webrtc` crate

use crate::connection::{
    ChannelEvent, ChannelHandle, ChannelMessage, ConnectionEvent, ConnectionState, Connector,
    DataChannel, PeerConnection,
};
use crate::error::{ChannelError, ConnectionError};
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

fn backend(e: webrtc::Error) -> ConnectionError {
    ConnectionError::Backend(e.to_string())
}

fn channel_backend(e: webrtc::Error) -> ChannelError {
    ChannelError::Backend(e.to_string())
}

/// Creates WebRTC peer connections using a fixed set of ICE servers
#[derive(Debug, Clone)]
pub struct RtcConnector {
    ice_servers: Vec<String>,
}

impl RtcConnector {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl Connector for RtcConnector {
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<dyn PeerConnection>, ConnectionError> {
        let mut media = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut media).map_err(backend)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await.map_err(backend)?);

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = tx.clone();
            Box::pin(async move {
                // `None` marks the end of gathering
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(ConnectionEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => tracing::warn!("Failed to serialize local candidate: {}", e),
                }
            })
        }));

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let tx = tx.clone();
            Box::pin(async move {
                let mapped = match state {
                    RTCPeerConnectionState::New => ConnectionState::New,
                    RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                    RTCPeerConnectionState::Connected => ConnectionState::Connected,
                    RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                    RTCPeerConnectionState::Failed => ConnectionState::Failed,
                    RTCPeerConnectionState::Closed => ConnectionState::Closed,
                    RTCPeerConnectionState::Unspecified => return,
                };
                let _ = tx.send(ConnectionEvent::StateChanged(mapped));
            })
        }));

        let tx = events;
        pc.on_data_channel(Box::new(move |dc| {
            let tx = tx.clone();
            Box::pin(async move {
                tracing::debug!("Remote data channel '{}' announced", dc.label());
                let handle = RtcChannel::attach(dc);
                let _ = tx.send(ConnectionEvent::DataChannel(handle));
            })
        }));

        Ok(Arc::new(RtcPeer { pc }))
    }
}

pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, ConnectionError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SdpKind::Rollback => {
            return Err(ConnectionError::Backend(
                "rollback descriptions are not supported".to_string(),
            ));
        }
    }
    .map_err(backend)
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, ConnectionError> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => {
            return Err(ConnectionError::Backend(
                "session description has no type".to_string(),
            ));
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError> {
        from_rtc(self.pc.create_offer(None).await.map_err(backend)?)
    }

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
        from_rtc(self.pc.create_answer(None).await.map_err(backend)?)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), ConnectionError> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(backend)
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), ConnectionError> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(backend)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        if self.pc.remote_description().await.is_none() {
            return Err(ConnectionError::NoRemoteDescription);
        }
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc.add_ice_candidate(init).await.map_err(backend)
    }

    async fn create_data_channel(&self, label: &str) -> Result<ChannelHandle, ConnectionError> {
        // Ordered and fully reliable; the receiver relies on both
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(backend)?;
        Ok(RtcChannel::attach(dc))
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        self.pc.close().await.map_err(backend)
    }
}

/// A `webrtc` data channel with its callbacks routed into a [`ChannelHandle`]
pub struct RtcChannel {
    dc: Arc<RTCDataChannel>,
}

impl RtcChannel {
    fn attach(dc: Arc<RTCDataChannel>) -> ChannelHandle {
        let (tx, events) = mpsc::unbounded_channel();

        let open_tx = tx.clone();
        dc.on_open(Box::new(move || {
            Box::pin(async move {
                let _ = open_tx.send(ChannelEvent::Open);
            })
        }));

        let close_tx = tx.clone();
        dc.on_close(Box::new(move || {
            let close_tx = close_tx.clone();
            Box::pin(async move {
                let _ = close_tx.send(ChannelEvent::Closed);
            })
        }));

        let error_tx = tx.clone();
        dc.on_error(Box::new(move |err| {
            let error_tx = error_tx.clone();
            Box::pin(async move {
                let _ = error_tx.send(ChannelEvent::Error(err.to_string()));
            })
        }));

        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let tx = tx.clone();
            Box::pin(async move {
                let payload = if msg.is_string {
                    match String::from_utf8(msg.data.to_vec()) {
                        Ok(text) => ChannelMessage::Text(text),
                        Err(e) => {
                            tracing::warn!("Dropping non-UTF-8 text message: {}", e);
                            return;
                        }
                    }
                } else {
                    ChannelMessage::Binary(msg.data)
                };
                let _ = tx.send(ChannelEvent::Message(payload));
            })
        }));

        ChannelHandle {
            channel: Arc::new(RtcChannel { dc }),
            events,
        }
    }
}

#[async_trait]
impl DataChannel for RtcChannel {
    fn label(&self) -> &str {
        self.dc.label()
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: String) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::NotOpen);
        }
        self.dc
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(channel_backend)
    }

    async fn send_binary(&self, data: Bytes) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::NotOpen);
        }
        self.dc.send(&data).await.map(|_| ()).map_err(channel_backend)
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn wait_for_drain(&self, low_water: usize) -> Result<(), ChannelError> {
        loop {
            if !self.is_open() {
                return Err(ChannelError::NotOpen);
            }
            if self.dc.buffered_amount().await <= low_water {
                return Ok(());
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    async fn close(&self) -> Result<(), ChannelError> {
        self.dc.close().await.map_err(channel_backend)
    }
}
