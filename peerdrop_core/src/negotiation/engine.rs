//! Negotiation engine
//!
//! One engine per local session. It owns the peer connection, decides the
//! offerer/answerer role from room join order and converts signaling
//! messages into session-description exchange.
//!
//! Tiebreak: a peer that is told another peer joined its room sends the
//! offer; the newcomer waits for that offer and answers. Each side can only
//! take a role once, so a repeated `peer-joined` is rejected instead of
//! producing a second offer.

use super::candidates::CandidateQueue;
use super::state::{Phase, Role};
use crate::connection::{
    ChannelHandle, ConnectionEvent, ConnectionState, Connector, DATA_CHANNEL_LABEL, PeerConnection,
};
use crate::error::NegotiationError;
use crate::protocol::{IceCandidate, SessionDescription, SignalMessage};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Events reported by the engine to its owner
#[derive(Debug)]
pub enum NegotiationEvent {
    RoleDecided(Role),
    PhaseChanged(Phase),
    /// A data channel exists (created locally or opened by the remote side)
    ChannelReady(ChannelHandle),
    /// The connection failed or was lost; the caller must rejoin to retry
    Failed(String),
}

pub struct NegotiationEngine {
    peer_id: String,
    room_id: Option<String>,
    connector: Arc<dyn Connector>,
    connection: Option<Arc<dyn PeerConnection>>,
    connection_events: mpsc::UnboundedSender<ConnectionEvent>,
    signal_tx: mpsc::UnboundedSender<SignalMessage>,
    events: mpsc::UnboundedSender<NegotiationEvent>,
    role: Role,
    phase: Phase,
    candidates: CandidateQueue,
}

impl NegotiationEngine {
    /// Create an engine.
    ///
    /// Outgoing signaling goes to `signal_tx`, engine events to `events`. The
    /// returned receiver yields the connection's own events; feed them back
    /// through [`NegotiationEngine::handle_connection_event`].
    pub fn new(
        peer_id: impl Into<String>,
        connector: Arc<dyn Connector>,
        signal_tx: mpsc::UnboundedSender<SignalMessage>,
        events: mpsc::UnboundedSender<NegotiationEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (connection_events, connection_rx) = mpsc::unbounded_channel();
        let engine = Self {
            peer_id: peer_id.into(),
            room_id: None,
            connector,
            connection: None,
            connection_events,
            signal_tx,
            events,
            role: Role::Undetermined,
            phase: Phase::Idle,
            candidates: CandidateQueue::new(),
        };
        (engine, connection_rx)
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn room_id(&self) -> Option<&str> {
        self.room_id.as_deref()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn queued_candidates(&self) -> usize {
        self.candidates.len()
    }

    pub fn set_room(&mut self, room_id: impl Into<String>) {
        self.room_id = Some(room_id.into());
    }

    /// Create the peer connection, or return the existing one
    pub async fn create_connection(&mut self) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        if self.phase.is_terminal() {
            return Err(NegotiationError::Closed);
        }
        if let Some(conn) = &self.connection {
            return Ok(conn.clone());
        }

        let conn = self.connector.connect(self.connection_events.clone()).await?;
        tracing::info!("Peer connection created for {}", self.peer_id);
        self.connection = Some(conn.clone());
        Ok(conn)
    }

    /// Process one message received from the broker
    pub async fn handle_signal(&mut self, msg: SignalMessage) -> Result<(), NegotiationError> {
        if self.phase.is_terminal() {
            return Err(NegotiationError::Closed);
        }
        if msg.sender() == Some(self.peer_id.as_str()) {
            tracing::debug!("Ignoring own {} message", msg.kind());
            return Ok(());
        }

        match msg {
            SignalMessage::JoinedRoom { room_id } => {
                self.set_room(room_id);
                Ok(())
            }
            SignalMessage::PeerJoined { room_id, peer_id } => {
                if self.room_id.is_none() {
                    self.set_room(room_id);
                }
                self.start_offer(&peer_id).await
            }
            SignalMessage::Offer { room_id, from, sdp } => {
                self.accept_offer(room_id, &from, sdp).await
            }
            SignalMessage::Answer { from, sdp, .. } => self.accept_answer(&from, sdp).await,
            SignalMessage::Ice { candidate, .. } => self.add_remote_candidate(candidate).await,
            SignalMessage::PeerLeft { peer_id } => {
                tracing::info!("Peer {} left the room", peer_id);
                Ok(())
            }
            other => {
                tracing::debug!("Ignoring {} message", other.kind());
                Ok(())
            }
        }
    }

    /// Process one event raised by the peer connection
    pub async fn handle_connection_event(
        &mut self,
        event: ConnectionEvent,
    ) -> Result<(), NegotiationError> {
        if self.phase.is_terminal() {
            return Ok(());
        }

        match event {
            ConnectionEvent::LocalCandidate(candidate) => {
                let Some(room_id) = self.room_id.clone() else {
                    tracing::warn!("Dropping local candidate: no room joined");
                    return Ok(());
                };
                self.send_signal(SignalMessage::Ice {
                    room_id,
                    from: self.peer_id.clone(),
                    candidate,
                })?;
            }
            ConnectionEvent::StateChanged(state) => {
                tracing::info!("Connection state: {:?}", state);
                match state {
                    ConnectionState::New => {}
                    ConnectionState::Connecting => self.advance(Phase::Connecting),
                    ConnectionState::Connected => self.advance(Phase::Connected),
                    // Transient: the backend either recovers or reports `Failed`
                    ConnectionState::Disconnected => {
                        tracing::warn!("Peer connection interrupted, waiting for recovery");
                    }
                    ConnectionState::Failed => {
                        tracing::warn!("Peer connection failed");
                        self.advance(Phase::Failed);
                        self.emit(NegotiationEvent::Failed("peer connection failed".to_string()));
                    }
                    ConnectionState::Closed => self.advance(Phase::Closed),
                }
            }
            ConnectionEvent::DataChannel(handle) => {
                tracing::info!("Remote peer opened channel '{}'", handle.channel.label());
                self.emit(NegotiationEvent::ChannelReady(handle));
            }
        }
        Ok(())
    }

    /// Close the connection. Terminal: the engine cannot be reused.
    pub async fn close(&mut self) {
        if self.phase.is_terminal() {
            return;
        }
        self.candidates.clear();
        if let Some(conn) = self.connection.take() {
            if let Err(e) = conn.close().await {
                tracing::warn!("Error while closing peer connection: {}", e);
            }
        }
        self.advance(Phase::Closed);
    }

    async fn start_offer(&mut self, remote_peer: &str) -> Result<(), NegotiationError> {
        let room_id = self.room_id.clone().ok_or(NegotiationError::NoRoom)?;
        self.decide_role(Role::Offerer)?;
        let conn = self.create_connection().await?;
        self.advance(Phase::Connecting);

        // The channel must exist before the offer so the description carries it
        let handle = conn.create_data_channel(DATA_CHANNEL_LABEL).await?;
        self.emit(NegotiationEvent::ChannelReady(handle));

        let offer = conn.create_offer().await?;
        conn.set_local_description(offer.clone()).await?;
        self.send_signal(SignalMessage::Offer {
            room_id,
            from: self.peer_id.clone(),
            sdp: offer,
        })?;

        tracing::info!("Sent offer to {}", remote_peer);
        Ok(())
    }

    async fn accept_offer(
        &mut self,
        room_id: String,
        from: &str,
        offer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.decide_role(Role::Answerer)?;
        if self.room_id.is_none() {
            self.set_room(room_id);
        }
        let room_id = self.room_id.clone().ok_or(NegotiationError::NoRoom)?;
        let conn = self.create_connection().await?;
        self.advance(Phase::Connecting);

        conn.set_remote_description(offer).await?;
        self.candidates.flush(conn.as_ref()).await;

        let answer = conn.create_answer().await?;
        conn.set_local_description(answer.clone()).await?;
        self.send_signal(SignalMessage::Answer {
            room_id,
            from: self.peer_id.clone(),
            sdp: answer,
        })?;

        tracing::info!("Sent answer to {}", from);
        Ok(())
    }

    async fn accept_answer(
        &mut self,
        from: &str,
        answer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        if self.role != Role::Offerer || self.candidates.remote_applied() {
            return Err(NegotiationError::InvalidTransition {
                machine: "negotiation",
                from: self.role.as_str(),
                to: "answer-applied",
            });
        }
        let conn = self.connection.clone().ok_or(NegotiationError::Closed)?;

        conn.set_remote_description(answer).await?;
        self.candidates.flush(conn.as_ref()).await;

        tracing::info!("Applied answer from {}", from);
        Ok(())
    }

    async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let conn = self.create_connection().await?;
        if let Err(e) = self
            .candidates
            .enqueue_or_apply(conn.as_ref(), candidate)
            .await
        {
            tracing::warn!("Failed to apply remote candidate: {}", e);
        }
        Ok(())
    }

    fn decide_role(&mut self, role: Role) -> Result<(), NegotiationError> {
        self.role = self.role.decide(role)?;
        tracing::info!("Negotiation role: {}", self.role);
        self.emit(NegotiationEvent::RoleDecided(self.role));
        Ok(())
    }

    fn advance(&mut self, next: Phase) {
        if self.phase == next {
            return;
        }
        match self.phase.transition(next) {
            Ok(phase) => {
                self.phase = phase;
                self.emit(NegotiationEvent::PhaseChanged(phase));
            }
            Err(e) => tracing::debug!("Ignoring phase change: {}", e),
        }
    }

    fn send_signal(&self, msg: SignalMessage) -> Result<(), NegotiationError> {
        self.signal_tx
            .send(msg)
            .map_err(|_| NegotiationError::SignalingClosed)
    }

    fn emit(&self, event: NegotiationEvent) {
        let _ = self.events.send(event);
    }
}
