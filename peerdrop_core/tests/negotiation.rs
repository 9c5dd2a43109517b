//! Offer/answer between two engines over the in-memory network, with the
//! broker replaced by direct hand-off of signaling messages.

use peerdrop_core::connection::{ConnectionEvent, ConnectionState};
use peerdrop_core::sim::SimNetwork;
use peerdrop_core::{
    IceCandidate, NegotiationEngine, NegotiationEvent, Phase, Role, SignalMessage,
};
use std::sync::Arc;
use tokio::sync::mpsc;

const ROOM: &str = "482913";

struct Side {
    engine: NegotiationEngine,
    conn_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    signal_rx: mpsc::UnboundedReceiver<SignalMessage>,
    events_rx: mpsc::UnboundedReceiver<NegotiationEvent>,
}

impl Side {
    fn new(network: &SimNetwork, peer_id: &str) -> Self {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (engine, conn_rx) =
            NegotiationEngine::new(peer_id, Arc::new(network.connector()), signal_tx, events_tx);
        Self {
            engine,
            conn_rx,
            signal_rx,
            events_rx,
        }
    }

    /// Feed pending connection events back into the engine
    async fn settle(&mut self) {
        while let Ok(event) = self.conn_rx.try_recv() {
            self.engine.handle_connection_event(event).await.unwrap();
        }
    }

    fn outbox(&mut self) -> Vec<SignalMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = self.signal_rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn events(&mut self) -> Vec<NegotiationEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events_rx.try_recv() {
            out.push(event);
        }
        out
    }
}

/// Relay messages both ways until neither side has anything left to say
async fn pump(a: &mut Side, b: &mut Side) {
    loop {
        a.settle().await;
        b.settle().await;
        let to_b = a.outbox();
        let to_a = b.outbox();
        if to_a.is_empty() && to_b.is_empty() {
            break;
        }
        for msg in to_b {
            b.engine.handle_signal(msg).await.unwrap();
        }
        for msg in to_a {
            a.engine.handle_signal(msg).await.unwrap();
        }
    }
}

async fn joined_pair(network: &SimNetwork) -> (Side, Side) {
    let mut a = Side::new(network, "peer-a");
    let mut b = Side::new(network, "peer-b");
    for side in [&mut a, &mut b] {
        side.engine
            .handle_signal(SignalMessage::JoinedRoom {
                room_id: ROOM.to_string(),
            })
            .await
            .unwrap();
    }
    (a, b)
}

fn peer_joined(peer_id: &str) -> SignalMessage {
    SignalMessage::PeerJoined {
        room_id: ROOM.to_string(),
        peer_id: peer_id.to_string(),
    }
}

#[tokio::test]
async fn test_two_peers_reach_connected() {
    let network = SimNetwork::new();
    let (mut a, mut b) = joined_pair(&network).await;

    a.engine.handle_signal(peer_joined("peer-b")).await.unwrap();
    pump(&mut a, &mut b).await;

    assert_eq!(a.engine.role(), Role::Offerer);
    assert_eq!(b.engine.role(), Role::Answerer);
    assert_eq!(a.engine.phase(), Phase::Connected);
    assert_eq!(b.engine.phase(), Phase::Connected);
    assert_eq!(a.engine.queued_candidates(), 0);
    assert_eq!(b.engine.queued_candidates(), 0);

    // Both sides end up holding an open channel
    for side in [&mut a, &mut b] {
        let handle = side
            .events()
            .into_iter()
            .find_map(|e| match e {
                NegotiationEvent::ChannelReady(handle) => Some(handle),
                _ => None,
            })
            .expect("no channel");
        assert!(handle.channel.is_open());
    }
    for id in network.endpoint_ids() {
        assert!(network.is_linked(id));
        assert_eq!(network.applied_candidates(id).len(), 2);
    }
}

#[tokio::test]
async fn test_duplicate_peer_joined_sends_one_offer() {
    let network = SimNetwork::new();
    let (mut a, _b) = joined_pair(&network).await;

    a.engine.handle_signal(peer_joined("peer-b")).await.unwrap();
    let err = a.engine.handle_signal(peer_joined("peer-b")).await.unwrap_err();
    assert!(err.is_rejected_transition());

    a.settle().await;
    let offers = a
        .outbox()
        .into_iter()
        .filter(|m| matches!(m, SignalMessage::Offer { .. }))
        .count();
    assert_eq!(offers, 1);
    assert_eq!(network.endpoint_ids().len(), 1);
}

#[tokio::test]
async fn test_early_candidates_are_applied_in_order() {
    let network = SimNetwork::new();
    let (mut a, mut b) = joined_pair(&network).await;

    a.engine.handle_signal(peer_joined("peer-b")).await.unwrap();
    a.settle().await;
    let mut outbox = a.outbox();
    let offer_at = outbox
        .iter()
        .position(|m| matches!(m, SignalMessage::Offer { .. }))
        .unwrap();
    let offer = outbox.remove(offer_at);
    let candidates: Vec<IceCandidate> = outbox
        .iter()
        .filter_map(|m| match m {
            SignalMessage::Ice { candidate, .. } => Some(candidate.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(candidates.len(), 2);

    // Candidates overtake the offer
    for msg in outbox {
        b.engine.handle_signal(msg).await.unwrap();
    }
    assert_eq!(b.engine.queued_candidates(), 2);
    let b_id = *network.endpoint_ids().last().unwrap();
    assert!(network.applied_candidates(b_id).is_empty());

    b.engine.handle_signal(offer).await.unwrap();
    assert_eq!(b.engine.queued_candidates(), 0);
    assert_eq!(network.applied_candidates(b_id), candidates);
}

#[tokio::test]
async fn test_answer_without_offer_is_rejected() {
    let network = SimNetwork::new();
    let (mut a, _b) = joined_pair(&network).await;

    let err = a
        .engine
        .handle_signal(SignalMessage::Answer {
            room_id: ROOM.to_string(),
            from: "peer-b".to_string(),
            sdp: peerdrop_core::SessionDescription::answer("v=0"),
        })
        .await
        .unwrap_err();
    assert!(err.is_rejected_transition());
    assert_eq!(a.engine.phase(), Phase::Idle);
}

#[tokio::test]
async fn test_own_messages_are_ignored() {
    let network = SimNetwork::new();
    let (mut a, _b) = joined_pair(&network).await;

    a.engine.handle_signal(peer_joined("peer-a")).await.unwrap();
    assert_eq!(a.engine.role(), Role::Undetermined);
    assert!(network.endpoint_ids().is_empty());
}

#[tokio::test]
async fn test_connection_failure_is_reported() {
    let network = SimNetwork::new();
    let (mut a, mut b) = joined_pair(&network).await;
    a.engine.handle_signal(peer_joined("peer-b")).await.unwrap();
    pump(&mut a, &mut b).await;
    a.events();

    let a_id = network.endpoint_ids()[0];
    network.inject_state(a_id, ConnectionState::Failed);
    a.settle().await;

    assert_eq!(a.engine.phase(), Phase::Failed);
    assert!(
        a.events()
            .iter()
            .any(|e| matches!(e, NegotiationEvent::Failed(_)))
    );

    // Closing after a failure is still allowed, and final
    a.engine.close().await;
    assert_eq!(a.engine.phase(), Phase::Closed);
    assert!(a.engine.handle_signal(peer_joined("peer-c")).await.is_err());
}

#[tokio::test]
async fn test_interruption_is_not_a_failure() {
    let network = SimNetwork::new();
    let (mut a, mut b) = joined_pair(&network).await;
    a.engine.handle_signal(peer_joined("peer-b")).await.unwrap();
    pump(&mut a, &mut b).await;
    a.events();

    let a_id = network.endpoint_ids()[0];
    network.inject_state(a_id, ConnectionState::Disconnected);
    a.settle().await;
    assert_eq!(a.engine.phase(), Phase::Connected);
    assert!(
        !a.events()
            .iter()
            .any(|e| matches!(e, NegotiationEvent::Failed(_)))
    );

    // Recovery keeps the engine connected
    network.inject_state(a_id, ConnectionState::Connected);
    a.settle().await;
    assert_eq!(a.engine.phase(), Phase::Connected);
    assert!(
        !a.events()
            .iter()
            .any(|e| matches!(e, NegotiationEvent::Failed(_)))
    );
}
