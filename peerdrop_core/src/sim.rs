//! In-memory peer connections
//!
//! A [`SimNetwork`] links connections created through its [`SimConnector`]
//! once both sides hold a local and a remote description, the same point at
//! which a real connection starts carrying data. Channels deliver messages
//! instantly; the buffered amount only moves when a test forces it, which
//! makes backpressure deterministic.

use crate::connection::{
    ChannelEvent, ChannelHandle, ChannelMessage, ConnectionEvent, ConnectionState, Connector,
    DataChannel, PeerConnection,
};
use crate::error::{ChannelError, ConnectionError};
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Buffered amount reported once a stall is triggered; above the high-water mark
pub const STALL_BUFFERED: usize = 5 * 1024 * 1024;

/// Local candidates announced per connection
const CANDIDATES_PER_ENDPOINT: u16 = 2;

pub type EndpointId = u64;

struct Link {
    opened: AtomicBool,
    closed: CancellationToken,
}

/// One end of an in-memory data channel
pub struct MemoryChannel {
    label: String,
    link: Arc<Link>,
    to_self: mpsc::UnboundedSender<ChannelEvent>,
    to_peer: mpsc::UnboundedSender<ChannelEvent>,
    buffered: watch::Sender<usize>,
    stall_after: AtomicU64,
    binary_sent: AtomicU64,
}

/// A [`MemoryChannel`] with its event stream
pub struct MemoryEnd {
    pub channel: Arc<MemoryChannel>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl MemoryEnd {
    pub fn into_handle(self) -> ChannelHandle {
        ChannelHandle {
            channel: self.channel,
            events: self.events,
        }
    }
}

impl MemoryChannel {
    /// Two connected ends that are not open yet
    pub fn pair(label: &str) -> (MemoryEnd, MemoryEnd) {
        let link = Arc::new(Link {
            opened: AtomicBool::new(false),
            closed: CancellationToken::new(),
        });
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();

        let a = Arc::new(MemoryChannel::new(label, link.clone(), a_tx.clone(), b_tx.clone()));
        let b = Arc::new(MemoryChannel::new(label, link, b_tx, a_tx));
        (
            MemoryEnd {
                channel: a,
                events: a_rx,
            },
            MemoryEnd {
                channel: b,
                events: b_rx,
            },
        )
    }

    /// Two connected ends, already open
    pub fn open_pair(label: &str) -> (MemoryEnd, MemoryEnd) {
        let (mut a, mut b) = Self::pair(label);
        a.channel.mark_open();
        // Drop the `Open` notifications so tests only see payload
        let _ = a.events.try_recv();
        let _ = b.events.try_recv();
        (a, b)
    }

    fn new(
        label: &str,
        link: Arc<Link>,
        to_self: mpsc::UnboundedSender<ChannelEvent>,
        to_peer: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self {
        let (buffered, _) = watch::channel(0);
        Self {
            label: label.to_string(),
            link,
            to_self,
            to_peer,
            buffered,
            stall_after: AtomicU64::new(u64::MAX),
            binary_sent: AtomicU64::new(0),
        }
    }

    /// Open both ends; each side sees one `Open` event
    pub fn mark_open(&self) {
        if self.link.closed.is_cancelled() || self.link.opened.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.to_self.send(ChannelEvent::Open);
        let _ = self.to_peer.send(ChannelEvent::Open);
    }

    /// Pretend `amount` bytes are queued on this end
    pub fn force_buffered(&self, amount: usize) {
        self.buffered.send_replace(amount);
    }

    /// Flush the pretend queue, waking any sender waiting for drain
    pub fn drain(&self) {
        self.buffered.send_replace(0);
    }

    /// Report [`STALL_BUFFERED`] once `chunks` binary messages have been sent
    pub fn stall_after(&self, chunks: u64) {
        self.stall_after.store(chunks, Ordering::SeqCst);
    }

    /// Number of binary messages sent from this end
    pub fn binary_sent(&self) -> u64 {
        self.binary_sent.load(Ordering::SeqCst)
    }

    fn deliver(&self, msg: ChannelMessage) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::NotOpen);
        }
        self.to_peer
            .send(ChannelEvent::Message(msg))
            .map_err(|_| ChannelError::Backend("remote end dropped".to_string()))
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.link.opened.load(Ordering::SeqCst) && !self.link.closed.is_cancelled()
    }

    async fn send_text(&self, text: String) -> Result<(), ChannelError> {
        self.deliver(ChannelMessage::Text(text))
    }

    async fn send_binary(&self, data: Bytes) -> Result<(), ChannelError> {
        self.deliver(ChannelMessage::Binary(data))?;
        let sent = self.binary_sent.fetch_add(1, Ordering::SeqCst) + 1;
        if sent == self.stall_after.load(Ordering::SeqCst) {
            self.stall_after.store(u64::MAX, Ordering::SeqCst);
            self.force_buffered(STALL_BUFFERED);
        }
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        *self.buffered.borrow()
    }

    async fn wait_for_drain(&self, low_water: usize) -> Result<(), ChannelError> {
        let mut rx = self.buffered.subscribe();
        let drained = async move {
            rx.wait_for(|amount| *amount <= low_water)
                .await
                .map(|_| ())
                .map_err(|e| ChannelError::Backend(e.to_string()))
        };
        tokio::select! {
            result = drained => result,
            _ = self.link.closed.cancelled() => Err(ChannelError::NotOpen),
        }
    }

    async fn close(&self) -> Result<(), ChannelError> {
        if self.link.closed.is_cancelled() {
            return Ok(());
        }
        self.link.closed.cancel();
        let _ = self.to_self.send(ChannelEvent::Closed);
        let _ = self.to_peer.send(ChannelEvent::Closed);
        Ok(())
    }
}

#[derive(Default)]
struct Endpoint {
    events: Option<mpsc::UnboundedSender<ConnectionEvent>>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    peer: Option<EndpointId>,
    applied: Vec<IceCandidate>,
    channels: Vec<Arc<MemoryChannel>>,
    /// Remote ends of locally created channels, handed over on link
    outgoing: Vec<MemoryEnd>,
    linked: bool,
    closed: bool,
}

impl Endpoint {
    fn emit(&self, event: ConnectionEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn ready(&self) -> bool {
        self.local.is_some() && self.remote.is_some() && !self.closed
    }
}

#[derive(Default)]
struct Fabric {
    next_id: EndpointId,
    endpoints: BTreeMap<EndpointId, Endpoint>,
}

/// Shared in-memory network
#[derive(Clone, Default)]
pub struct SimNetwork {
    fabric: Arc<Mutex<Fabric>>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> SimConnector {
        SimConnector {
            network: self.clone(),
        }
    }

    /// Ids of every connection created so far, in creation order
    pub fn endpoint_ids(&self) -> Vec<EndpointId> {
        self.lock().endpoints.keys().copied().collect()
    }

    /// Remote candidates applied to `id`, in application order
    pub fn applied_candidates(&self, id: EndpointId) -> Vec<IceCandidate> {
        self.lock()
            .endpoints
            .get(&id)
            .map(|ep| ep.applied.clone())
            .unwrap_or_default()
    }

    /// Channels owned by `id`, created locally or received from the peer
    pub fn channels(&self, id: EndpointId) -> Vec<Arc<MemoryChannel>> {
        self.lock()
            .endpoints
            .get(&id)
            .map(|ep| ep.channels.clone())
            .unwrap_or_default()
    }

    pub fn is_linked(&self, id: EndpointId) -> bool {
        self.lock().endpoints.get(&id).is_some_and(|ep| ep.linked)
    }

    /// Report a backend state change on `id`, e.g. a lost connection
    pub fn inject_state(&self, id: EndpointId, state: ConnectionState) {
        if let Some(ep) = self.lock().endpoints.get(&id) {
            ep.emit(ConnectionEvent::StateChanged(state));
        }
    }

    fn lock(&self) -> MutexGuard<'_, Fabric> {
        self.fabric.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(&self, events: mpsc::UnboundedSender<ConnectionEvent>) -> EndpointId {
        let mut fabric = self.lock();
        fabric.next_id += 1;
        let id = fabric.next_id;
        fabric.endpoints.insert(
            id,
            Endpoint {
                events: Some(events),
                ..Default::default()
            },
        );
        id
    }

    fn with_endpoint<T>(
        &self,
        id: EndpointId,
        f: impl FnOnce(&mut Endpoint) -> Result<T, ConnectionError>,
    ) -> Result<T, ConnectionError> {
        let mut fabric = self.lock();
        let ep = fabric
            .endpoints
            .get_mut(&id)
            .ok_or(ConnectionError::Closed)?;
        if ep.closed {
            return Err(ConnectionError::Closed);
        }
        f(ep)
    }

    /// Connect `id` with its peer once both sides are fully described
    fn try_link(&self, id: EndpointId) {
        let mut fabric = self.lock();
        let Some(peer) = fabric.endpoints.get(&id).and_then(|ep| ep.peer) else {
            return;
        };
        let both_ready = match (fabric.endpoints.get(&id), fabric.endpoints.get(&peer)) {
            (Some(a), Some(b)) => {
                a.ready() && b.ready() && b.peer == Some(id) && !a.linked && !b.linked
            }
            _ => false,
        };
        if !both_ready {
            return;
        }

        let mut handed = Vec::new();
        for (from, to) in [(id, peer), (peer, id)] {
            if let Some(ep) = fabric.endpoints.get_mut(&from) {
                ep.linked = true;
                handed.extend(ep.outgoing.drain(..).map(|end| (to, end)));
            }
        }
        for ep_id in [id, peer] {
            if let Some(ep) = fabric.endpoints.get(&ep_id) {
                ep.emit(ConnectionEvent::StateChanged(ConnectionState::Connected));
            }
        }
        for (to, end) in handed {
            if let Some(ep) = fabric.endpoints.get_mut(&to) {
                let channel = end.channel.clone();
                ep.channels.push(channel.clone());
                ep.emit(ConnectionEvent::DataChannel(end.into_handle()));
                channel.mark_open();
            }
        }
        tracing::debug!("Sim endpoints {} and {} linked", id, peer);
    }
}

/// Creates [`SimPeer`] connections on a [`SimNetwork`]
#[derive(Clone)]
pub struct SimConnector {
    network: SimNetwork,
}

#[async_trait]
impl Connector for SimConnector {
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<dyn PeerConnection>, ConnectionError> {
        let id = self.network.register(events);
        Ok(Arc::new(SimPeer {
            id,
            network: self.network.clone(),
        }))
    }
}

/// A connection on a [`SimNetwork`]
pub struct SimPeer {
    id: EndpointId,
    network: SimNetwork,
}

impl SimPeer {
    pub fn id(&self) -> EndpointId {
        self.id
    }

    fn describe(&self, kind: SdpKind) -> SessionDescription {
        SessionDescription {
            kind,
            sdp: format!(
                "v=0\r\no={} 0 0 IN IP4 127.0.0.1\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n",
                self.id
            ),
        }
    }
}

fn origin_of(desc: &SessionDescription) -> Option<EndpointId> {
    desc.sdp
        .lines()
        .find_map(|line| line.strip_prefix("o="))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|id| id.parse().ok())
}

#[async_trait]
impl PeerConnection for SimPeer {
    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError> {
        self.network.with_endpoint(self.id, |_| Ok(()))?;
        Ok(self.describe(SdpKind::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
        self.network.with_endpoint(self.id, |ep| {
            if ep.remote.is_none() {
                return Err(ConnectionError::NoRemoteDescription);
            }
            Ok(())
        })?;
        Ok(self.describe(SdpKind::Answer))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), ConnectionError> {
        let id = self.id;
        self.network.with_endpoint(id, |ep| {
            ep.local = Some(desc);
            ep.emit(ConnectionEvent::StateChanged(ConnectionState::Connecting));
            for n in 0..CANDIDATES_PER_ENDPOINT {
                let mut candidate = IceCandidate::new(format!(
                    "candidate:{id}{n} 1 udp 2122260223 10.0.0.{id} {} typ host",
                    50_000 + n
                ));
                candidate.sdp_mid = Some("0".to_string());
                candidate.sdp_mline_index = Some(0);
                ep.emit(ConnectionEvent::LocalCandidate(candidate));
            }
            Ok(())
        })?;
        self.network.try_link(id);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), ConnectionError> {
        let peer = origin_of(&desc)
            .ok_or_else(|| ConnectionError::Backend("description has no origin".to_string()))?;
        self.network.with_endpoint(self.id, |ep| {
            ep.peer = Some(peer);
            ep.remote = Some(desc);
            Ok(())
        })?;
        self.network.try_link(self.id);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        self.network.with_endpoint(self.id, |ep| {
            if ep.remote.is_none() {
                return Err(ConnectionError::NoRemoteDescription);
            }
            ep.applied.push(candidate);
            Ok(())
        })
    }

    async fn create_data_channel(&self, label: &str) -> Result<ChannelHandle, ConnectionError> {
        let (local, remote) = MemoryChannel::pair(label);
        let linked = self.network.with_endpoint(self.id, |ep| {
            ep.channels.push(local.channel.clone());
            Ok(ep.linked)
        })?;

        if linked {
            // Already connected: hand the remote end over right away
            let peer = self.network.with_endpoint(self.id, |ep| Ok(ep.peer))?;
            if let Some(peer) = peer {
                self.network.with_endpoint(peer, |ep| {
                    ep.channels.push(remote.channel.clone());
                    let channel = remote.channel.clone();
                    ep.emit(ConnectionEvent::DataChannel(remote.into_handle()));
                    channel.mark_open();
                    Ok(())
                })?;
            }
        } else {
            self.network.with_endpoint(self.id, |ep| {
                ep.outgoing.push(remote);
                Ok(())
            })?;
        }
        Ok(local.into_handle())
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        let (channels, peer) = {
            let mut fabric = self.network.lock();
            let Some(ep) = fabric.endpoints.get_mut(&self.id) else {
                return Ok(());
            };
            if ep.closed {
                return Ok(());
            }
            ep.closed = true;
            ep.outgoing.clear();
            ep.emit(ConnectionEvent::StateChanged(ConnectionState::Closed));
            let linked_peer = if ep.linked { ep.peer } else { None };
            (ep.channels.clone(), linked_peer)
        };

        for channel in channels {
            let _ = channel.close().await;
        }
        if let Some(peer) = peer {
            self.network.inject_state(peer, ConnectionState::Disconnected);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_channel_delivers_in_order() {
        let (a, mut b) = MemoryChannel::open_pair("file");
        a.channel.send_text("hello".into()).await.unwrap();
        a.channel
            .send_binary(Bytes::from_static(b"\x01\x02"))
            .await
            .unwrap();

        assert_eq!(
            b.events.recv().await.unwrap(),
            ChannelEvent::Message(ChannelMessage::Text("hello".into()))
        );
        assert_eq!(
            b.events.recv().await.unwrap(),
            ChannelEvent::Message(ChannelMessage::Binary(Bytes::from_static(b"\x01\x02")))
        );
        assert_eq!(a.channel.binary_sent(), 1);
    }

    #[tokio::test]
    async fn test_send_before_open_is_rejected() {
        let (a, _b) = MemoryChannel::pair("file");
        assert!(matches!(
            a.channel.send_text("early".into()).await,
            Err(ChannelError::NotOpen)
        ));
    }

    #[tokio::test]
    async fn test_close_notifies_both_ends() {
        let (a, mut b) = MemoryChannel::open_pair("file");
        a.channel.close().await.unwrap();
        assert!(!b.channel.is_open());
        assert_eq!(b.events.recv().await.unwrap(), ChannelEvent::Closed);
    }

    #[tokio::test]
    async fn test_stall_and_drain() {
        let (a, _b) = MemoryChannel::open_pair("file");
        a.channel.stall_after(2);
        a.channel.send_binary(Bytes::from_static(b"1")).await.unwrap();
        assert_eq!(a.channel.buffered_amount().await, 0);
        a.channel.send_binary(Bytes::from_static(b"2")).await.unwrap();
        assert_eq!(a.channel.buffered_amount().await, STALL_BUFFERED);

        let channel = a.channel.clone();
        let waiter = tokio::spawn(async move { channel.wait_for_drain(1024).await });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        a.channel.drain();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_candidates_need_remote_description() {
        let network = SimNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = network.connector().connect(tx).await.unwrap();

        let result = conn.add_ice_candidate(IceCandidate::new("candidate:1")).await;
        assert!(matches!(result, Err(ConnectionError::NoRemoteDescription)));
    }

    #[tokio::test]
    async fn test_offer_answer_links_endpoints() {
        let network = SimNetwork::new();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a = network.connector().connect(a_tx).await.unwrap();
        let b = network.connector().connect(b_tx).await.unwrap();

        let mut a_channel = a.create_data_channel("file").await.unwrap();
        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        let ids = network.endpoint_ids();
        assert!(ids.iter().all(|id| network.is_linked(*id)));

        let mut saw_connected = false;
        while let Ok(event) = a_rx.try_recv() {
            if matches!(event, ConnectionEvent::StateChanged(ConnectionState::Connected)) {
                saw_connected = true;
            }
        }
        assert!(saw_connected);

        let mut b_channel = None;
        while let Ok(event) = b_rx.try_recv() {
            if let ConnectionEvent::DataChannel(handle) = event {
                b_channel = Some(handle);
            }
        }
        let mut b_channel = b_channel.expect("answerer receives the channel");
        assert_eq!(b_channel.channel.label(), "file");
        assert_eq!(a_channel.events.recv().await.unwrap(), ChannelEvent::Open);
        assert_eq!(b_channel.events.recv().await.unwrap(), ChannelEvent::Open);
    }
}
