//! Session loop
//!
//! Owns one [`NegotiationEngine`] and the data channel it produces. The UI
//! (or CLI) drives it with [`SessionCommand`]s and observes it through
//! [`SessionEvent`]s; signaling traffic flows through a pair of channels so
//! the loop does not care how messages reach the broker.

use crate::connection::{Connector, DataChannel};
use crate::negotiation::{NegotiationEngine, NegotiationEvent, Phase, Role};
use crate::protocol::SignalMessage;
use crate::transfer::{
    OutgoingFile, ReceivedFile, ReceiverEvent, TransferProgress, send_file, spawn_receiver,
};
use bytes::Bytes;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Commands from the UI to the session
#[derive(Debug)]
pub enum SessionCommand {
    /// Join a room, or ask the broker for a new one when `None`
    JoinRoom { room_id: Option<String> },
    /// Send a file over the open data channel
    SendFile(PathBuf),
    /// Send an in-memory buffer
    SendBytes { name: String, data: Bytes },
    /// Leave the room and drop the peer connection
    Leave,
}

/// Reports from the session to the UI
#[derive(Debug, Clone)]
pub enum SessionEvent {
    JoinedRoom { room_id: String },
    PeerJoined { peer_id: String },
    PeerLeft { peer_id: String },
    RoleDecided(Role),
    PhaseChanged(Phase),
    ChannelOpen,
    ChannelClosed,
    TransferProgress(TransferProgress),
    FileSent { name: String, size: u64 },
    FileReceived {
        name: String,
        size: u64,
        /// Where the file was written, when a download directory is set
        saved_path: Option<PathBuf>,
        data: Bytes,
    },
    /// Negotiation or connection failure; rejoin the room to retry
    NegotiationFailed(String),
    Error(String),
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub peer_id: String,
    /// Received files are saved here; `None` keeps them in memory only
    pub download_dir: Option<PathBuf>,
}

struct ActiveChannel {
    channel: Arc<dyn DataChannel>,
    receiver: JoinHandle<()>,
}

/// Run a session until the command channel closes.
///
/// Returns an error if the signaling channel goes away first.
pub async fn run_session(
    connector: Arc<dyn Connector>,
    signal_tx: mpsc::UnboundedSender<SignalMessage>,
    mut signal_rx: mpsc::UnboundedReceiver<SignalMessage>,
    mut cmd_rx: mpsc::Receiver<SessionCommand>,
    event_tx: mpsc::Sender<SessionEvent>,
    options: SessionOptions,
) -> anyhow::Result<()> {
    let peer_id = options.peer_id.clone();
    tracing::info!("Session started for peer {}", peer_id);

    let (neg_tx, mut neg_rx) = mpsc::unbounded_channel();
    let (mut engine, mut conn_rx) =
        NegotiationEngine::new(&peer_id, connector.clone(), signal_tx.clone(), neg_tx.clone());

    // Receiver events are tagged with the channel generation so that a late
    // event from a dropped channel is not mistaken for the current one
    let (recv_tx, mut recv_rx) = mpsc::unbounded_channel::<(u64, ReceiverEvent)>();
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<TransferProgress>();
    let (sent_tx, mut sent_rx) = mpsc::unbounded_channel::<SendOutcome>();
    let mut generation: u64 = 0;
    let mut active: Option<ActiveChannel> = None;
    let mut channel_open = false;
    let mut sends = SendQueue::default();

    let result = loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break Ok(()) };
                match cmd {
                    SessionCommand::JoinRoom { room_id } => {
                        if engine.room_id().is_some() || engine.phase().is_terminal() {
                            cancel_sends(&mut sends, &event_tx).await;
                            reset_engine(&mut engine, &mut active).await;
                            (engine, conn_rx) = NegotiationEngine::new(
                                &peer_id,
                                connector.clone(),
                                signal_tx.clone(),
                                neg_tx.clone(),
                            );
                            channel_open = false;
                        }
                        tracing::info!("Joining room {:?}", room_id);
                        if signal_tx
                            .send(SignalMessage::JoinRoom { room_id, peer_id: peer_id.clone() })
                            .is_err()
                        {
                            break Err(anyhow::anyhow!("signaling connection closed"));
                        }
                    }
                    SessionCommand::SendFile(path) => match OutgoingFile::open(&path).await {
                        Ok(file) => {
                            let channel = open_channel(&active, channel_open);
                            sends.push(file, channel, &progress_tx, &sent_tx, &event_tx).await;
                        }
                        Err(e) => {
                            emit(&event_tx, SessionEvent::Error(format!(
                                "Cannot open {}: {}", path.display(), e
                            ))).await;
                        }
                    },
                    SessionCommand::SendBytes { name, data } => {
                        let file = OutgoingFile::from_bytes(name, data);
                        let channel = open_channel(&active, channel_open);
                        sends.push(file, channel, &progress_tx, &sent_tx, &event_tx).await;
                    }
                    SessionCommand::Leave => {
                        let _ = signal_tx.send(SignalMessage::Leave);
                        cancel_sends(&mut sends, &event_tx).await;
                        reset_engine(&mut engine, &mut active).await;
                        (engine, conn_rx) = NegotiationEngine::new(
                            &peer_id,
                            connector.clone(),
                            signal_tx.clone(),
                            neg_tx.clone(),
                        );
                        channel_open = false;
                    }
                }
            }

            msg = signal_rx.recv() => {
                let Some(msg) = msg else {
                    tracing::warn!("Signaling channel closed");
                    emit(&event_tx, SessionEvent::Error("signaling connection closed".to_string())).await;
                    break Err(anyhow::anyhow!("signaling connection closed"));
                };
                match &msg {
                    SignalMessage::JoinedRoom { room_id } => {
                        emit(&event_tx, SessionEvent::JoinedRoom { room_id: room_id.clone() }).await;
                    }
                    SignalMessage::PeerJoined { peer_id: remote, .. } if *remote != peer_id => {
                        emit(&event_tx, SessionEvent::PeerJoined { peer_id: remote.clone() }).await;
                    }
                    SignalMessage::PeerLeft { peer_id: remote } => {
                        emit(&event_tx, SessionEvent::PeerLeft { peer_id: remote.clone() }).await;
                    }
                    _ => {}
                }
                if let Err(e) = engine.handle_signal(msg).await {
                    if e.is_rejected_transition() {
                        tracing::warn!("Ignoring signaling message: {}", e);
                    } else {
                        tracing::error!("Negotiation failed: {}", e);
                        emit(&event_tx, SessionEvent::NegotiationFailed(e.to_string())).await;
                    }
                }
            }

            Some(event) = conn_rx.recv() => {
                if let Err(e) = engine.handle_connection_event(event).await {
                    tracing::error!("Connection event failed: {}", e);
                    emit(&event_tx, SessionEvent::NegotiationFailed(e.to_string())).await;
                }
            }

            Some(event) = neg_rx.recv() => match event {
                NegotiationEvent::RoleDecided(role) => {
                    emit(&event_tx, SessionEvent::RoleDecided(role)).await;
                }
                NegotiationEvent::PhaseChanged(phase) => {
                    emit(&event_tx, SessionEvent::PhaseChanged(phase)).await;
                }
                NegotiationEvent::ChannelReady(handle) => {
                    if let Some(old) = active.take() {
                        old.receiver.abort();
                    }
                    generation += 1;
                    let tag = generation;
                    let tx = recv_tx.clone();
                    let receiver = spawn_receiver(handle.events, move |event| {
                        let _ = tx.send((tag, event));
                    });
                    // The channel may already be open when handed over
                    channel_open = handle.channel.is_open();
                    if channel_open {
                        emit(&event_tx, SessionEvent::ChannelOpen).await;
                    }
                    active = Some(ActiveChannel { channel: handle.channel, receiver });
                }
                NegotiationEvent::Failed(reason) => {
                    emit(&event_tx, SessionEvent::NegotiationFailed(reason)).await;
                }
            },

            Some((tag, event)) = recv_rx.recv() => {
                if tag != generation {
                    continue;
                }
                match event {
                    ReceiverEvent::Opened => {
                        if !channel_open {
                            channel_open = true;
                            tracing::info!("Data channel open");
                            emit(&event_tx, SessionEvent::ChannelOpen).await;
                        }
                    }
                    ReceiverEvent::Progress(progress) => {
                        emit(&event_tx, SessionEvent::TransferProgress(progress)).await;
                    }
                    ReceiverEvent::Completed(file) => {
                        let event = deliver_file(file, options.download_dir.as_deref()).await;
                        emit(&event_tx, event).await;
                    }
                    ReceiverEvent::Failed(e) => {
                        emit(&event_tx, SessionEvent::Error(format!("Receive failed: {}", e))).await;
                    }
                    ReceiverEvent::Closed => {
                        channel_open = false;
                        tracing::info!("Data channel closed");
                        emit(&event_tx, SessionEvent::ChannelClosed).await;
                    }
                }
            }

            Some(progress) = progress_rx.recv() => {
                emit(&event_tx, SessionEvent::TransferProgress(progress)).await;
            }

            Some(SendOutcome { id, name, result }) = sent_rx.recv() => {
                match result {
                    Ok(size) => emit(&event_tx, SessionEvent::FileSent { name, size }).await,
                    Err(error) => {
                        emit(&event_tx, SessionEvent::Error(format!("Sending {} failed: {}", name, error))).await;
                    }
                }
                let channel = open_channel(&active, channel_open);
                sends.finished(id, channel, &progress_tx, &sent_tx, &event_tx).await;
            }
        }
    };

    if engine.room_id().is_some() {
        let _ = signal_tx.send(SignalMessage::Leave);
    }
    let dropped = sends.cancel();
    if !dropped.is_empty() {
        tracing::warn!("Session stopped with unsent files: {:?}", dropped);
    }
    reset_engine(&mut engine, &mut active).await;
    tracing::info!("Session for peer {} stopped", peer_id);
    result
}

struct SendOutcome {
    id: u64,
    name: String,
    result: Result<u64, String>,
}

struct InFlight {
    id: u64,
    name: String,
    task: JoinHandle<()>,
}

/// Outgoing files; only one is on the channel at a time so chunks of two
/// files never interleave
#[derive(Default)]
struct SendQueue {
    next_id: u64,
    in_flight: Option<InFlight>,
    waiting: VecDeque<OutgoingFile>,
}

impl SendQueue {
    /// Start `file` now, or park it behind the send in flight
    async fn push(
        &mut self,
        file: OutgoingFile,
        channel: Option<Arc<dyn DataChannel>>,
        progress_tx: &mpsc::UnboundedSender<TransferProgress>,
        sent_tx: &mpsc::UnboundedSender<SendOutcome>,
        event_tx: &mpsc::Sender<SessionEvent>,
    ) {
        let Some(channel) = channel else {
            reject(event_tx, file.name()).await;
            return;
        };
        if self.in_flight.is_some() {
            tracing::info!("Queued {} behind the current transfer", file.name());
            self.waiting.push_back(file);
            return;
        }
        self.start(channel, file, progress_tx, sent_tx);
    }

    /// Clear the send `id` and move on to the next waiting file
    async fn finished(
        &mut self,
        id: u64,
        channel: Option<Arc<dyn DataChannel>>,
        progress_tx: &mpsc::UnboundedSender<TransferProgress>,
        sent_tx: &mpsc::UnboundedSender<SendOutcome>,
        event_tx: &mpsc::Sender<SessionEvent>,
    ) {
        if self.in_flight.as_ref().is_none_or(|f| f.id != id) {
            return;
        }
        self.in_flight = None;
        let Some(next) = self.waiting.pop_front() else {
            return;
        };
        match channel {
            Some(channel) => self.start(channel, next, progress_tx, sent_tx),
            None => {
                reject(event_tx, next.name()).await;
                for file in self.waiting.drain(..) {
                    reject(event_tx, file.name()).await;
                }
            }
        }
    }

    /// Abort the send in flight and drop the waiting files, returning the
    /// names of everything that did not go out
    fn cancel(&mut self) -> Vec<String> {
        let mut dropped = Vec::new();
        if let Some(f) = self.in_flight.take() {
            if !f.task.is_finished() {
                f.task.abort();
                dropped.push(f.name);
            }
        }
        dropped.extend(self.waiting.drain(..).map(|f| f.name().to_string()));
        dropped
    }

    fn start(
        &mut self,
        channel: Arc<dyn DataChannel>,
        file: OutgoingFile,
        progress_tx: &mpsc::UnboundedSender<TransferProgress>,
        sent_tx: &mpsc::UnboundedSender<SendOutcome>,
    ) {
        self.next_id += 1;
        let id = self.next_id;
        let name = file.name().to_string();
        let progress_tx = progress_tx.clone();
        let sent_tx = sent_tx.clone();
        let task_name = name.clone();
        let task = tokio::spawn(async move {
            let result = match send_file(channel.as_ref(), file, Some(&progress_tx)).await {
                Ok(size) => {
                    // Report only once the last chunk has left the local buffer
                    if let Err(e) = channel.wait_for_drain(0).await {
                        tracing::warn!("Channel closed before {} was flushed: {}", task_name, e);
                    }
                    Ok(size)
                }
                Err(e) => Err(e.to_string()),
            };
            let _ = sent_tx.send(SendOutcome {
                id,
                name: task_name,
                result,
            });
        });
        self.in_flight = Some(InFlight { id, name, task });
    }
}

fn open_channel(active: &Option<ActiveChannel>, channel_open: bool) -> Option<Arc<dyn DataChannel>> {
    match active {
        Some(active) if channel_open => Some(active.channel.clone()),
        _ => None,
    }
}

async fn reject(event_tx: &mpsc::Sender<SessionEvent>, name: &str) {
    tracing::warn!("Cannot send {}: no open data channel", name);
    emit(
        event_tx,
        SessionEvent::Error(format!("Cannot send {}: data channel not open", name)),
    )
    .await;
}

async fn cancel_sends(sends: &mut SendQueue, event_tx: &mpsc::Sender<SessionEvent>) {
    for name in sends.cancel() {
        emit(event_tx, SessionEvent::Error(format!("Sending {} cancelled", name))).await;
    }
}

async fn deliver_file(file: ReceivedFile, download_dir: Option<&std::path::Path>) -> SessionEvent {
    let saved_path = match download_dir {
        Some(dir) => match file.save_into(dir).await {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::error!("Failed to save {}: {}", file.name, e);
                return SessionEvent::Error(format!("Failed to save {}: {}", file.name, e));
            }
        },
        None => None,
    };
    SessionEvent::FileReceived {
        size: file.size(),
        name: file.name,
        saved_path,
        data: file.data,
    }
}

async fn reset_engine(engine: &mut NegotiationEngine, active: &mut Option<ActiveChannel>) {
    if let Some(old) = active.take() {
        let _ = old.channel.close().await;
        old.receiver.abort();
    }
    engine.close().await;
}

async fn emit(event_tx: &mpsc::Sender<SessionEvent>, event: SessionEvent) {
    let _ = event_tx.send(event).await;
}
