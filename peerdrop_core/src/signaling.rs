//! WebSocket client for the room broker

use crate::error::SignalingError;
use crate::protocol::{IceCandidate, SessionDescription, SignalMessage};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

/// Connection to the broker.
///
/// Outgoing messages are queued on an unbounded channel and written by a
/// background task; incoming messages arrive on the receiver returned by
/// [`SignalingClient::connect`].
pub struct SignalingClient {
    peer_id: String,
    tx: mpsc::UnboundedSender<SignalMessage>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SignalingClient {
    pub async fn connect(
        url: &str,
        peer_id: impl Into<String>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalMessage>), SignalingError> {
        let peer_id = peer_id.into();
        let (ws_stream, _) = connect_async(url).await?;
        tracing::info!("Connected to signaling server at {}", url);

        let (mut write, mut read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<SignalMessage>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let writer_cancel = cancel.clone();
        let writer = tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    msg = out_rx.recv() => msg,
                    _ = writer_cancel.cancelled() => {
                        // Flush whatever was queued before the close, e.g. `leave`
                        out_rx.close();
                        out_rx.recv().await
                    }
                };
                let Some(msg) = msg else { break };
                let text = match serde_json::to_string(&msg) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!("Failed to encode {} message: {}", msg.kind(), e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    tracing::warn!("Signaling send failed: {}", e);
                    break;
                }
            }
            let _ = write.send(Message::Close(None)).await;
        });

        let reader_cancel = cancel.clone();
        let reader = tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    frame = read.next() => frame,
                };
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<SignalMessage>(text.as_str()) {
                            Ok(msg) => {
                                if in_tx.send(msg).is_err() {
                                    break;
                                }
                            }
                            Err(e) => tracing::warn!("Ignoring malformed signaling message: {}", e),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!("Signaling connection closed");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!("Signaling receive error: {}", e);
                        break;
                    }
                }
            }
        });

        Ok((
            Self {
                peer_id,
                tx: out_tx,
                cancel,
                tasks: vec![writer, reader],
            },
            in_rx,
        ))
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// A sender that queues outgoing messages, for handing to a session
    pub fn sender(&self) -> mpsc::UnboundedSender<SignalMessage> {
        self.tx.clone()
    }

    /// Ask the broker to join `room_id`, or to create a room when `None`
    pub fn join_room(&self, room_id: Option<String>) -> Result<(), SignalingError> {
        self.send(SignalMessage::JoinRoom {
            room_id,
            peer_id: self.peer_id.clone(),
        })
    }

    pub fn send_offer(&self, room_id: &str, sdp: SessionDescription) -> Result<(), SignalingError> {
        self.send(SignalMessage::Offer {
            room_id: room_id.to_string(),
            from: self.peer_id.clone(),
            sdp,
        })
    }

    pub fn send_answer(&self, room_id: &str, sdp: SessionDescription) -> Result<(), SignalingError> {
        self.send(SignalMessage::Answer {
            room_id: room_id.to_string(),
            from: self.peer_id.clone(),
            sdp,
        })
    }

    pub fn send_ice(&self, room_id: &str, candidate: IceCandidate) -> Result<(), SignalingError> {
        self.send(SignalMessage::Ice {
            room_id: room_id.to_string(),
            from: self.peer_id.clone(),
            candidate,
        })
    }

    pub fn leave(&self) -> Result<(), SignalingError> {
        self.send(SignalMessage::Leave)
    }

    pub fn send(&self, msg: SignalMessage) -> Result<(), SignalingError> {
        self.tx.send(msg).map_err(|_| SignalingError::Closed)
    }

    /// Stop both background tasks and close the socket
    pub async fn close(mut self) {
        self.cancel.cancel();
        for task in std::mem::take(&mut self.tasks) {
            let _ = task.await;
        }
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
