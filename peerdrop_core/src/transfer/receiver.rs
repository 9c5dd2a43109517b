use crate::connection::{ChannelEvent, ChannelMessage};
use crate::error::TransferError;
use bytes::{Bytes, BytesMut};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::constants::{CHUNK_SIZE, PROGRESS_INTERVAL_CHUNKS};
use super::frame::ControlFrame;
use super::utils::{
    TransferProgress, create_secure_file, format_transfer_speed, sanitize_file_name, unique_path,
    validate_transfer_info,
};

/// A fully reassembled file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    /// Name as declared by the sender, unsanitized
    pub name: String,
    pub data: Bytes,
}

impl ReceivedFile {
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Write the file into `dir` under a sanitized, non-colliding name
    pub async fn save_into(&self, dir: &Path) -> Result<PathBuf, TransferError> {
        tokio::fs::create_dir_all(dir).await?;
        let safe_name = sanitize_file_name(&self.name);
        let path = unique_path(dir, &safe_name).await;

        let mut file = create_secure_file(&path).await?;
        file.write_all(&self.data).await?;
        file.flush().await?;

        tracing::info!("Saved {} to {}", self.name, path.display());
        Ok(path)
    }
}

struct Incoming {
    name: String,
    expected: u64,
    buffer: BytesMut,
    chunks: u64,
    started: Instant,
}

impl Incoming {
    fn received(&self) -> u64 {
        self.buffer.len() as u64
    }

    fn progress(&self) -> TransferProgress {
        TransferProgress {
            file_name: self.name.clone(),
            bytes_done: self.received(),
            total_bytes: self.expected,
            speed: format_transfer_speed(self.received(), self.started.elapsed().as_secs_f64()),
            is_sending: false,
        }
    }

    fn finish(mut self) -> ReceivedFile {
        // A peer that overshoots its declared size gets cut at the boundary
        self.buffer.truncate(self.expected as usize);
        ReceivedFile {
            name: self.name,
            data: self.buffer.freeze(),
        }
    }
}

/// Reassembles one file at a time from channel messages.
///
/// A `meta` frame starts a transfer and discards any unfinished one. The
/// transfer completes as soon as the received byte count reaches the
/// declared size; the trailing `done` frame is only checked for consistency.
#[derive(Default)]
pub struct Receiver {
    current: Option<Incoming>,
    progress: Option<TransferProgress>,
}

impl Receiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a transfer is in progress
    pub fn is_receiving(&self) -> bool {
        self.current.is_some()
    }

    /// Most recent progress snapshot not yet collected
    pub fn take_progress(&mut self) -> Option<TransferProgress> {
        self.progress.take()
    }

    /// Feed one message, returning the file when it completes
    pub fn handle(&mut self, msg: ChannelMessage) -> Result<Option<ReceivedFile>, TransferError> {
        match msg {
            ChannelMessage::Text(text) => self.handle_frame(&text),
            ChannelMessage::Binary(chunk) => Ok(self.handle_chunk(chunk)),
        }
    }

    fn handle_frame(&mut self, text: &str) -> Result<Option<ReceivedFile>, TransferError> {
        match ControlFrame::decode(text)? {
            ControlFrame::Meta { name, size } => {
                if let Some(prev) = self.current.take() {
                    tracing::warn!(
                        "Discarding unfinished transfer of {} ({}/{} bytes)",
                        prev.name,
                        prev.received(),
                        prev.expected
                    );
                }
                self.progress = None;
                validate_transfer_info(&name, size)?;

                tracing::info!("Receiving {} ({} bytes)", name, size);
                let incoming = Incoming {
                    name,
                    expected: size,
                    buffer: BytesMut::with_capacity(size.min(CHUNK_SIZE as u64 * 64) as usize),
                    chunks: 0,
                    started: Instant::now(),
                };
                if size == 0 {
                    return Ok(Some(incoming.finish()));
                }
                self.current = Some(incoming);
                Ok(None)
            }
            ControlFrame::Done => match self.current.take() {
                Some(incoming) => {
                    tracing::warn!(
                        "Sender finished {} early: {}/{} bytes",
                        incoming.name,
                        incoming.received(),
                        incoming.expected
                    );
                    Err(TransferError::Incomplete {
                        received: incoming.received(),
                        expected: incoming.expected,
                        name: incoming.name,
                    })
                }
                None => Ok(None),
            },
            ControlFrame::Unknown => {
                tracing::debug!("Ignoring unknown control frame");
                Ok(None)
            }
        }
    }

    fn handle_chunk(&mut self, chunk: Bytes) -> Option<ReceivedFile> {
        let Some(incoming) = self.current.as_mut() else {
            tracing::warn!("Dropping {} byte chunk: no transfer in progress", chunk.len());
            return None;
        };

        incoming.buffer.extend_from_slice(&chunk);
        incoming.chunks += 1;

        if incoming.received() >= incoming.expected {
            let incoming = self.current.take()?;
            if incoming.received() > incoming.expected {
                tracing::warn!(
                    "{} overshot its declared size by {} bytes",
                    incoming.name,
                    incoming.received() - incoming.expected
                );
            }
            let mut done = incoming.progress();
            done.bytes_done = done.total_bytes;
            self.progress = Some(done);

            let file = incoming.finish();
            tracing::info!("Received {} ({} bytes)", file.name, file.size());
            return Some(file);
        }

        if incoming.chunks % PROGRESS_INTERVAL_CHUNKS == 0 {
            self.progress = Some(incoming.progress());
        }
        None
    }
}

/// What a receiver task reports to its owner
#[derive(Debug)]
pub enum ReceiverEvent {
    Opened,
    Progress(TransferProgress),
    Completed(ReceivedFile),
    Failed(TransferError),
    Closed,
}

/// Drive a [`Receiver`] from a channel's event stream until the channel closes
pub fn spawn_receiver<F>(
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    mut on_event: F,
) -> JoinHandle<()>
where
    F: FnMut(ReceiverEvent) + Send + 'static,
{
    tokio::spawn(async move {
        let mut receiver = Receiver::new();
        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Open => on_event(ReceiverEvent::Opened),
                ChannelEvent::Message(msg) => {
                    let result = receiver.handle(msg);
                    if let Some(progress) = receiver.take_progress() {
                        on_event(ReceiverEvent::Progress(progress));
                    }
                    match result {
                        Ok(Some(file)) => on_event(ReceiverEvent::Completed(file)),
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!("Receive error: {}", e);
                            on_event(ReceiverEvent::Failed(e));
                        }
                    }
                }
                ChannelEvent::Error(e) => tracing::warn!("Data channel error: {}", e),
                ChannelEvent::Closed => break,
            }
        }
        if receiver.is_receiving() {
            tracing::warn!("Data channel closed during a transfer");
        }
        on_event(ReceiverEvent::Closed);
    })
}

/// Register a completion handler on a channel's event stream.
///
/// `on_complete` runs once per fully received file. Progress and failures
/// are only logged; use [`spawn_receiver`] to observe them.
pub fn init_receiver<F>(
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    mut on_complete: F,
) -> JoinHandle<()>
where
    F: FnMut(ReceivedFile) + Send + 'static,
{
    spawn_receiver(events, move |event| {
        if let ReceiverEvent::Completed(file) = event {
            on_complete(file);
        }
    })
}
