use crate::connection::DataChannel;
use crate::error::TransferError;
use bytes::Bytes;
use std::path::Path;
use std::time::Instant;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

use super::constants::{CHUNK_SIZE, HIGH_WATER_MARK, LOW_WATER_MARK, PROGRESS_INTERVAL_CHUNKS};
use super::frame::ControlFrame;
use super::utils::{TransferProgress, report_progress};

/// A file to send: declared name and size plus a byte source
pub struct OutgoingFile {
    name: String,
    size: u64,
    reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl OutgoingFile {
    /// Open a file on disk
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, TransferError> {
        let path = path.as_ref();
        let file = File::open(path).await?;
        let size = file.metadata().await?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string());

        Ok(Self {
            name,
            size,
            reader: Box::new(file),
        })
    }

    /// Send an in-memory buffer under the given name
    pub fn from_bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            name: name.into(),
            size: data.len() as u64,
            reader: Box::new(std::io::Cursor::new(data)),
        }
    }

    /// Wrap an arbitrary reader that yields exactly `size` bytes
    pub fn from_reader(
        name: impl Into<String>,
        size: u64,
        reader: impl AsyncRead + Send + Unpin + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            size,
            reader: Box::new(reader),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Send one file over an open channel.
///
/// Emits a `meta` frame, the payload as `CHUNK_SIZE` binary messages in
/// offset order, then a `done` frame. While the channel buffers more than
/// `HIGH_WATER_MARK` bytes no chunk is sent until it drains to
/// `LOW_WATER_MARK`. Returns the number of payload bytes sent.
pub async fn send_file(
    channel: &dyn DataChannel,
    mut file: OutgoingFile,
    progress_tx: Option<&mpsc::UnboundedSender<TransferProgress>>,
) -> Result<u64, TransferError> {
    if file.size == 0 {
        tracing::warn!("Refusing to send {}: file is empty", file.name);
        return Err(TransferError::EmptyFile);
    }
    if !channel.is_open() {
        tracing::warn!("Refusing to send {}: data channel not open", file.name);
        return Err(TransferError::ChannelClosed);
    }

    tracing::info!("Sending {} ({} bytes)", file.name, file.size);
    channel
        .send_text(ControlFrame::meta(&file.name, file.size).encode()?)
        .await?;

    let start_time = Instant::now();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut sent: u64 = 0;
    let mut chunks: u64 = 0;

    while sent < file.size {
        let want = std::cmp::min(CHUNK_SIZE as u64, file.size - sent) as usize;
        let n = read_chunk(&mut file.reader, &mut buffer[..want]).await?;
        if n == 0 {
            tracing::error!(
                "Source for {} ended early: {}/{} bytes",
                file.name,
                sent,
                file.size
            );
            return Err(TransferError::SourceTruncated {
                expected: file.size,
                sent,
            });
        }

        let buffered = channel.buffered_amount().await;
        if buffered > HIGH_WATER_MARK {
            tracing::debug!(
                "Backpressure: {} bytes buffered, waiting for drain to {}",
                buffered,
                LOW_WATER_MARK
            );
            channel.wait_for_drain(LOW_WATER_MARK).await?;
            tracing::debug!("Buffer drained, resuming at offset {}", sent);
        }
        if !channel.is_open() {
            return Err(TransferError::ChannelClosed);
        }

        channel
            .send_binary(Bytes::copy_from_slice(&buffer[..n]))
            .await?;
        sent += n as u64;
        chunks += 1;

        if chunks % PROGRESS_INTERVAL_CHUNKS == 0 || sent == file.size {
            report_progress(progress_tx, &file.name, sent, file.size, start_time, true);
        }
    }

    channel.send_text(ControlFrame::Done.encode()?).await?;
    tracing::info!(
        "Sent {} in {} chunks ({:.2}s)",
        file.name,
        chunks,
        start_time.elapsed().as_secs_f64()
    );
    Ok(sent)
}

/// Fill `buf` from `reader`, stopping early only at end of input
async fn read_chunk(
    reader: &mut (dyn AsyncRead + Send + Unpin),
    buf: &mut [u8],
) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ChannelEvent, ChannelMessage};
    use crate::sim::MemoryChannel;

    fn drain_events(
        events: &mut mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> (Vec<ControlFrame>, Vec<Bytes>) {
        let mut frames = Vec::new();
        let mut chunks = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event {
                ChannelEvent::Message(ChannelMessage::Text(t)) => {
                    frames.push(ControlFrame::decode(&t).unwrap())
                }
                ChannelEvent::Message(ChannelMessage::Binary(b)) => chunks.push(b),
                _ => {}
            }
        }
        (frames, chunks)
    }

    #[tokio::test]
    async fn test_chunks_in_offset_order() {
        let (local, mut remote) = MemoryChannel::open_pair("file");
        let data: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();

        let sent = send_file(
            local.channel.as_ref(),
            OutgoingFile::from_bytes("data.bin", data.clone()),
            None,
        )
        .await
        .unwrap();
        assert_eq!(sent, 40_000);

        let (frames, chunks) = drain_events(&mut remote.events);
        assert_eq!(
            frames,
            vec![ControlFrame::meta("data.bin", 40_000), ControlFrame::Done]
        );
        // ceil(40000 / 16384) = 3
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), CHUNK_SIZE);
        assert_eq!(chunks[2].len(), 40_000 - 2 * CHUNK_SIZE);
        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
        assert_eq!(joined, data);
    }

    #[tokio::test]
    async fn test_rejects_empty_file() {
        let (local, mut remote) = MemoryChannel::open_pair("file");
        let result = send_file(
            local.channel.as_ref(),
            OutgoingFile::from_bytes("empty.txt", Vec::new()),
            None,
        )
        .await;
        assert!(matches!(result, Err(TransferError::EmptyFile)));

        // nothing went out, not even the meta frame
        let (frames, chunks) = drain_events(&mut remote.events);
        assert!(frames.is_empty() && chunks.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_closed_channel() {
        let (local, _remote) = MemoryChannel::pair("file");
        let result = send_file(
            local.channel.as_ref(),
            OutgoingFile::from_bytes("a.txt", vec![1u8; 10]),
            None,
        )
        .await;
        assert!(matches!(result, Err(TransferError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_truncated_source() {
        let (local, _remote) = MemoryChannel::open_pair("file");
        let short = std::io::Cursor::new(vec![7u8; 100]);
        let result = send_file(
            local.channel.as_ref(),
            OutgoingFile::from_reader("short.bin", 1_000, short),
            None,
        )
        .await;
        assert!(matches!(
            result,
            Err(TransferError::SourceTruncated {
                expected: 1_000,
                sent: 100
            })
        ));
    }

    #[tokio::test]
    async fn test_reports_progress() {
        let (local, _remote) = MemoryChannel::open_pair("file");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let size = CHUNK_SIZE * PROGRESS_INTERVAL_CHUNKS as usize + 10;

        send_file(
            local.channel.as_ref(),
            OutgoingFile::from_bytes("big.bin", vec![0u8; size]),
            Some(&tx),
        )
        .await
        .unwrap();

        let mut updates = Vec::new();
        while let Ok(p) = rx.try_recv() {
            updates.push(p);
        }
        assert_eq!(updates.len(), 2);
        assert!(updates.iter().all(|p| p.is_sending));
        assert_eq!(updates.last().unwrap().bytes_done, size as u64);
    }
}
