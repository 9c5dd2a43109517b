use bytes::Bytes;
use peerdrop_core::connection::{ChannelEvent, ChannelMessage, DataChannel};
use peerdrop_core::sim::{MemoryChannel, MemoryEnd};
use peerdrop_core::transfer::{CHUNK_SIZE, OutgoingFile, Receiver, init_receiver, send_file};
use peerdrop_core::TransferError;
use std::time::Duration;
use tokio::sync::mpsc;

fn payload(len: usize) -> Bytes {
    (0..len).map(|i| (i * 7 % 256) as u8).collect::<Vec<_>>().into()
}

/// Run everything queued on `end` through a fresh receiver
fn receive_all(end: &mut MemoryEnd) -> (usize, Vec<Bytes>) {
    let mut receiver = Receiver::new();
    let mut chunks = 0;
    let mut files = Vec::new();
    while let Ok(event) = end.events.try_recv() {
        if let ChannelEvent::Message(msg) = event {
            if matches!(msg, ChannelMessage::Binary(_)) {
                chunks += 1;
            }
            if let Some(file) = receiver.handle(msg).unwrap() {
                files.push(file.data);
            }
        }
    }
    (chunks, files)
}

#[tokio::test]
async fn test_round_trip_chunk_counts() {
    for size in [1, CHUNK_SIZE - 1, CHUNK_SIZE, CHUNK_SIZE + 1, 100_000, 3 * CHUNK_SIZE] {
        let (a, mut b) = MemoryChannel::open_pair("file-transfer");
        let data = payload(size);

        let sent = send_file(
            a.channel.as_ref(),
            OutgoingFile::from_bytes("data.bin", data.clone()),
            None,
        )
        .await
        .unwrap();
        assert_eq!(sent, size as u64);

        let (chunks, files) = receive_all(&mut b);
        assert_eq!(chunks, size.div_ceil(CHUNK_SIZE), "size {}", size);
        assert_eq!(files.len(), 1);
        assert!(files[0] == data, "size {}", size);
    }
}

#[tokio::test]
async fn test_backpressure_stalls_and_resumes() {
    let (a, b) = MemoryChannel::open_pair("file-transfer");
    let data = payload(10 * CHUNK_SIZE);
    a.channel.stall_after(3);

    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let _receiver = init_receiver(b.events, move |file| {
        let _ = done_tx.send(file);
    });

    let sender = a.channel.clone();
    let file = OutgoingFile::from_bytes("stalled.bin", data.clone());
    let task = tokio::spawn(async move { send_file(sender.as_ref(), file, None).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(a.channel.binary_sent(), 3);
    assert!(!task.is_finished());
    assert!(a.channel.buffered_amount().await > peerdrop_core::transfer::HIGH_WATER_MARK);

    a.channel.drain();
    let sent = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("sender did not resume")
        .unwrap()
        .unwrap();
    assert_eq!(sent, data.len() as u64);
    assert_eq!(a.channel.binary_sent(), 10);

    let file = tokio::time::timeout(Duration::from_secs(5), done_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(file.name, "stalled.bin");
    assert!(file.data == data);
}

#[tokio::test]
async fn test_channel_closing_during_stall_fails_send() {
    let (a, _b) = MemoryChannel::open_pair("file-transfer");
    a.channel.stall_after(1);

    let sender = a.channel.clone();
    let file = OutgoingFile::from_bytes("cut.bin", payload(4 * CHUNK_SIZE));
    let task = tokio::spawn(async move { send_file(sender.as_ref(), file, None).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    a.channel.close().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(TransferError::Channel(_))));
    assert_eq!(a.channel.binary_sent(), 1);
}

#[tokio::test]
async fn test_sequential_files_on_one_channel() {
    let (a, mut b) = MemoryChannel::open_pair("file-transfer");
    let first = payload(CHUNK_SIZE * 2 + 5);
    let second = payload(42);

    send_file(a.channel.as_ref(), OutgoingFile::from_bytes("one", first.clone()), None)
        .await
        .unwrap();
    send_file(a.channel.as_ref(), OutgoingFile::from_bytes("two", second.clone()), None)
        .await
        .unwrap();

    let (chunks, files) = receive_all(&mut b);
    assert_eq!(chunks, 4);
    assert_eq!(files.len(), 2);
    assert!(files[0] == first);
    assert!(files[1] == second);
}
