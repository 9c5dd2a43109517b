//! Command-line peer
//!
//! Usage:
//!   peerdrop send <file> [room]   create (or join) a room and send a file
//!   peerdrop receive <room>       join a room and save incoming files
//!
//! The broker URL, ICE servers and download directory come from the client
//! config file; `PEERDROP_SIGNALING_URL` overrides the URL.

use anyhow::{Context, bail};
use peerdrop_core::rtc::RtcConnector;
use peerdrop_core::{
    ClientConfig, SessionCommand, SessionEvent, SessionOptions, SignalingClient, generate_peer_id,
    run_session,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

enum Mode {
    Send { file: PathBuf, room: Option<String> },
    Receive { room: String },
}

fn parse_args() -> anyhow::Result<Mode> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.as_slice() {
        [cmd, file] if cmd == "send" => Ok(Mode::Send {
            file: PathBuf::from(file),
            room: None,
        }),
        [cmd, file, room] if cmd == "send" => Ok(Mode::Send {
            file: PathBuf::from(file),
            room: Some(room.clone()),
        }),
        [cmd, room] if cmd == "receive" => Ok(Mode::Receive { room: room.clone() }),
        _ => bail!("usage: peerdrop send <file> [room] | peerdrop receive <room>"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let mode = parse_args()?;
    let mut config = ClientConfig::load();
    if let Ok(url) = std::env::var("PEERDROP_SIGNALING_URL") {
        config.signaling_url = url;
    }

    let peer_id = generate_peer_id();
    let (client, signal_rx) = SignalingClient::connect(&config.signaling_url, &peer_id)
        .await
        .with_context(|| format!("cannot reach broker at {}", config.signaling_url))?;

    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let (event_tx, mut event_rx) = mpsc::channel(256);
    let options = SessionOptions {
        peer_id: peer_id.clone(),
        download_dir: Some(config.download_path.clone()),
    };
    let session = tokio::spawn(run_session(
        Arc::new(RtcConnector::new(config.ice_servers.clone())),
        client.sender(),
        signal_rx,
        cmd_rx,
        event_tx,
        options,
    ));

    let (room, file) = match mode {
        Mode::Send { file, room } => {
            if !file.is_file() {
                bail!("{} is not a file", file.display());
            }
            (room, Some(file))
        }
        Mode::Receive { room } => (Some(room), None),
    };
    cmd_tx.send(SessionCommand::JoinRoom { room_id: room }).await?;

    let mut pending_file = file;
    let sending = pending_file.is_some();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("Interrupted");
                break;
            }
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    SessionEvent::JoinedRoom { room_id } => {
                        println!("Joined room {}", room_id);
                        if sending {
                            println!("Share this code with the receiver: {}", room_id);
                        }
                    }
                    SessionEvent::PeerJoined { peer_id } => println!("Peer {} joined", peer_id),
                    SessionEvent::PeerLeft { peer_id } => println!("Peer {} left", peer_id),
                    SessionEvent::ChannelOpen => {
                        println!("Connected");
                        if let Some(path) = pending_file.take() {
                            cmd_tx.send(SessionCommand::SendFile(path)).await?;
                        }
                    }
                    SessionEvent::TransferProgress(p) => {
                        println!("{} {:.1}% ({})", p.file_name, p.percent(), p.speed);
                    }
                    SessionEvent::FileSent { name, size } => {
                        println!("Sent {} ({} bytes)", name, size);
                        if sending {
                            break;
                        }
                    }
                    SessionEvent::FileReceived { name, size, saved_path, .. } => {
                        match saved_path {
                            Some(path) => println!("Received {} ({} bytes) -> {}", name, size, path.display()),
                            None => println!("Received {} ({} bytes)", name, size),
                        }
                        if !sending {
                            break;
                        }
                    }
                    SessionEvent::NegotiationFailed(reason) => {
                        eprintln!("Connection failed: {}", reason);
                        break;
                    }
                    SessionEvent::Error(e) => eprintln!("Error: {}", e),
                    SessionEvent::RoleDecided(_)
                    | SessionEvent::PhaseChanged(_)
                    | SessionEvent::ChannelClosed => {}
                }
            }
        }
    }

    drop(cmd_tx);
    if let Err(e) = session.await? {
        tracing::warn!("Session ended with error: {}", e);
    }
    client.close().await;
    Ok(())
}
