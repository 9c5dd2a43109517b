//! Chunked file transfer over an established data channel.
//!
//! This module provides:
//! - Control frames (`meta` / `done`) sent as text messages
//! - A sender that streams 16 KiB binary chunks under backpressure
//! - A receiver that reassembles chunks against the declared size

pub mod constants;
pub mod frame;
pub mod receiver;
pub mod sender;
pub mod utils;

// Re-export public API
pub use constants::{CHUNK_SIZE, HIGH_WATER_MARK, LOW_WATER_MARK};
pub use frame::ControlFrame;
pub use receiver::{ReceivedFile, Receiver, ReceiverEvent, init_receiver, spawn_receiver};
pub use sender::{OutgoingFile, send_file};
pub use utils::TransferProgress;
