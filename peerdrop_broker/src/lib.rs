//! Signaling broker
//!
//! Groups peers into rooms and relays negotiation messages between them.
//! Payload data never passes through here.

pub mod broker;
pub mod config;
pub mod error;
pub mod server;
pub mod store;

pub use broker::{Broker, BrokerConnection};
pub use config::BrokerConfig;
pub use error::BrokerError;
pub use server::{AppState, create_router, serve, spawn_local, start_broker};
pub use store::{MemoryRoomStore, Room, RoomStore};
