use crate::error::BrokerError;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_MAX_CONNECTIONS: usize = 1000;
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 5;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub bind_addr: SocketAddr,
    /// Concurrent WebSocket connections; further upgrades are refused
    pub max_connections: usize,
    /// Peers per room; `None` means unlimited
    pub max_room_peers: Option<usize>,
    pub ping_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_room_peers: None,
            ping_interval: Duration::from_secs(DEFAULT_PING_INTERVAL_SECS),
        }
    }
}

impl BrokerConfig {
    /// Read `PEERDROP_*` variables, after loading a `.env` file if present
    pub fn from_env() -> Result<Self, BrokerError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key/value source; unset keys keep their defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, BrokerError> {
        let defaults = Self::default();
        Ok(Self {
            bind_addr: parse_or(&lookup, "PEERDROP_BIND", defaults.bind_addr)?,
            max_connections: parse_or(&lookup, "PEERDROP_MAX_CONNECTIONS", defaults.max_connections)?,
            max_room_peers: match lookup("PEERDROP_MAX_ROOM_PEERS") {
                Some(v) if !v.trim().is_empty() => Some(parse("PEERDROP_MAX_ROOM_PEERS", &v)?),
                _ => None,
            },
            ping_interval: Duration::from_secs(ping_secs(&lookup)?),
        })
    }
}

/// The keep-alive interval must be at least one second
fn ping_secs(lookup: &impl Fn(&str) -> Option<String>) -> Result<u64, BrokerError> {
    const KEY: &str = "PEERDROP_PING_INTERVAL_SECS";
    match parse_or(lookup, KEY, DEFAULT_PING_INTERVAL_SECS)? {
        0 => Err(BrokerError::InvalidConfig {
            key: KEY,
            value: "0".to_string(),
        }),
        secs => Ok(secs),
    }
}

fn parse<T: FromStr>(key: &'static str, value: &str) -> Result<T, BrokerError> {
    value.trim().parse().map_err(|_| BrokerError::InvalidConfig {
        key,
        value: value.to_string(),
    })
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, BrokerError> {
    match lookup(key) {
        Some(value) => parse(key, &value),
        None => Ok(default),
    }
}
