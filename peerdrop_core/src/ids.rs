use rand::Rng;
use uuid::Uuid;

/// Generate a fresh peer identifier
pub fn generate_peer_id() -> String {
    Uuid::new_v4().to_string()
}

/// Generate a 6-digit room code that is easy to read out loud
pub fn generate_room_code() -> String {
    rand::rng().random_range(100_000..1_000_000).to_string()
}
