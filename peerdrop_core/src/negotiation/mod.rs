//! Connection negotiation
//!
//! Turns signaling messages into an established peer connection:
//! - role tiebreak by room join order
//! - offer/answer exchange
//! - candidate trickle with buffering until the remote description is set

pub mod candidates;
pub mod engine;
pub mod state;

pub use candidates::CandidateQueue;
pub use engine::{NegotiationEngine, NegotiationEvent};
pub use state::{Phase, Role};
