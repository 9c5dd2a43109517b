//! Remote candidate buffering
//!
//! Candidates can arrive over the signaling path before the session
//! description they belong to. Applying them early fails, so they are held
//! here until the remote description is set and then applied in arrival
//! order.

use crate::connection::PeerConnection;
use crate::error::ConnectionError;
use crate::protocol::IceCandidate;
use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct CandidateQueue {
    pending: VecDeque<IceCandidate>,
    remote_applied: bool,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `candidate` now if the remote description is set, otherwise queue it.
    /// Returns `true` when the candidate was applied immediately.
    pub async fn enqueue_or_apply(
        &mut self,
        conn: &dyn PeerConnection,
        candidate: IceCandidate,
    ) -> Result<bool, ConnectionError> {
        if self.remote_applied {
            conn.add_ice_candidate(candidate).await?;
            return Ok(true);
        }
        tracing::debug!(
            "Queueing remote candidate until remote description is set ({} queued)",
            self.pending.len() + 1
        );
        self.pending.push_back(candidate);
        Ok(false)
    }

    /// Apply every queued candidate in arrival order.
    ///
    /// Call right after the remote description is set. Later calls find the
    /// queue empty. A candidate that fails to apply is logged and skipped.
    pub async fn flush(&mut self, conn: &dyn PeerConnection) -> usize {
        self.remote_applied = true;
        let mut applied = 0;
        while let Some(candidate) = self.pending.pop_front() {
            match conn.add_ice_candidate(candidate).await {
                Ok(()) => applied += 1,
                Err(e) => tracing::warn!("Failed to apply queued candidate: {}", e),
            }
        }
        if applied > 0 {
            tracing::debug!("Applied {} queued remote candidates", applied);
        }
        applied
    }

    /// Drop queued candidates (teardown)
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn remote_applied(&self) -> bool {
        self.remote_applied
    }
}
