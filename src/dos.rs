//! Misbehavior accounting
//!
//! Rejections carry a DoS score; the tracker sums them per peer and reports
//! peers whose total reaches the ban threshold. Disconnecting or banning is
//! left to the network layer.

use std::collections::HashMap;

use log::warn;

/// Opaque peer identifier assigned by the network layer
pub type PeerId = u64;

#[derive(Debug, Clone)]
pub struct MisbehaviorTracker {
    scores: HashMap<PeerId, u32>,
    threshold: u32,
}

impl Default for MisbehaviorTracker {
    fn default() -> Self {
        Self::new(100)
    }
}

impl MisbehaviorTracker {
    pub fn new(threshold: u32) -> Self {
        Self { scores: HashMap::new(), threshold }
    }

    /// Add `howmuch` to the peer's score; true when the peer has just reached
    /// the threshold
    pub fn misbehaving(&mut self, peer: PeerId, howmuch: u32) -> bool {
        if howmuch == 0 {
            return false;
        }
        let score = self.scores.entry(peer).or_insert(0);
        let before = *score;
        *score = score.saturating_add(howmuch);
        let crossed = before < self.threshold && *score >= self.threshold;
        if crossed {
            warn!("peer {} misbehaving: score {} reached threshold {}", peer, score, self.threshold);
        }
        crossed
    }

    pub fn score(&self, peer: PeerId) -> u32 {
        self.scores.get(&peer).copied().unwrap_or(0)
    }

    pub fn should_ban(&self, peer: PeerId) -> bool {
        self.score(peer) >= self.threshold
    }

    /// Peers at or over the threshold, sorted
    pub fn banned_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .scores
            .iter()
            .filter(|(_, score)| **score >= self.threshold)
            .map(|(peer, _)| *peer)
            .collect();
        peers.sort_unstable();
        peers
    }

    pub fn forget(&mut self, peer: PeerId) {
        self.scores.remove(&peer);
    }
}
