use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::network::PeerId;

/// Per-peer misbehavior score.
///
/// Consensus code calls `note_bad` when it drops a message for decode or
/// authentication failures; transports consult `should_ban`. Scores decay
/// toward zero so old behavior is eventually forgiven.
#[derive(Debug)]
pub struct PeerScoreBook {
    scores: HashMap<PeerId, i64>,
    last_decay: Instant,
    ban_threshold: i64,
    decay_every: Duration,
}

impl PeerScoreBook {
    pub fn new(ban_threshold: i64, decay_every: Duration) -> Self {
        Self {
            scores: HashMap::new(),
            last_decay: Instant::now(),
            ban_threshold,
            decay_every,
        }
    }

    pub fn note_bad(&mut self, peer: PeerId, penalty: i64) {
        *self.scores.entry(peer).or_insert(0) -= penalty.abs();
        if self.should_ban(peer) {
            log::warn!("{} crossed ban threshold (score {})", peer, self.score(peer));
        }
    }

    pub fn note_good(&mut self, peer: PeerId, reward: i64) {
        *self.scores.entry(peer).or_insert(0) += reward.abs();
    }

    pub fn should_ban(&self, peer: PeerId) -> bool {
        self.score(peer) <= -self.ban_threshold
    }

    pub fn score(&self, peer: PeerId) -> i64 {
        self.scores.get(&peer).copied().unwrap_or(0)
    }

    pub fn forget(&mut self, peer: PeerId) {
        self.scores.remove(&peer);
    }

    /// Multiply every score by 9/10 at most once per `decay_every`.
    pub fn decay(&mut self) {
        if self.last_decay.elapsed() < self.decay_every {
            return;
        }
        self.last_decay = Instant::now();
        for v in self.scores.values_mut() {
            *v = (*v * 9) / 10;
        }
        self.scores.retain(|_, v| *v != 0);
    }
}

impl Default for PeerScoreBook {
    fn default() -> Self {
        Self::new(100, Duration::from_secs(60))
    }
}
