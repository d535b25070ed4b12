// VBFT PEER POOL
// Committee members of the current chain config and their liveness.
//
// SAFETY INVARIANTS:
// 1. index <-> public key is injective within one chain config
// 2. The notifier is always invoked after the lock is released
// 3. A waiter sender is removed from the map before it is fired, so each
//    release wakes the waiters registered up to that point exactly once
// 4. clean() drops every waiter sender; pending waits return false

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use themis_crypto::PublicKey;
use themis_p2p::PeerId;
use tokio::sync::broadcast;

use crate::engine::{ConsensusError, ConsensusResult};
use crate::vbft::config::PeerConfig;
use crate::vbft::message::{PeerHandshakeMsg, PeerHeartbeatMsg};

/// How long `wait_peer_connected` blocks.
pub const PEER_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Narrow callback into the state manager.
pub trait PeerPoolNotifier: Send + Sync {
    fn on_peer_connected(&self, index: u32);
    fn on_peer_disconnected(&self, index: u32);
    fn on_peer_state(&self, index: u32, committed_block_num: u32);
}

/// Read-only copy of a pool entry.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub index: u32,
    pub public_key: PublicKey,
    pub peer_id: Option<PeerId>,
    pub handshake: Option<PeerHandshakeMsg>,
    pub heartbeat: Option<PeerHeartbeatMsg>,
    pub last_update: Option<Instant>,
    pub connected: bool,
}

impl PeerSnapshot {
    /// Latest committed height reported by heartbeat or handshake.
    pub fn committed_block_num(&self) -> Option<u32> {
        self.heartbeat
            .map(|h| h.committed_block_num)
            .or_else(|| self.handshake.map(|h| h.committed_block_num))
    }
}

#[derive(Default)]
struct Inner {
    peers: HashMap<u32, PeerSnapshot>,
    by_key: HashMap<PublicKey, u32>,
    by_peer_id: HashMap<PeerId, u32>,
    waiters: HashMap<u32, broadcast::Sender<()>>,
}

impl Inner {
    fn release(&mut self, index: u32) {
        if let Some(tx) = self.waiters.remove(&index) {
            let _ = tx.send(());
        }
    }
}

pub struct PeerPool {
    inner: RwLock<Inner>,
    notifier: Option<Arc<dyn PeerPoolNotifier>>,
}

impl PeerPool {
    pub fn new(notifier: Option<Arc<dyn PeerPoolNotifier>>) -> Self {
        PeerPool {
            inner: RwLock::new(Inner::default()),
            notifier,
        }
    }

    /// Register a committee member, initially disconnected.
    pub fn add_peer(&self, config: &PeerConfig) -> ConsensusResult<()> {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.by_key.get(&config.id) {
            if *existing != config.index {
                return Err(ConsensusError::Config(format!(
                    "public key already registered as peer {}",
                    existing
                )));
            }
        }
        if let Some(existing) = inner.peers.get(&config.index) {
            if existing.public_key != config.id {
                return Err(ConsensusError::Config(format!(
                    "peer index {} already bound to another key",
                    config.index
                )));
            }
            return Ok(());
        }
        inner.by_key.insert(config.id.clone(), config.index);
        inner.peers.insert(
            config.index,
            PeerSnapshot {
                index: config.index,
                public_key: config.id.clone(),
                peer_id: None,
                handshake: None,
                heartbeat: None,
                last_update: None,
                connected: false,
            },
        );
        Ok(())
    }

    /// Associate a transport id with a committee index.
    pub fn bind(&self, peer_id: PeerId, index: u32) {
        let mut inner = self.inner.write();
        let Some(entry) = inner.peers.get_mut(&index) else {
            return;
        };
        if let Some(old) = entry.peer_id.replace(peer_id) {
            inner.by_peer_id.remove(&old);
        }
        inner.by_peer_id.insert(peer_id, index);
    }

    pub fn peer_connected(&self, index: u32) {
        let changed = {
            let mut inner = self.inner.write();
            let Some(entry) = inner.peers.get_mut(&index) else {
                return;
            };
            let changed = !entry.connected;
            entry.connected = true;
            entry.last_update = Some(Instant::now());
            inner.release(index);
            changed
        };
        if changed {
            log::debug!("peer {} connected", index);
            if let Some(n) = &self.notifier {
                n.on_peer_connected(index);
            }
        }
    }

    pub fn peer_disconnected(&self, index: u32) {
        let changed = {
            let mut inner = self.inner.write();
            let Some(entry) = inner.peers.get_mut(&index) else {
                return;
            };
            let changed = entry.connected;
            entry.connected = false;
            entry.last_update = Some(Instant::now());
            changed
        };
        if changed {
            log::debug!("peer {} disconnected", index);
            if let Some(n) = &self.notifier {
                n.on_peer_disconnected(index);
            }
        }
    }

    /// Wait up to five seconds for `index` to connect.
    pub async fn wait_peer_connected(&self, index: u32) -> bool {
        let mut rx = {
            let mut inner = self.inner.write();
            match inner.peers.get(&index) {
                Some(entry) if entry.connected => return true,
                Some(_) => {}
                None => return false,
            }
            inner
                .waiters
                .entry(index)
                .or_insert_with(|| broadcast::channel(1).0)
                .subscribe()
        };
        matches!(
            tokio::time::timeout(PEER_WAIT_TIMEOUT, rx.recv()).await,
            Ok(Ok(()))
        )
    }

    pub fn peer_handshake(&self, index: u32, msg: PeerHandshakeMsg) {
        if self.update(index, |entry| entry.handshake = Some(msg)) {
            if let Some(n) = &self.notifier {
                n.on_peer_state(index, msg.committed_block_num);
            }
        }
    }

    /// Record a heartbeat. A peer that heartbeats counts as connected.
    pub fn peer_heartbeat(&self, index: u32, msg: PeerHeartbeatMsg) {
        let mut newly_connected = false;
        let known = self.update(index, |entry| {
            entry.heartbeat = Some(msg);
            newly_connected = !entry.connected;
            entry.connected = true;
        });
        if !known {
            return;
        }
        if let Some(n) = &self.notifier {
            if newly_connected {
                n.on_peer_connected(index);
            }
            n.on_peer_state(index, msg.committed_block_num);
        }
    }

    fn update(&self, index: u32, f: impl FnOnce(&mut PeerSnapshot)) -> bool {
        let mut inner = self.inner.write();
        let Some(entry) = inner.peers.get_mut(&index) else {
            return false;
        };
        f(entry);
        entry.last_update = Some(Instant::now());
        let connected = entry.connected;
        if connected {
            inner.release(index);
        }
        true
    }

    pub fn get_peer(&self, index: u32) -> Option<PeerSnapshot> {
        self.inner.read().peers.get(&index).cloned()
    }

    pub fn get_pubkey(&self, index: u32) -> Option<PublicKey> {
        self.inner.read().peers.get(&index).map(|p| p.public_key.clone())
    }

    pub fn get_index_by_id(&self, id: &PublicKey) -> Option<u32> {
        self.inner.read().by_key.get(id).copied()
    }

    pub fn get_index_by_peer(&self, peer_id: PeerId) -> Option<u32> {
        self.inner.read().by_peer_id.get(&peer_id).copied()
    }

    pub fn get_peer_id(&self, index: u32) -> Option<PeerId> {
        self.inner.read().peers.get(&index).and_then(|p| p.peer_id)
    }

    /// Indexes of connected peers, ascending.
    pub fn get_active_neighbors(&self) -> Vec<u32> {
        let inner = self.inner.read();
        let mut out: Vec<u32> = inner
            .peers
            .values()
            .filter(|p| p.connected)
            .map(|p| p.index)
            .collect();
        out.sort_unstable();
        out
    }

    pub fn get_all_pubkeys(&self) -> Vec<PublicKey> {
        let inner = self.inner.read();
        let mut entries: Vec<&PeerSnapshot> = inner.peers.values().collect();
        entries.sort_by_key(|p| p.index);
        entries.iter().map(|p| p.public_key.clone()).collect()
    }

    /// `(index, committed height)` for every peer that reported one.
    pub fn committed_heights(&self) -> Vec<(u32, u32)> {
        let inner = self.inner.read();
        let mut out: Vec<(u32, u32)> = inner
            .peers
            .values()
            .filter_map(|p| p.committed_block_num().map(|h| (p.index, h)))
            .collect();
        out.sort_unstable();
        out
    }

    /// Every entry, ordered by index.
    pub fn snapshots(&self) -> Vec<PeerSnapshot> {
        let inner = self.inner.read();
        let mut out: Vec<PeerSnapshot> = inner.peers.values().cloned().collect();
        out.sort_by_key(|p| p.index);
        out
    }

    pub fn len(&self) -> usize {
        self.inner.read().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every peer. Pending waiters are woken with `false`.
    pub fn clean(&self) {
        let mut inner = self.inner.write();
        inner.peers.clear();
        inner.by_key.clear();
        inner.by_peer_id.clear();
        inner.waiters.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use themis_crypto::KeyPair;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl PeerPoolNotifier for Recorder {
        fn on_peer_connected(&self, index: u32) {
            self.events.lock().push(format!("up {}", index));
        }
        fn on_peer_disconnected(&self, index: u32) {
            self.events.lock().push(format!("down {}", index));
        }
        fn on_peer_state(&self, index: u32, committed: u32) {
            self.events.lock().push(format!("state {} {}", index, committed));
        }
    }

    fn peer(index: u32) -> PeerConfig {
        PeerConfig {
            index,
            id: KeyPair::from_seed(&[index as u8; 32]).unwrap().public().clone(),
        }
    }

    #[test]
    fn test_mapping_is_injective() {
        let pool = PeerPool::new(None);
        pool.add_peer(&peer(1)).unwrap();
        pool.add_peer(&peer(1)).unwrap();
        let clash = PeerConfig {
            index: 2,
            id: peer(1).id,
        };
        assert!(pool.add_peer(&clash).is_err());
        let rebind = PeerConfig {
            index: 1,
            id: peer(3).id,
        };
        assert!(pool.add_peer(&rebind).is_err());
        assert_eq!(pool.get_index_by_id(&peer(1).id), Some(1));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_heartbeat_marks_connected_and_notifies() {
        let recorder = Arc::new(Recorder::default());
        let pool = PeerPool::new(Some(recorder.clone()));
        pool.add_peer(&peer(1)).unwrap();
        pool.add_peer(&peer(2)).unwrap();
        pool.peer_heartbeat(
            2,
            PeerHeartbeatMsg {
                committed_block_num: 9,
                chain_config_view: 1,
            },
        );
        pool.peer_connected(1);
        pool.peer_connected(1);
        pool.peer_disconnected(1);
        assert_eq!(pool.get_active_neighbors(), vec![2]);
        assert_eq!(pool.committed_heights(), vec![(2, 9)]);
        let snaps = pool.snapshots();
        assert_eq!(snaps.len(), 2);
        assert!(!snaps[0].connected);
        assert_eq!(snaps[1].committed_block_num(), Some(9));
        assert_eq!(
            *recorder.events.lock(),
            vec!["up 2", "state 2 9", "up 1", "down 1"]
        );
    }

    #[test]
    fn test_bind_tracks_transport_ids() {
        let pool = PeerPool::new(None);
        pool.add_peer(&peer(1)).unwrap();
        pool.bind(PeerId(10), 1);
        pool.bind(PeerId(11), 1);
        assert_eq!(pool.get_index_by_peer(PeerId(11)), Some(1));
        assert_eq!(pool.get_index_by_peer(PeerId(10)), None);
        assert_eq!(pool.get_peer_id(1), Some(PeerId(11)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let pool = PeerPool::new(None);
        pool.add_peer(&peer(1)).unwrap();
        assert!(!pool.wait_peer_connected(1).await);
        assert!(!pool.wait_peer_connected(7).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_wakes_waiters_with_false() {
        let pool = Arc::new(PeerPool::new(None));
        pool.add_peer(&peer(1)).unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.wait_peer_connected(1).await })
        };
        tokio::task::yield_now().await;
        pool.clean();
        assert!(!waiter.await.unwrap());
        assert!(pool.is_empty());
    }
}
