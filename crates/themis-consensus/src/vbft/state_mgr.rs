// VBFT STATE MANAGER
// Whole-node sync state, driven by peer reports and the live tick.
//
// SAFETY INVARIANTS:
// 1. Only Synced and SyncingCheck allow proposing, endorsing or committing
// 2. Transitions are a pure function of (state, event, local height); all
//    side effects are returned as actions for the server to perform
// 3. A sync target is always a height at least C+1 peers have committed

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::vbft::peer_pool::PeerPoolNotifier;

/// Capacity of the state event channel.
pub const STATE_EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Init,
    LocalConfigLoaded,
    ConfigLoaded,
    SyncReady,
    Syncing,
    WaitingForPeers,
    Synced,
    SyncingCheck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    ConfigLoaded,
    UpdatePeerConfig { index: u32, connected: bool },
    UpdatePeerState { index: u32, committed: u32 },
    SyncDone { height: u32 },
    LiveTick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateAction {
    StartSync { target: u32 },
    /// Node may take part in consensus from the next height on.
    EnterSynced,
    /// No progress since the last tick; rebroadcast and count a change view.
    SubmitBlockTimeout,
}

#[derive(Debug, Clone, Copy, Default)]
struct PeerState {
    connected: bool,
    committed: u32,
}

#[derive(Debug)]
pub struct StateMgr {
    state: ServerState,
    c: u32,
    peers: HashMap<u32, PeerState>,
    last_tick_height: Option<u32>,
    sync_target: u32,
}

impl StateMgr {
    pub fn new(c: u32) -> Self {
        StateMgr {
            state: ServerState::Init,
            c,
            peers: HashMap::new(),
            last_tick_height: None,
            sync_target: 0,
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn can_participate(&self) -> bool {
        matches!(self.state, ServerState::Synced | ServerState::SyncingCheck)
    }

    pub fn local_config_loaded(&mut self) {
        if self.state == ServerState::Init {
            self.transition(ServerState::LocalConfigLoaded);
        }
    }

    /// New chain config: keep peer reports, adopt the new fault bound.
    pub fn set_fault_tolerance(&mut self, c: u32) {
        self.c = c;
    }

    /// Drop peers that left the committee.
    pub fn retain_peers(&mut self, members: &[u32]) {
        self.peers.retain(|index, _| members.contains(index));
    }

    fn transition(&mut self, to: ServerState) {
        if self.state != to {
            log::info!("vbft state {:?} -> {:?}", self.state, to);
            self.state = to;
        }
    }

    fn connected_count(&self) -> usize {
        self.peers.values().filter(|p| p.connected).count()
    }

    /// Peers needed besides this node to reach a 2C+1 quorum.
    fn peers_needed(&self) -> usize {
        2 * self.c as usize
    }

    fn ahead_count(&self, local: u32) -> usize {
        self.peers.values().filter(|p| p.committed > local + 1).count()
    }

    /// Highest height committed by at least C+1 peers.
    fn agreed_height(&self) -> Option<u32> {
        let mut heights: Vec<u32> = self.peers.values().map(|p| p.committed).collect();
        heights.sort_unstable_by(|a, b| b.cmp(a));
        heights.get(self.c as usize).copied()
    }

    fn start_sync(&mut self, target: u32) -> Vec<StateAction> {
        self.sync_target = target;
        self.transition(ServerState::Syncing);
        vec![StateAction::StartSync { target }]
    }

    /// Decide between waiting, syncing and participating.
    fn evaluate(&mut self, local: u32) -> Vec<StateAction> {
        if self.connected_count() < self.peers_needed() {
            self.transition(ServerState::WaitingForPeers);
            return Vec::new();
        }
        match self.agreed_height() {
            Some(target) if target > local => self.start_sync(target),
            _ => {
                self.transition(ServerState::Synced);
                vec![StateAction::EnterSynced]
            }
        }
    }

    /// Overwrite peer reports with `(index, connected, committed)` read
    /// straight from the peer pool, then re-check participation.
    pub fn reconcile(
        &mut self,
        peers: impl IntoIterator<Item = (u32, bool, u32)>,
        local: u32,
    ) -> Vec<StateAction> {
        for (index, connected, committed) in peers {
            let peer = self.peers.entry(index).or_default();
            peer.connected = connected;
            peer.committed = peer.committed.max(committed);
        }
        match self.state {
            ServerState::WaitingForPeers | ServerState::SyncReady => self.evaluate(local),
            ServerState::Synced | ServerState::SyncingCheck
                if self.connected_count() < self.peers_needed() =>
            {
                self.transition(ServerState::WaitingForPeers);
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    pub fn handle(&mut self, event: StateEvent, local: u32) -> Vec<StateAction> {
        match event {
            StateEvent::ConfigLoaded => {
                if matches!(
                    self.state,
                    ServerState::Init | ServerState::LocalConfigLoaded | ServerState::ConfigLoaded
                ) {
                    self.transition(ServerState::ConfigLoaded);
                    self.transition(ServerState::SyncReady);
                    return self.evaluate(local);
                }
                Vec::new()
            }
            StateEvent::UpdatePeerConfig { index, connected } => {
                self.peers.entry(index).or_default().connected = connected;
                match self.state {
                    ServerState::WaitingForPeers | ServerState::SyncReady => self.evaluate(local),
                    ServerState::Synced | ServerState::SyncingCheck
                        if self.connected_count() < self.peers_needed() =>
                    {
                        self.transition(ServerState::WaitingForPeers);
                        Vec::new()
                    }
                    _ => Vec::new(),
                }
            }
            StateEvent::UpdatePeerState { index, committed } => {
                let peer = self.peers.entry(index).or_default();
                peer.committed = peer.committed.max(committed);
                match self.state {
                    ServerState::Synced | ServerState::SyncingCheck
                        if self.ahead_count(local) > self.c as usize =>
                    {
                        match self.agreed_height() {
                            Some(target) if target > local => self.start_sync(target),
                            _ => Vec::new(),
                        }
                    }
                    ServerState::SyncingCheck if self.ahead_count(local) == 0 => {
                        self.transition(ServerState::Synced);
                        Vec::new()
                    }
                    ServerState::Syncing => match self.agreed_height() {
                        Some(target) if target > self.sync_target => self.start_sync(target),
                        _ => Vec::new(),
                    },
                    _ => Vec::new(),
                }
            }
            StateEvent::SyncDone { height } => {
                if self.state != ServerState::Syncing || height < self.sync_target {
                    return Vec::new();
                }
                self.transition(ServerState::SyncingCheck);
                self.last_tick_height = Some(height);
                vec![StateAction::EnterSynced]
            }
            StateEvent::LiveTick => {
                let stuck = self.last_tick_height == Some(local);
                self.last_tick_height = Some(local);
                match self.state {
                    ServerState::Synced | ServerState::SyncingCheck if stuck => {
                        let ahead = self.peers.values().filter(|p| p.committed > local).count();
                        match self.agreed_height() {
                            Some(target)
                                if target > local && ahead >= (self.c as usize).max(1) =>
                            {
                                self.start_sync(target)
                            }
                            _ => vec![StateAction::SubmitBlockTimeout],
                        }
                    }
                    ServerState::SyncingCheck => {
                        self.transition(ServerState::Synced);
                        Vec::new()
                    }
                    ServerState::Syncing if stuck => match self.agreed_height() {
                        Some(target) if target > local => self.start_sync(target),
                        _ => self.evaluate(local),
                    },
                    ServerState::WaitingForPeers | ServerState::SyncReady => self.evaluate(local),
                    _ => Vec::new(),
                }
            }
        }
    }
}

/// Peer-pool notifier that feeds the server's bounded state channel.
///
/// Uses `try_send` from peer-pool callers. A full channel drops the report
/// and raises a flag; the server then rebuilds peer state from the pool on
/// its next live tick.
pub struct StateNotifier {
    tx: mpsc::Sender<StateEvent>,
    dropped: AtomicBool,
}

impl StateNotifier {
    pub fn new(tx: mpsc::Sender<StateEvent>) -> Arc<Self> {
        Arc::new(StateNotifier {
            tx,
            dropped: AtomicBool::new(false),
        })
    }

    /// True if any report was dropped since the last call.
    pub fn take_dropped(&self) -> bool {
        self.dropped.swap(false, Ordering::AcqRel)
    }

    fn push(&self, event: StateEvent) {
        if self.tx.try_send(event).is_err() {
            self.dropped.store(true, Ordering::Release);
            log::debug!("vbft state channel full, dropped {:?}", event);
        }
    }
}

impl PeerPoolNotifier for StateNotifier {
    fn on_peer_connected(&self, index: u32) {
        self.push(StateEvent::UpdatePeerConfig {
            index,
            connected: true,
        });
    }

    fn on_peer_disconnected(&self, index: u32) {
        self.push(StateEvent::UpdatePeerConfig {
            index,
            connected: false,
        });
    }

    fn on_peer_state(&self, index: u32, committed: u32) {
        self.push(StateEvent::UpdatePeerState { index, committed });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected(mgr: &mut StateMgr, indexes: &[u32], local: u32) -> Vec<StateAction> {
        let mut actions = Vec::new();
        for i in indexes {
            actions.extend(mgr.handle(
                StateEvent::UpdatePeerConfig {
                    index: *i,
                    connected: true,
                },
                local,
            ));
        }
        actions
    }

    #[test]
    fn test_waits_for_quorum_of_peers_then_syncs_up() {
        let mut mgr = StateMgr::new(1);
        mgr.local_config_loaded();
        assert_eq!(mgr.state(), ServerState::LocalConfigLoaded);
        assert!(mgr.handle(StateEvent::ConfigLoaded, 0).is_empty());
        assert_eq!(mgr.state(), ServerState::WaitingForPeers);
        assert!(!mgr.can_participate());

        assert!(connected(&mut mgr, &[2], 0).is_empty());
        assert_eq!(connected(&mut mgr, &[3], 0), vec![StateAction::EnterSynced]);
        assert!(mgr.can_participate());
    }

    #[test]
    fn test_enters_syncing_when_more_than_c_peers_ahead() {
        let mut mgr = StateMgr::new(1);
        mgr.handle(StateEvent::ConfigLoaded, 3);
        connected(&mut mgr, &[1, 2, 4], 3);
        assert_eq!(mgr.state(), ServerState::Synced);

        let report = |mgr: &mut StateMgr, index, committed| {
            mgr.handle(StateEvent::UpdatePeerState { index, committed }, 3)
        };
        assert!(report(&mut mgr, 1, 10).is_empty());
        assert_eq!(report(&mut mgr, 2, 8), vec![StateAction::StartSync { target: 8 }]);
        assert_eq!(mgr.state(), ServerState::Syncing);

        assert!(mgr.handle(StateEvent::SyncDone { height: 7 }, 7).is_empty());
        assert_eq!(
            mgr.handle(StateEvent::SyncDone { height: 8 }, 8),
            vec![StateAction::EnterSynced]
        );
        assert_eq!(mgr.state(), ServerState::SyncingCheck);
        assert!(mgr.can_participate());
    }

    #[test]
    fn test_live_tick_without_progress_times_out() {
        let mut mgr = StateMgr::new(1);
        mgr.handle(StateEvent::ConfigLoaded, 5);
        connected(&mut mgr, &[1, 2, 3], 5);
        assert!(mgr.handle(StateEvent::LiveTick, 5).is_empty());
        assert_eq!(
            mgr.handle(StateEvent::LiveTick, 5),
            vec![StateAction::SubmitBlockTimeout]
        );
        // progress resets the stall detection
        assert!(mgr.handle(StateEvent::LiveTick, 6).is_empty());
    }

    #[test]
    fn test_live_tick_resyncs_when_peers_moved_on() {
        let mut mgr = StateMgr::new(1);
        mgr.handle(StateEvent::ConfigLoaded, 5);
        connected(&mut mgr, &[1, 2, 3], 5);
        for i in 1..=2 {
            mgr.handle(StateEvent::UpdatePeerState { index: i, committed: 6 }, 5);
        }
        mgr.handle(StateEvent::LiveTick, 5);
        assert_eq!(
            mgr.handle(StateEvent::LiveTick, 5),
            vec![StateAction::StartSync { target: 6 }]
        );
    }

    #[test]
    fn test_losing_peers_stops_participation() {
        let mut mgr = StateMgr::new(1);
        mgr.handle(StateEvent::ConfigLoaded, 0);
        connected(&mut mgr, &[1, 2], 0);
        assert!(mgr.can_participate());
        mgr.handle(
            StateEvent::UpdatePeerConfig {
                index: 2,
                connected: false,
            },
            0,
        );
        assert_eq!(mgr.state(), ServerState::WaitingForPeers);
    }

    #[test]
    fn test_single_node_committee_is_synced_immediately() {
        let mut mgr = StateMgr::new(0);
        assert_eq!(
            mgr.handle(StateEvent::ConfigLoaded, 0),
            vec![StateAction::EnterSynced]
        );
    }

    #[test]
    fn test_notifier_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let notifier = StateNotifier::new(tx);
        notifier.on_peer_connected(1);
        notifier.on_peer_state(1, 4);
        assert_eq!(
            rx.try_recv().unwrap(),
            StateEvent::UpdatePeerConfig {
                index: 1,
                connected: true
            }
        );
        assert!(rx.try_recv().is_err());
        assert!(notifier.take_dropped());
        assert!(!notifier.take_dropped());
    }

    #[test]
    fn test_reconcile_recovers_dropped_connects() {
        let (tx, _rx) = mpsc::channel(1);
        let notifier = StateNotifier::new(tx);
        let mut mgr = StateMgr::new(1);
        mgr.handle(StateEvent::ConfigLoaded, 0);
        assert_eq!(mgr.state(), ServerState::WaitingForPeers);

        // only the first connect fits the channel
        for index in [2, 3, 4] {
            notifier.on_peer_connected(index);
        }
        assert!(notifier.take_dropped());
        assert!(connected(&mut mgr, &[2], 0).is_empty());
        assert_eq!(mgr.state(), ServerState::WaitingForPeers);

        let pool = [(2, true, 0), (3, true, 0), (4, true, 0)];
        assert_eq!(mgr.reconcile(pool, 0), vec![StateAction::EnterSynced]);
        assert!(mgr.can_participate());

        let pool = [(2, true, 0), (3, false, 0), (4, false, 0)];
        assert!(mgr.reconcile(pool, 0).is_empty());
        assert_eq!(mgr.state(), ServerState::WaitingForPeers);
    }
}
