// VBFT SERVER
// Verifiable-random BFT: per-height proposer, endorser and committer roles
// are drawn from the chain config's position table with the parent VRF.
//
// SAFETY INVARIANTS:
// 1. All server state is mutated on the loop task; peer-pool callbacks,
//    timers and the network relay only enqueue events
// 2. A node endorses at most once and commits at most once per height
// 3. A block is sealed only with 2C+1 verified commit signatures over its hash
// 4. Consensus messages are acted on only in Synced/SyncingCheck; earlier
//    ones are buffered and replayed when their height starts
// 5. A chain config carried by block h governs heights h+1 onwards

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use themis_core::{Address, Block, Decode, Encode, Ledger, Sink, TxPool};
use themis_crypto::{sha256d, Hash256, KeyPair, PublicKey, Signature};
use themis_p2p::{NetworkEvent, P2pService, PeerId, PeerScoreBook};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::ConsensusConfig;
use crate::engine::{
    spawn_network_relay, unix_now, ConsensusDeps, ConsensusEngine, ConsensusError,
    ConsensusResult, EngineStatus, SealedBlock, INBOUND_CAPACITY, MAX_TIMESTAMP_SKEW,
};
use crate::payload::ConsensusPayload;
use crate::timer::{EventTimer, TimerFired};
use crate::vbft::block_info::{compute_vrf, verify_vrf, VbftBlockInfo};
use crate::vbft::block_pool::{BlockPool, Candidate, Vote};
use crate::vbft::chain_config::{build_chain_config, participants, Participants, PeerStake};
use crate::vbft::config::ChainConfig;
use crate::vbft::governance::{
    effective_params, is_period_end, read_governance_view, read_peer_pool, read_peer_stakes,
    read_vbft_config, read_winner_info, GENESIS_VIEW,
};
use crate::vbft::message::{
    PeerHandshakeMsg, PeerHeartbeatMsg, VbftBody, VbftMessage, BLOCK_INFO_BATCH,
};
use crate::vbft::peer_pool::{PeerPool, PeerPoolNotifier};
use crate::vbft::state_mgr::{
    StateAction, StateEvent, StateMgr, StateNotifier, STATE_EVENT_CAPACITY,
};
use crate::vbft::syncer::Syncer;

const FUTURE_CAPACITY: usize = 256;

const PENALTY: i64 = 10;

/// Block number for timers that are not tied to a height.
const LOOP_TIMERS: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VbftTimer {
    Propose,
    /// Endorse the best proposal so far even if rank 0 stayed silent.
    Endorse,
    /// Rebroadcast own round messages.
    Commit,
    /// Heartbeat and progress check.
    LiveTick,
    /// Re-request outstanding sync data.
    SyncTick,
}

pub enum VbftEvent {
    Network(NetworkEvent),
    Timeout(TimerFired<VbftTimer>),
}

impl From<NetworkEvent> for VbftEvent {
    fn from(ev: NetworkEvent) -> Self {
        VbftEvent::Network(ev)
    }
}

impl From<TimerFired<VbftTimer>> for VbftEvent {
    fn from(t: TimerFired<VbftTimer>) -> Self {
        VbftEvent::Timeout(t)
    }
}

/// Digest an endorser signs; binds the vote to its height and proposer so
/// it can never pass as a commit signature over the bare block hash.
pub fn endorse_digest(block_num: u32, proposer: u32, block_hash: &Hash256) -> Hash256 {
    let mut sink = Sink::with_capacity(40);
    sink.write_u32(block_num);
    sink.write_u32(proposer);
    sink.write_hash(block_hash);
    sha256d(&sink.into_bytes())
}

pub struct VbftServer {
    account: Arc<KeyPair>,
    ledger: Arc<dyn Ledger>,
    txpool: Arc<dyn TxPool>,
    p2p: Arc<dyn P2pService>,
    config: ConsensusConfig,

    chain_config: ChainConfig,
    genesis_vrf: Vec<u8>,
    last_config_block_num: u32,
    my_index: Option<u32>,

    peer_pool: Arc<PeerPool>,
    notifier: Arc<StateNotifier>,
    state_mgr: StateMgr,
    state_rx: Option<mpsc::Receiver<StateEvent>>,
    block_pool: BlockPool,
    syncer: Syncer,
    timer: EventTimer<VbftTimer, VbftEvent>,

    inbound_tx: mpsc::Sender<VbftEvent>,
    inbound_rx: mpsc::Receiver<VbftEvent>,
    network: Option<mpsc::UnboundedReceiver<NetworkEvent>>,
    future: VecDeque<(PeerId, ConsensusPayload)>,
    scores: PeerScoreBook,
    busy: Arc<AtomicU64>,
    status_tx: watch::Sender<EngineStatus>,
    last_sealed: Option<SealedBlock>,

    /// Height currently being agreed on.
    current: u32,
    /// Own proposal, endorse and commit frames for `current`.
    own_messages: Vec<Vec<u8>>,
    /// Live ticks without progress at `current`.
    change_views: u32,
    participants_cache: Option<(u32, u32, Participants)>,
}

impl VbftServer {
    pub fn new(config: ConsensusConfig, deps: ConsensusDeps) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (state_tx, state_rx) = mpsc::channel(STATE_EVENT_CAPACITY);
        let (status_tx, _) = watch::channel(EngineStatus::default());
        let notifier = StateNotifier::new(state_tx);
        let pool_notifier: Arc<dyn PeerPoolNotifier> = notifier.clone();
        let params = &config.vbft;
        let chain_config = ChainConfig {
            version: 0,
            view: 0,
            n: params.n,
            c: params.c,
            block_msg_delay: params.block_msg_delay(),
            hash_msg_delay: params.hash_msg_delay(),
            peer_handshake_timeout: params.peer_handshake_timeout(),
            peers: Vec::new(),
            pos_table: Vec::new(),
            max_block_change_view: params.max_block_change_view,
        };
        VbftServer {
            account: deps.account,
            ledger: deps.ledger,
            txpool: deps.txpool,
            p2p: deps.p2p,
            state_mgr: StateMgr::new(params.c),
            chain_config,
            config,
            genesis_vrf: Vec::new(),
            last_config_block_num: 0,
            my_index: None,
            peer_pool: Arc::new(PeerPool::new(Some(pool_notifier))),
            notifier,
            state_rx: Some(state_rx),
            block_pool: BlockPool::new(),
            syncer: Syncer::new(),
            timer: EventTimer::new(inbound_tx.clone()),
            inbound_tx,
            inbound_rx,
            network: Some(deps.network),
            future: VecDeque::new(),
            scores: PeerScoreBook::default(),
            busy: Arc::new(AtomicU64::new(0)),
            status_tx,
            last_sealed: None,
            current: 0,
            own_messages: Vec::new(),
            change_views: 0,
            participants_cache: None,
        }
    }

    pub fn chain_config(&self) -> &ChainConfig {
        &self.chain_config
    }

    pub fn peer_pool(&self) -> Arc<PeerPool> {
        self.peer_pool.clone()
    }

    fn publish_status(&self) {
        let status = EngineStatus {
            committed_height: self.ledger.current_block_height(),
            view: self.chain_config.view,
            phase: format!("{:?}", self.state_mgr.state()),
            last_sealed: self.last_sealed,
            busy_drops: self.busy.load(Ordering::Relaxed),
        };
        self.status_tx.send_replace(status);
    }

    // --- chain config -----------------------------------------------------

    /// Stakes for `view`: the governance peer pool, or every genesis
    /// bookkeeper with equal stake when governance holds no pool.
    fn stakes_for(&self, view: u32) -> ConsensusResult<Vec<PeerStake>> {
        if read_peer_pool(&*self.ledger, view)?.is_some() {
            let period_end = is_period_end(&*self.ledger, view)?;
            return read_peer_stakes(&*self.ledger, view, period_end);
        }
        Ok(self
            .ledger
            .get_bookkeepers()
            .iter()
            .enumerate()
            .map(|(i, pk)| PeerStake {
                index: i as u32 + 1,
                id: pk.to_hex(),
                stake: 1,
            })
            .collect())
    }

    fn params_for(&self, view: u32) -> ConsensusResult<crate::config::VbftParams> {
        Ok(effective_params(&*self.ledger, view)?
            .map(|record| record.params)
            .unwrap_or_else(|| self.config.vbft.clone()))
    }

    fn committee_config(
        &self,
        version: u32,
        view: u32,
        txid: &Hash256,
        height: u32,
    ) -> ConsensusResult<ChainConfig> {
        let params = self.params_for(view)?;
        let stakes = self.stakes_for(view)?;
        let winner = read_winner_info(&*self.ledger, view)?;
        build_chain_config(&params, version, view, &stakes, winner.as_ref(), txid, height)
    }

    fn load_chain_config(&mut self) -> ConsensusResult<ChainConfig> {
        let height = self.ledger.current_block_height();
        if height > 0 {
            let tip = VbftBlockInfo::of_block(&self.ledger.get_block(height)?)?;
            self.last_config_block_num = tip.last_config_block_num;
            if tip.last_config_block_num > 0 {
                let carrier = self.ledger.get_block(tip.last_config_block_num)?;
                return VbftBlockInfo::of_block(&carrier)?
                    .new_chain_config
                    .ok_or_else(|| {
                        ConsensusError::Config(format!(
                            "block {} carries no chain config",
                            tip.last_config_block_num
                        ))
                    });
            }
        }
        let view = read_governance_view(&*self.ledger)?
            .map(|g| g.view)
            .unwrap_or(GENESIS_VIEW);
        self.committee_config(1, view, &Hash256::ZERO, 0)
    }

    /// Make `cfg` the config in force and rebuild the peer pool from it.
    fn install_config(&mut self, cfg: ChainConfig) -> ConsensusResult<()> {
        self.my_index = cfg.index_of(self.account.public());
        self.peer_pool.clean();
        for peer in &cfg.peers {
            if Some(peer.index) != self.my_index {
                self.peer_pool.add_peer(peer)?;
            }
        }
        for neighbor in self.p2p.get_neighbors() {
            if let Some(index) = self.peer_pool.get_index_by_id(&neighbor.public_key) {
                self.peer_pool.bind(neighbor.id, index);
                self.peer_pool.peer_connected(index);
            }
        }
        let members: Vec<u32> = cfg.peers.iter().map(|p| p.index).collect();
        self.state_mgr.set_fault_tolerance(cfg.c);
        self.state_mgr.retain_peers(&members);
        self.participants_cache = None;
        info!(
            "vbft: chain config v{} view {} with {} peers, local index {:?}",
            cfg.version,
            cfg.view,
            cfg.peers.len(),
            self.my_index
        );
        self.chain_config = cfg;
        Ok(())
    }

    /// Config the block at `height` must carry, if any.
    ///
    /// A governance view newer than the config in force moves to that view.
    /// Otherwise, once `max_block_change_view` blocks have passed since the
    /// last config block, the current view's committee is redrawn seeded
    /// with the parent hash. Both depend only on chain state.
    fn pending_chain_config(&self, height: u32) -> ConsensusResult<Option<ChainConfig>> {
        let gov = read_governance_view(&*self.ledger)?;
        let (view, txid) = match gov {
            Some(gov) if gov.view > self.chain_config.view => (gov.view, gov.tx_hash),
            _ => {
                let max = self.chain_config.max_block_change_view;
                if max == 0 || height.saturating_sub(self.last_config_block_num) < max {
                    return Ok(None);
                }
                let parent = self.ledger.get_header(height - 1)?;
                (self.chain_config.view, parent.hash())
            }
        };
        let cfg = self.committee_config(self.chain_config.version + 1, view, &txid, height)?;
        Ok(Some(cfg))
    }

    // --- roles --------------------------------------------------------------

    fn prev_vrf(&self, height: u32) -> ConsensusResult<Vec<u8>> {
        if height <= 1 {
            return Ok(self.genesis_vrf.clone());
        }
        let parent = self.ledger.get_block(height - 1)?;
        Ok(VbftBlockInfo::of_block(&parent)?.vrf_value)
    }

    fn participants_for(&mut self, height: u32) -> ConsensusResult<Participants> {
        if let Some((h, version, parts)) = &self.participants_cache {
            if *h == height && *version == self.chain_config.version {
                return Ok(parts.clone());
            }
        }
        let vrf = self.prev_vrf(height)?;
        let parts = participants(&self.chain_config, &vrf);
        self.participants_cache = Some((height, self.chain_config.version, parts.clone()));
        Ok(parts)
    }

    fn peer_key(&self, index: u32) -> ConsensusResult<PublicKey> {
        self.chain_config
            .peer(index)
            .map(|p| p.id.clone())
            .ok_or_else(|| ConsensusError::Auth(format!("peer {} not in chain config", index)))
    }

    /// Rank r proposes r+1 block delays after the height starts, and never
    /// before the wall clock passes the parent timestamp.
    fn propose_delay(&self, rank: usize, height: u32) -> ConsensusResult<Duration> {
        let parent_ts = self.ledger.get_header(height - 1)?.timestamp;
        let behind = parent_ts.saturating_add(1).saturating_sub(unix_now());
        Ok(self.chain_config.block_msg_delay * (rank as u32 + 1)
            + Duration::from_secs(u64::from(behind)))
    }

    // --- sending ------------------------------------------------------------

    fn envelope(&self, msg: &VbftMessage) -> Option<Vec<u8>> {
        let index = u16::try_from(self.my_index?).ok()?;
        let payload = ConsensusPayload::new_signed(
            &self.account,
            self.ledger.current_block_hash(),
            msg.block_num,
            index,
            unix_now(),
            msg.to_bytes(),
        );
        Some(payload.to_wire())
    }

    fn broadcast(&self, msg: &VbftMessage) -> Option<Vec<u8>> {
        let frame = self.envelope(msg)?;
        self.p2p.broadcast(frame.clone());
        Some(frame)
    }

    /// Broadcast and remember for rebroadcast until the height is sealed.
    fn broadcast_own(&mut self, msg: &VbftMessage) -> Option<Vec<u8>> {
        let frame = self.broadcast(msg)?;
        self.own_messages.push(frame.clone());
        Some(frame)
    }

    fn rebroadcast(&self) {
        for frame in &self.own_messages {
            self.p2p.broadcast(frame.clone());
        }
    }

    fn send_to_peer(&self, peer: PeerId, msg: &VbftMessage) {
        let Some(frame) = self.envelope(msg) else {
            return;
        };
        if let Err(e) = self.p2p.send(peer, frame) {
            debug!("vbft: send to {} failed: {}", peer, e);
        }
    }

    fn send_to(&self, index: u32, msg: &VbftMessage) {
        if let Some(peer) = self.peer_pool.get_peer_id(index) {
            self.send_to_peer(peer, msg);
        }
    }

    fn send_handshake(&self, peer: PeerId) {
        let local = self.ledger.current_block_height();
        let msg = VbftMessage::new(
            local,
            VbftBody::PeerHandshake {
                msg: PeerHandshakeMsg {
                    committed_block_num: local,
                    chain_config_view: self.chain_config.view,
                },
                address: self.p2p.local_address(),
            },
        );
        self.send_to_peer(peer, &msg);
    }

    fn send_heartbeat(&self) {
        let local = self.ledger.current_block_height();
        self.broadcast(&VbftMessage::new(
            local,
            VbftBody::PeerHeartbeat(PeerHeartbeatMsg {
                committed_block_num: local,
                chain_config_view: self.chain_config.view,
            }),
        ));
    }

    // --- rounds -------------------------------------------------------------

    fn start_height(&mut self, height: u32) -> ConsensusResult<()> {
        self.current = height;
        self.change_views = 0;
        self.own_messages.clear();
        self.timer.cancel_below(height);
        self.publish_status();

        if self.state_mgr.can_participate() {
            if let Some(me) = self.my_index {
                let parts = self.participants_for(height)?;
                if let Some(rank) = parts.proposer_rank(me) {
                    let after = self.propose_delay(rank, height)?;
                    self.timer.start(VbftTimer::Propose, height, after);
                }
                if parts.is_endorser(me) {
                    let after = self.propose_delay(1, height)?;
                    self.timer.start(VbftTimer::Endorse, height, after);
                }
                debug!(
                    "vbft: height {} proposers {:?} local index {}",
                    height, parts.proposers, me
                );
            }
        }
        self.replay_future(height);
        Ok(())
    }

    fn replay_future(&mut self, height: u32) {
        let (ready, later): (Vec<_>, Vec<_>) = self
            .future
            .drain(..)
            .filter(|(_, p)| p.height >= height)
            .partition(|(_, p)| p.height == height);
        self.future = later.into();
        for (from, payload) in ready {
            if let Err(e) = self.process_payload(from, payload) {
                self.on_drop(from, e);
            }
        }
    }

    fn buffer_future(&mut self, from: PeerId, payload: ConsensusPayload) {
        if self.future.len() >= FUTURE_CAPACITY {
            self.future.pop_front();
        }
        self.future.push_back((from, payload));
    }

    fn propose(&mut self, height: u32) -> ConsensusResult<()> {
        let Some(me) = self.my_index else {
            return Ok(());
        };
        if height != self.current || !self.state_mgr.can_participate() {
            return Ok(());
        }
        let round = self.block_pool.round(height);
        if round.proposed {
            return Ok(());
        }
        round.proposed = true;

        let prev_vrf = self.prev_vrf(height)?;
        let (vrf_value, vrf_proof) = compute_vrf(&self.account, height, &prev_vrf)?;
        let new_chain_config = match self.pending_chain_config(height) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!("vbft: pending chain config unavailable: {}", e);
                None
            }
        };
        let last_config_block_num = if new_chain_config.is_some() {
            height
        } else {
            self.last_config_block_num
        };
        let next_keys = new_chain_config
            .as_ref()
            .unwrap_or(&self.chain_config)
            .public_keys();
        let info = VbftBlockInfo {
            proposer: me,
            vrf_value,
            vrf_proof,
            last_config_block_num,
            new_chain_config,
        };

        let parent = self.ledger.get_header(height - 1)?;
        let transactions = self.txpool.pull(self.config.max_tx_in_block, height);
        let tx_root = Block::transactions_root_of(&transactions);
        let block = Block::new(
            parent.hash(),
            self.ledger.block_root_with_new_tx_root(tx_root),
            unix_now().max(parent.timestamp + 1),
            height,
            0,
            info.to_bytes(),
            Address::from_bookkeepers(&next_keys),
            transactions,
        );
        let hash = block.hash();
        let signature = self.account.sign(hash.as_bytes());
        let rank = self.participants_for(height)?.proposer_rank(me).unwrap_or(0);
        info!(
            "vbft: peer {} proposes block {} ({}) rank {} with {} txs",
            me,
            height,
            hash,
            rank,
            block.transactions.len()
        );
        let frame = self
            .broadcast_own(&VbftMessage::new(
                height,
                VbftBody::BlockProposal {
                    block: block.clone(),
                    signature,
                },
            ))
            .unwrap_or_default();
        self.accept_proposal(
            height,
            Candidate {
                block,
                info,
                hash,
                rank,
                signature,
                frame,
            },
        )
    }

    fn check_config_rule(&self, height: u32, info: &VbftBlockInfo) -> ConsensusResult<()> {
        match &info.new_chain_config {
            Some(cfg) => {
                if info.last_config_block_num != height {
                    return Err(ConsensusError::Auth(format!(
                        "new chain config at {} claims config block {}",
                        height, info.last_config_block_num
                    )));
                }
                if self.pending_chain_config(height)?.as_ref() != Some(cfg) {
                    return Err(ConsensusError::Auth(format!(
                        "unexpected chain config v{} view {} at {}",
                        cfg.version, cfg.view, height
                    )));
                }
            }
            None => {
                if let Some(expected) = self.pending_chain_config(height)? {
                    return Err(ConsensusError::Auth(format!(
                        "block {} must carry chain config v{}",
                        height, expected.version
                    )));
                }
                if info.last_config_block_num != self.last_config_block_num {
                    return Err(ConsensusError::Auth(format!(
                        "config block {} but local is {}",
                        info.last_config_block_num, self.last_config_block_num
                    )));
                }
            }
        }
        Ok(())
    }

    fn on_proposal(
        &mut self,
        index: u32,
        height: u32,
        block: Block,
        signature: Signature,
        frame: Vec<u8>,
    ) -> ConsensusResult<()> {
        let parts = self.participants_for(height)?;
        let Some(rank) = parts.proposer_rank(index) else {
            return Err(ConsensusError::Auth(format!(
                "peer {} is not a proposer at {}",
                index, height
            )));
        };
        if block.height() != height {
            return Err(ConsensusError::Auth(format!(
                "proposal for {} carries block {}",
                height,
                block.height()
            )));
        }
        if self.block_pool.proposal(height, index).is_some() {
            return Err(ConsensusError::Stale(format!(
                "duplicate proposal from {} at {}",
                index, height
            )));
        }
        let info = VbftBlockInfo::of_block(&block)?;
        if info.proposer != index {
            return Err(ConsensusError::Auth(format!(
                "block info names proposer {} but sender is {}",
                info.proposer, index
            )));
        }
        let parent = self.ledger.get_header(height - 1)?;
        if block.header.prev_block_hash != parent.hash() {
            return Err(ConsensusError::Stale(format!(
                "proposal at {} does not extend local tip",
                height
            )));
        }
        let key = self.peer_key(index)?;
        let prev_vrf = self.prev_vrf(height)?;
        if !verify_vrf(&key, height, &prev_vrf, &info.vrf_value, &info.vrf_proof) {
            return Err(ConsensusError::Auth(format!("bad vrf from {} at {}", index, height)));
        }
        let ts = block.header.timestamp;
        if ts <= parent.timestamp || ts > unix_now() + MAX_TIMESTAMP_SKEW {
            return Err(ConsensusError::Auth(format!("header timestamp {} out of range", ts)));
        }
        block.verify_structure().map_err(ConsensusError::Auth)?;
        for tx in &block.transactions {
            self.txpool
                .verify_tx(tx)
                .map_err(|e| ConsensusError::Auth(format!("invalid transaction {}: {}", tx.hash(), e)))?;
        }
        let expected_root = self
            .ledger
            .block_root_with_new_tx_root(block.header.transactions_root);
        if block.header.block_root != expected_root {
            return Err(ConsensusError::Auth("block root mismatch".into()));
        }
        self.check_config_rule(height, &info)?;
        let next_keys = info
            .new_chain_config
            .as_ref()
            .unwrap_or(&self.chain_config)
            .public_keys();
        if block.header.next_bookkeeper != Address::from_bookkeepers(&next_keys) {
            return Err(ConsensusError::Auth("unexpected next bookkeeper".into()));
        }
        let hash = block.hash();
        if !key.verify(hash.as_bytes(), &signature) {
            return Err(ConsensusError::Auth(format!(
                "bad proposal signature from {}",
                index
            )));
        }
        debug!("vbft: proposal {} from {} rank {}", hash, index, rank);
        self.accept_proposal(
            height,
            Candidate {
                block,
                info,
                hash,
                rank,
                signature,
                frame,
            },
        )
    }

    fn accept_proposal(&mut self, height: u32, candidate: Candidate) -> ConsensusResult<()> {
        let proposer = candidate.info.proposer;
        if !self.block_pool.add_proposal(height, proposer, candidate) {
            return Err(ConsensusError::Stale(format!(
                "duplicate proposal from {} at {}",
                proposer, height
            )));
        }
        self.maybe_endorse(height)?;
        self.check_commit_quorum(height)
    }

    fn maybe_endorse(&mut self, height: u32) -> ConsensusResult<()> {
        let Some(me) = self.my_index else {
            return Ok(());
        };
        if height != self.current || !self.state_mgr.can_participate() {
            return Ok(());
        }
        if !self.participants_for(height)?.is_endorser(me) {
            return Ok(());
        }
        let round = self.block_pool.round(height);
        if round.endorsed {
            return Ok(());
        }
        let due = round.endorse_due;
        let Some(best) = self.block_pool.best_proposal(height) else {
            return Ok(());
        };
        if best.rank != 0 && !due {
            return Ok(());
        }
        let (proposer, hash) = (best.info.proposer, best.hash);
        self.endorse(me, height, proposer, hash)
    }

    fn endorse(&mut self, me: u32, height: u32, proposer: u32, hash: Hash256) -> ConsensusResult<()> {
        let signature = self
            .account
            .sign(endorse_digest(height, proposer, &hash).as_bytes());
        self.block_pool.round(height).endorsed = true;
        self.block_pool.add_endorsement(
            height,
            me,
            Vote {
                proposer,
                block_hash: hash,
                signature,
            },
        );
        self.timer.cancel(VbftTimer::Endorse, height);
        debug!("vbft: endorse {} from {} at {}", hash, proposer, height);
        self.broadcast_own(&VbftMessage::new(
            height,
            VbftBody::BlockEndorse {
                proposer,
                block_hash: hash,
                signature,
            },
        ));
        if self.participants_for(height)?.is_committer(me) {
            self.timer
                .start(VbftTimer::Commit, height, self.chain_config.hash_msg_delay);
        }
        self.check_endorse_quorum(height)
    }

    fn on_endorse(&mut self, index: u32, height: u32, vote: Vote) -> ConsensusResult<()> {
        if !self.participants_for(height)?.is_endorser(index) {
            return Err(ConsensusError::Stale(format!(
                "peer {} is not an endorser at {}",
                index, height
            )));
        }
        let key = self.peer_key(index)?;
        let digest = endorse_digest(height, vote.proposer, &vote.block_hash);
        if !key.verify(digest.as_bytes(), &vote.signature) {
            return Err(ConsensusError::Auth(format!("bad endorse signature from {}", index)));
        }
        if !self.block_pool.add_endorsement(height, index, vote) {
            return Err(ConsensusError::Stale(format!(
                "duplicate endorse from {} at {}",
                index, height
            )));
        }
        self.check_endorse_quorum(height)
    }

    fn check_endorse_quorum(&mut self, height: u32) -> ConsensusResult<()> {
        let Some(me) = self.my_index else {
            return Ok(());
        };
        if !self.state_mgr.can_participate() || !self.participants_for(height)?.is_committer(me) {
            return Ok(());
        }
        if self.block_pool.get_round(height).is_some_and(|r| r.committed) {
            return Ok(());
        }
        let Some((proposer, hash)) = self
            .block_pool
            .endorsement_quorum(height, self.chain_config.quorum())
        else {
            return Ok(());
        };
        let signature = self.account.sign(hash.as_bytes());
        self.block_pool.round(height).committed = true;
        self.block_pool.add_commit(
            height,
            me,
            Vote {
                proposer,
                block_hash: hash,
                signature,
            },
        );
        debug!("vbft: commit {} from {} at {}", hash, proposer, height);
        self.broadcast_own(&VbftMessage::new(
            height,
            VbftBody::BlockCommit {
                proposer,
                block_hash: hash,
                signature,
            },
        ));
        self.check_commit_quorum(height)
    }

    fn on_commit(&mut self, index: u32, height: u32, vote: Vote) -> ConsensusResult<()> {
        if !self.participants_for(height)?.is_committer(index) {
            return Err(ConsensusError::Stale(format!(
                "peer {} is not a committer at {}",
                index, height
            )));
        }
        let key = self.peer_key(index)?;
        if !key.verify(vote.block_hash.as_bytes(), &vote.signature) {
            return Err(ConsensusError::Auth(format!("bad commit signature from {}", index)));
        }
        if !self.block_pool.add_commit(height, index, vote) {
            return Err(ConsensusError::Stale(format!(
                "duplicate commit from {} at {}",
                index, height
            )));
        }
        self.check_commit_quorum(height)
    }

    fn check_commit_quorum(&mut self, height: u32) -> ConsensusResult<()> {
        if height != self.current {
            return Ok(());
        }
        let Some((proposer, hash)) = self
            .block_pool
            .commit_quorum(height, self.chain_config.quorum())
        else {
            return Ok(());
        };
        match self.block_pool.proposal(height, proposer) {
            Some(candidate) if candidate.hash == hash => {
                let candidate = candidate.clone();
                self.seal(height, candidate)
            }
            _ => {
                let round = self.block_pool.round(height);
                if !round.proposal_fetched {
                    round.proposal_fetched = true;
                    info!("vbft: commit quorum on unseen block {}, fetching", hash);
                    self.broadcast(&VbftMessage::new(height, VbftBody::ProposalFetch { proposer }));
                }
                Ok(())
            }
        }
    }

    fn seal(&mut self, height: u32, candidate: Candidate) -> ConsensusResult<()> {
        let Candidate {
            mut block,
            info,
            hash,
            ..
        } = candidate;
        let signers: Vec<(PublicKey, Signature)> = self
            .block_pool
            .commit_signatures(height, info.proposer, &hash)
            .into_iter()
            .filter_map(|(index, sig)| self.chain_config.peer(index).map(|p| (p.id.clone(), sig)))
            .collect();
        let signature_count = signers.len();
        block.set_signatures(signers);
        let result = self.ledger.execute_block(&block)?;
        self.ledger.submit_block(&block, None, &result)?;

        info!(
            "vbft: sealed block {} ({}) proposer {} with {} commits",
            height, hash, info.proposer, signature_count
        );
        self.last_sealed = Some(SealedBlock {
            height,
            hash,
            view: self.change_views,
            proposer: info.proposer,
        });
        self.txpool.cleanup_on_commit(&block);
        self.p2p.set_height(height);
        self.last_config_block_num = info.last_config_block_num;
        if let Some(cfg) = info.new_chain_config {
            self.install_config(cfg)?;
        }
        self.block_pool.purge_below(height + 1);
        self.scores.decay();
        self.send_heartbeat();
        self.start_height(height + 1)
    }

    // --- sync ---------------------------------------------------------------

    fn peers_at_or_above(&self, height: u32) -> Vec<u32> {
        self.peer_pool
            .committed_heights()
            .into_iter()
            .filter(|(_, committed)| *committed >= height)
            .map(|(index, _)| index)
            .collect()
    }

    fn sync_interval(&self) -> Duration {
        self.chain_config.block_msg_delay * 4
    }

    fn start_sync(&mut self, target: u32) {
        let local = self.ledger.current_block_height();
        let ahead = self.peers_at_or_above(local + 1).len();
        let threshold = (self.chain_config.c as usize + 1).min(ahead).max(1);
        self.syncer.start(target, threshold);
        self.request_block_infos();
        self.timer
            .restart(VbftTimer::SyncTick, LOOP_TIMERS, self.sync_interval());
    }

    fn request_block_infos(&self) {
        let local = self.ledger.current_block_height();
        let peers = self.peers_at_or_above(local + 1);
        for start in self.syncer.info_requests(local) {
            for index in &peers {
                self.send_to(
                    *index,
                    &VbftMessage::new(local, VbftBody::BlockInfoFetch { start_block_num: start }),
                );
            }
        }
    }

    fn request_blocks(&mut self) {
        let local = self.ledger.current_block_height();
        for height in self.syncer.take_block_requests() {
            let holders = self.peers_at_or_above(height);
            if holders.is_empty() {
                continue;
            }
            let index = holders[height as usize % holders.len()];
            self.send_to(
                index,
                &VbftMessage::new(local, VbftBody::BlockFetch { block_num: height }),
            );
        }
    }

    fn apply_synced_blocks(&mut self) -> ConsensusResult<()> {
        while let Some(block) = self.syncer.next_block(self.ledger.current_block_height()) {
            let info = VbftBlockInfo::of_block(&block)?;
            let result = self.ledger.execute_block(&block)?;
            self.ledger.add_block(&block, None, result.state_root)?;
            self.txpool.cleanup_on_commit(&block);
            self.last_config_block_num = info.last_config_block_num;
            if let Some(cfg) = info.new_chain_config {
                self.install_config(cfg)?;
            }
            debug!("vbft: synced block {} ({})", block.height(), block.hash());
        }
        let local = self.ledger.current_block_height();
        self.p2p.set_height(local);
        if local >= self.syncer.target() {
            info!("vbft: sync finished at {}", local);
            self.syncer.finish();
            self.timer.cancel(VbftTimer::SyncTick, LOOP_TIMERS);
            self.block_pool.purge_below(local + 1);
            self.current = local + 1;
            let actions = self.state_mgr.handle(StateEvent::SyncDone { height: local }, local);
            self.apply_actions(actions)?;
        }
        self.publish_status();
        Ok(())
    }

    // --- state actions --------------------------------------------------------

    fn apply_actions(&mut self, actions: Vec<StateAction>) -> ConsensusResult<()> {
        for action in actions {
            match action {
                StateAction::StartSync { target } => self.start_sync(target),
                StateAction::EnterSynced => {
                    let next = self.ledger.current_block_height() + 1;
                    self.start_height(next)?;
                }
                StateAction::SubmitBlockTimeout => self.on_submit_timeout()?,
            }
        }
        self.publish_status();
        Ok(())
    }

    fn on_submit_timeout(&mut self) -> ConsensusResult<()> {
        let height = self.current;
        self.change_views += 1;
        warn!(
            "vbft: no progress at {} (change view {})",
            height, self.change_views
        );
        self.rebroadcast();
        let Some(me) = self.my_index else {
            return Ok(());
        };
        if !self.state_mgr.can_participate() {
            return Ok(());
        }
        let is_proposer = self.participants_for(height)?.proposer_rank(me).is_some();
        if is_proposer && !self.block_pool.round(height).proposed {
            self.propose(height)?;
        }
        self.block_pool.round(height).endorse_due = true;
        self.maybe_endorse(height)
    }

    /// Re-read every peer from the pool after state reports were dropped.
    fn reconcile_peers(&mut self, local: u32) -> ConsensusResult<()> {
        let peers: Vec<(u32, bool, u32)> = self
            .peer_pool
            .snapshots()
            .into_iter()
            .map(|p| (p.index, p.connected, p.committed_block_num().unwrap_or(0)))
            .collect();
        info!("vbft: state reports dropped, reconciling {} peers", peers.len());
        let actions = self.state_mgr.reconcile(peers, local);
        self.apply_actions(actions)
    }

    // --- inbound --------------------------------------------------------------

    fn handle_timeout(&mut self, fired: TimerFired<VbftTimer>) -> ConsensusResult<()> {
        match fired.kind {
            VbftTimer::LiveTick => {
                self.timer.restart(
                    VbftTimer::LiveTick,
                    LOOP_TIMERS,
                    self.chain_config.peer_handshake_timeout,
                );
                self.send_heartbeat();
                let local = self.ledger.current_block_height();
                if self.notifier.take_dropped() {
                    self.reconcile_peers(local)?;
                }
                let actions = self.state_mgr.handle(StateEvent::LiveTick, local);
                self.apply_actions(actions)
            }
            VbftTimer::SyncTick => {
                if !self.syncer.is_active() {
                    return Ok(());
                }
                self.syncer.retry();
                self.request_block_infos();
                self.request_blocks();
                self.timer
                    .restart(VbftTimer::SyncTick, LOOP_TIMERS, self.sync_interval());
                Ok(())
            }
            _ if fired.block_num != self.current => Ok(()),
            VbftTimer::Propose => self.propose(fired.block_num),
            VbftTimer::Endorse => {
                self.block_pool.round(fired.block_num).endorse_due = true;
                self.maybe_endorse(fired.block_num)
            }
            VbftTimer::Commit => {
                self.rebroadcast();
                Ok(())
            }
        }
    }

    fn handle_network(&mut self, event: NetworkEvent) {
        match event {
            NetworkEvent::Connected(info) => {
                if let Some(index) = self.peer_pool.get_index_by_id(&info.public_key) {
                    self.peer_pool.bind(info.id, index);
                    self.peer_pool.peer_connected(index);
                    self.send_handshake(info.id);
                } else {
                    debug!("vbft: {} connected, not in committee", info.id);
                }
            }
            NetworkEvent::Disconnected(id) => {
                if let Some(index) = self.peer_pool.get_index_by_peer(id) {
                    self.peer_pool.peer_disconnected(index);
                }
                self.scores.forget(id);
            }
            NetworkEvent::Message { from, payload } => {
                let result = ConsensusPayload::from_wire(&payload)
                    .and_then(|p| self.process_payload(from, p));
                if let Err(e) = result {
                    self.on_drop(from, e);
                }
            }
        }
    }

    fn on_drop(&mut self, from: PeerId, err: ConsensusError) {
        match &err {
            ConsensusError::Decode(_) | ConsensusError::Auth(_) => {
                warn!("vbft: dropped message from {}: {}", from, err);
                self.scores.note_bad(from, PENALTY);
            }
            ConsensusError::Ledger(_) | ConsensusError::Config(_) => {
                error!("vbft: {}", err);
            }
            _ => debug!("vbft: dropped message from {}: {}", from, err),
        }
    }

    fn process_payload(&mut self, from: PeerId, payload: ConsensusPayload) -> ConsensusResult<()> {
        let index = u32::from(payload.bookkeeper_index);
        if Some(index) == self.my_index && payload.owner == *self.account.public() {
            return Ok(());
        }
        let Some(key) = self.peer_pool.get_pubkey(index) else {
            return Err(ConsensusError::Auth(format!("unknown peer index {}", index)));
        };
        if key != payload.owner {
            return Err(ConsensusError::Auth(format!(
                "owner does not match peer {}",
                index
            )));
        }
        payload.verify()?;
        let msg = VbftMessage::from_bytes(&payload.data)?;
        if msg.block_num != payload.height {
            return Err(ConsensusError::Auth(format!(
                "message for {} in envelope for {}",
                msg.block_num, payload.height
            )));
        }
        self.peer_pool.bind(from, index);

        let local = self.ledger.current_block_height();
        let height = msg.block_num;
        if msg.is_consensus() {
            if height <= local || height < self.current {
                return Err(ConsensusError::Stale(format!(
                    "round message for {} at local {}",
                    height, local
                )));
            }
            if height > self.current || !self.state_mgr.can_participate() {
                self.buffer_future(from, payload);
                return Err(ConsensusError::Future { height, local });
            }
            let tip = self.ledger.current_block_hash();
            if payload.prev_hash != tip {
                return Err(ConsensusError::Stale(format!(
                    "prev hash {} for {} does not match local tip {}",
                    payload.prev_hash, height, tip
                )));
            }
        }

        match msg.body {
            VbftBody::BlockProposal { block, signature } => {
                self.on_proposal(index, height, block, signature, payload.to_wire())
            }
            VbftBody::BlockEndorse {
                proposer,
                block_hash,
                signature,
            } => self.on_endorse(
                index,
                height,
                Vote {
                    proposer,
                    block_hash,
                    signature,
                },
            ),
            VbftBody::BlockCommit {
                proposer,
                block_hash,
                signature,
            } => self.on_commit(
                index,
                height,
                Vote {
                    proposer,
                    block_hash,
                    signature,
                },
            ),
            VbftBody::PeerHandshake { msg, address } => {
                debug!("vbft: handshake from peer {} at {}", index, address);
                if self.p2p.is_own_address(&address) {
                    return Err(ConsensusError::Auth(format!(
                        "peer {} advertises our own address {}",
                        index, address
                    )));
                }
                if !self.p2p.get_neighbors().iter().any(|p| p.id == from) {
                    if let Err(e) = self.p2p.connect(&address) {
                        debug!("vbft: dial {} for peer {} failed: {}", address, index, e);
                    }
                }
                self.peer_pool.peer_handshake(index, msg);
                Ok(())
            }
            VbftBody::PeerHeartbeat(msg) => {
                self.peer_pool.peer_heartbeat(index, msg);
                Ok(())
            }
            VbftBody::BlockInfoFetch { start_block_num } => {
                let end = start_block_num
                    .saturating_add(BLOCK_INFO_BATCH - 1)
                    .min(local);
                let mut infos = Vec::new();
                for h in start_block_num.max(1)..=end {
                    infos.push((h, self.ledger.get_header(h)?.hash()));
                }
                self.send_to_peer(from, &VbftMessage::new(local, VbftBody::BlockInfoFetchResp { infos }));
                Ok(())
            }
            VbftBody::BlockInfoFetchResp { infos } => {
                if !self.syncer.on_block_info(index, &infos, local).is_empty() {
                    self.request_blocks();
                }
                Ok(())
            }
            VbftBody::ProposalFetch { proposer } => {
                if let Some(candidate) = self.block_pool.proposal(height, proposer) {
                    if let Err(e) = self.p2p.send(from, candidate.frame.clone()) {
                        debug!("vbft: proposal reply to {} failed: {}", from, e);
                    }
                }
                Ok(())
            }
            VbftBody::BlockFetch { block_num } => {
                if block_num == 0 || block_num > local {
                    return Err(ConsensusError::Stale(format!(
                        "block {} not available at {}",
                        block_num, local
                    )));
                }
                let block = self.ledger.get_block(block_num)?;
                self.send_to_peer(from, &VbftMessage::new(local, VbftBody::BlockFetchResp { block }));
                Ok(())
            }
            VbftBody::BlockFetchResp { block } => {
                if self.syncer.on_block(block) {
                    self.apply_synced_blocks()?;
                }
                Ok(())
            }
        }
    }

    fn handle_event(&mut self, event: VbftEvent) {
        let result = match event {
            VbftEvent::Network(ev) => {
                self.handle_network(ev);
                Ok(())
            }
            VbftEvent::Timeout(fired) => self.handle_timeout(fired),
        };
        if let Err(e) = result {
            error!("vbft: {}", e);
        }
    }

    fn handle_state_event(&mut self, event: StateEvent) {
        let actions = self
            .state_mgr
            .handle(event, self.ledger.current_block_height());
        if let Err(e) = self.apply_actions(actions) {
            error!("vbft: {}", e);
        }
    }
}

#[async_trait]
impl ConsensusEngine for VbftServer {
    fn name(&self) -> &'static str {
        "vbft"
    }

    fn initialize(&mut self) -> ConsensusResult<()> {
        self.config.validate()?;
        self.config.vbft.validate()?;
        let genesis_hash = self.ledger.get_header(0)?.hash();
        self.genesis_vrf = match read_vbft_config(&*self.ledger)? {
            Some(record) => {
                self.config.vbft = record.params;
                if record.vrf_value.is_empty() {
                    genesis_hash.as_bytes().to_vec()
                } else {
                    record.vrf_value
                }
            }
            None => genesis_hash.as_bytes().to_vec(),
        };
        self.state_mgr.local_config_loaded();
        let cfg = self.load_chain_config()?;
        self.install_config(cfg)?;
        if self.my_index.is_none() {
            warn!("vbft: {} is not in the chain config", self.account.public());
        }
        self.current = self.ledger.current_block_height() + 1;
        self.publish_status();
        Ok(())
    }

    fn status(&self) -> watch::Receiver<EngineStatus> {
        self.status_tx.subscribe()
    }

    async fn run(mut self: Box<Self>, shutdown: CancellationToken) -> ConsensusResult<()> {
        let network = self.network.take().ok_or(ConsensusError::Halted)?;
        let mut state_rx = self.state_rx.take().ok_or(ConsensusError::Halted)?;
        let relay = spawn_network_relay(
            network,
            self.inbound_tx.clone(),
            self.busy.clone(),
            shutdown.clone(),
        );
        self.timer.restart(
            VbftTimer::LiveTick,
            LOOP_TIMERS,
            self.chain_config.peer_handshake_timeout,
        );
        for index in self.peer_pool.get_active_neighbors() {
            if let Some(peer) = self.peer_pool.get_peer_id(index) {
                self.send_handshake(peer);
            }
        }
        self.handle_state_event(StateEvent::ConfigLoaded);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = self.inbound_rx.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                Some(event) = state_rx.recv() => self.handle_state_event(event),
            }
        }

        self.timer.cancel_all();
        self.peer_pool.clean();
        relay.abort();
        info!("vbft: halted at height {}", self.ledger.current_block_height());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VbftParams;
    use crate::vbft::governance::{genesis_storage, key_with_view, ConsGroupInfo, CONS_GROUP_INFO};
    use themis_core::{GenesisConfig, MemLedger, MemTxPool};
    use themis_p2p::MemoryNetwork;

    struct Node {
        server: VbftServer,
        keys: Vec<Arc<KeyPair>>,
        ledger: Arc<MemLedger>,
        _network: MemoryNetwork,
    }

    /// Peer `me` of a four-peer committee at genesis, with two peers
    /// connected so it may take part in consensus.
    fn node(me: usize) -> Node {
        let keys: Vec<Arc<KeyPair>> = (1..=4u8)
            .map(|i| Arc::new(KeyPair::from_seed(&[i; 32]).unwrap()))
            .collect();
        let params = VbftParams {
            n: 4,
            c: 1,
            k: 4,
            l: 16,
            ..VbftParams::default()
        };
        let peers: Vec<(PublicKey, u64)> = keys.iter().map(|k| (k.public().clone(), 100)).collect();
        let ledger = Arc::new(MemLedger::new(GenesisConfig {
            bookkeepers: peers.iter().map(|(pk, _)| pk.clone()).collect(),
            timestamp: 1_000,
            storage: genesis_storage(&params, vec![7u8; 32], vec![], &peers),
        }));
        let network = MemoryNetwork::new();
        let (transport, events) = network.join(keys[me].public().clone());
        let config = ConsensusConfig {
            consensus_type: "vbft".into(),
            vbft: params,
            ..ConsensusConfig::default()
        };
        let deps = ConsensusDeps {
            account: keys[me].clone(),
            ledger: ledger.clone(),
            txpool: Arc::new(MemTxPool::new(100)),
            p2p: Arc::new(transport),
            network: events,
        };
        let mut server = VbftServer::new(config, deps);
        server.initialize().unwrap();
        server.state_mgr.handle(StateEvent::ConfigLoaded, 0);
        let others: Vec<u32> = (1..=4u32).filter(|i| *i != me as u32 + 1).take(2).collect();
        for index in others {
            server
                .state_mgr
                .handle(StateEvent::UpdatePeerConfig { index, connected: true }, 0);
        }
        assert!(server.state_mgr.can_participate());
        Node {
            server,
            keys,
            ledger,
            _network: network,
        }
    }

    fn endorse_from(key: &KeyPair, index: u32, prev_hash: Hash256, hash: Hash256) -> ConsensusPayload {
        let signature = key.sign(endorse_digest(1, 2, &hash).as_bytes());
        let msg = VbftMessage::new(
            1,
            VbftBody::BlockEndorse {
                proposer: 2,
                block_hash: hash,
                signature,
            },
        );
        ConsensusPayload::new_signed(key, prev_hash, 1, index as u16, unix_now(), msg.to_bytes())
    }

    #[test]
    fn test_endorse_digest_binds_height_and_proposer() {
        let hash = sha256d(b"block");
        let base = endorse_digest(5, 1, &hash);
        assert_eq!(base, endorse_digest(5, 1, &hash));
        assert_ne!(base, endorse_digest(6, 1, &hash));
        assert_ne!(base, endorse_digest(5, 2, &hash));
        assert_ne!(base, hash);
    }

    #[test]
    fn test_round_message_on_other_tip_is_stale() {
        let mut n = node(0);
        let parts = n.server.participants_for(1).unwrap();
        let endorser = parts.endorsers.iter().copied().find(|i| *i != 1).unwrap();
        let key = n.keys[endorser as usize - 1].clone();
        let hash = sha256d(b"candidate");

        let side = endorse_from(&key, endorser, sha256d(b"side branch"), hash);
        let err = n.server.process_payload(PeerId(7), side).unwrap_err();
        assert!(matches!(err, ConsensusError::Stale(ref m) if m.contains("prev hash")));
        assert!(n
            .server
            .block_pool
            .get_round(1)
            .map_or(true, |r| r.endorsements.is_empty()));

        let tip = n.ledger.current_block_hash();
        n.server
            .process_payload(PeerId(7), endorse_from(&key, endorser, tip, hash))
            .unwrap();
        let round = n.server.block_pool.get_round(1).unwrap();
        assert_eq!(round.endorsements.get(&endorser).map(|v| v.block_hash), Some(hash));
    }

    #[test]
    fn test_stalled_height_keeps_votes_and_config() {
        let mut n = node(0);
        let hash = sha256d(b"seen");
        let vote = Vote {
            proposer: 2,
            block_hash: hash,
            signature: n.keys[0].sign(hash.as_bytes()),
        };
        {
            let round = n.server.block_pool.round(1);
            round.proposed = true;
            round.endorsed = true;
            round.committed = true;
        }
        n.server.block_pool.add_endorsement(1, 1, vote);
        n.server.block_pool.add_commit(1, 1, vote);
        let before = n.server.chain_config.clone();

        for _ in 0..=before.max_block_change_view {
            n.server.on_submit_timeout().unwrap();
        }
        assert_eq!(n.server.current, 1);
        assert_eq!(n.server.chain_config, before);
        let round = n.server.block_pool.get_round(1).unwrap();
        assert!(round.endorsed && round.committed);
        assert_eq!(n.server.block_pool.commit_signatures(1, 2, &hash).len(), 1);
    }

    #[test]
    fn test_committee_redraw_is_carried_by_block() {
        let mut a = node(0);
        let mut b = node(2);
        a.server.chain_config.max_block_change_view = 1;
        b.server.chain_config.max_block_change_view = 1;

        let next = a.server.pending_chain_config(1).unwrap().unwrap();
        assert_eq!(next.version, a.server.chain_config.version + 1);
        assert_eq!(next.view, a.server.chain_config.view);
        assert_eq!(b.server.pending_chain_config(1).unwrap(), Some(next.clone()));

        let carrier = VbftBlockInfo {
            proposer: 2,
            vrf_value: vec![],
            vrf_proof: vec![],
            last_config_block_num: 1,
            new_chain_config: Some(next.clone()),
        };
        b.server.check_config_rule(1, &carrier).unwrap();
        let bare = VbftBlockInfo {
            last_config_block_num: 0,
            new_chain_config: None,
            ..carrier.clone()
        };
        assert!(matches!(b.server.check_config_rule(1, &bare), Err(ConsensusError::Auth(_))));
        let mut forged = next;
        forged.version += 1;
        let forged = VbftBlockInfo {
            new_chain_config: Some(forged),
            ..carrier
        };
        assert!(matches!(b.server.check_config_rule(1, &forged), Err(ConsensusError::Auth(_))));

        // below the interval nothing is due
        a.server.last_config_block_num = 1;
        assert_eq!(a.server.pending_chain_config(1).unwrap(), None);
    }

    #[test]
    fn test_stakes_follow_next_group_at_period_end() {
        let n = node(0);
        let all: Vec<u32> = n.server.stakes_for(GENESIS_VIEW).unwrap().iter().map(|s| s.index).collect();
        assert_eq!(all, vec![1, 2, 3, 4]);

        let group = ConsGroupInfo {
            pubkeys: n.keys[..3].iter().map(|k| k.public().clone()).collect(),
        };
        n.ledger.put_storage_item(
            Address::governance(),
            key_with_view(CONS_GROUP_INFO, GENESIS_VIEW + 1),
            group.to_bytes(),
        );
        let next: Vec<u32> = n.server.stakes_for(GENESIS_VIEW).unwrap().iter().map(|s| s.index).collect();
        assert_eq!(next, vec![1, 2, 3]);
    }
}
