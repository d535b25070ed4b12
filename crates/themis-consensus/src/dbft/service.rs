// DBFT EVENT LOOP
// Single-committee three-phase BFT with explicit view change.
//
// SAFETY INVARIANTS:
// 1. All context mutation happens on the loop task; timers and the network
//    relay only enqueue events
// 2. A block is submitted at most once per height, after M verified
//    signatures over the same header
// 3. Timer events are matched against the current (height, view) before
//    they act; late events from cancelled timers are ignored
// 4. A BlockSignatures envelope is relayed at most once per distinct hash

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use themis_core::{Address, Block, Decode, Encode, Ledger, Transaction, TxPool};
use themis_crypto::{Hash256, KeyPair, Signature};
use themis_p2p::{NetworkEvent, P2pService, PeerId, PeerScoreBook};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::ConsensusConfig;
use crate::dbft::context::{ConsensusContext, ConsensusState};
use crate::dbft::message::{DbftBody, DbftMessage};
use crate::engine::{
    spawn_network_relay, unix_now, ConsensusDeps, ConsensusEngine, ConsensusError,
    ConsensusResult, EngineStatus, SealedBlock, INBOUND_CAPACITY, MAX_TIMESTAMP_SKEW,
};
use crate::payload::ConsensusPayload;
use crate::timer::{EventTimer, TimerFired};

/// Buffered envelopes for heights ahead of the current round.
const FUTURE_CAPACITY: usize = 256;

const PENALTY: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbftTimer {
    /// Round timer for the given view: primary proposes, backups give up.
    Round(u8),
    /// Re-request a view change if `expected view` was not reached.
    ChangeView(u8),
}

pub enum DbftEvent {
    Network(NetworkEvent),
    Timeout(TimerFired<DbftTimer>),
}

impl From<NetworkEvent> for DbftEvent {
    fn from(ev: NetworkEvent) -> Self {
        DbftEvent::Network(ev)
    }
}

impl From<TimerFired<DbftTimer>> for DbftEvent {
    fn from(t: TimerFired<DbftTimer>) -> Self {
        DbftEvent::Timeout(t)
    }
}

pub struct DbftService {
    account: Arc<KeyPair>,
    ledger: Arc<dyn Ledger>,
    txpool: Arc<dyn TxPool>,
    p2p: Arc<dyn P2pService>,
    config: ConsensusConfig,
    ctx: ConsensusContext,
    timer: EventTimer<DbftTimer, DbftEvent>,
    inbound_tx: mpsc::Sender<DbftEvent>,
    inbound_rx: mpsc::Receiver<DbftEvent>,
    network: Option<mpsc::UnboundedReceiver<NetworkEvent>>,
    future: VecDeque<(PeerId, ConsensusPayload)>,
    relayed: HashSet<Hash256>,
    scores: PeerScoreBook,
    busy: Arc<AtomicU64>,
    status_tx: watch::Sender<EngineStatus>,
    last_sealed: Option<SealedBlock>,
}

impl DbftService {
    pub fn new(config: ConsensusConfig, deps: ConsensusDeps) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (status_tx, _) = watch::channel(EngineStatus::default());
        DbftService {
            ctx: ConsensusContext::new(deps.account.public().clone()),
            account: deps.account,
            ledger: deps.ledger,
            txpool: deps.txpool,
            p2p: deps.p2p,
            config,
            timer: EventTimer::new(inbound_tx.clone()),
            inbound_tx,
            inbound_rx,
            network: Some(deps.network),
            future: VecDeque::new(),
            relayed: HashSet::new(),
            scores: PeerScoreBook::default(),
            busy: Arc::new(AtomicU64::new(0)),
            status_tx,
            last_sealed: None,
        }
    }

    /// `block_interval << (view + 1)`, capped to avoid overflow.
    fn backoff(&self, view: u8) -> Duration {
        let shift = (u32::from(view) + 1).min(16);
        self.config.block_interval() * (1u32 << shift)
    }

    fn publish_status(&self) {
        let status = EngineStatus {
            committed_height: self.ledger.current_block_height(),
            view: u32::from(self.ctx.view),
            phase: format!("{:?}", self.ctx.state),
            last_sealed: self.last_sealed,
            busy_drops: self.busy.load(Ordering::Relaxed),
        };
        self.status_tx.send_replace(status);
    }

    /// Enter `view` at the current height; view 0 starts a new height.
    fn initialize_consensus(&mut self, view: u8) -> ConsensusResult<()> {
        if view == 0 {
            self.ctx.reset(&*self.ledger)?;
            self.relayed.clear();
            self.scores.decay();
        } else {
            self.ctx.change_view(view);
        }
        self.timer.cancel_below(self.ctx.height + 1);

        let Some(me) = self.ctx.my_index else {
            debug!("dbft: not a bookkeeper at height {}, observing", self.ctx.height);
            self.publish_status();
            return Ok(());
        };

        if me == self.ctx.primary_index {
            self.ctx.state |= ConsensusState::PRIMARY;
            self.timer
                .restart(DbftTimer::Round(view), self.ctx.height, self.config.block_interval());
        } else {
            self.ctx.state |= ConsensusState::BACKUP;
            self.timer
                .restart(DbftTimer::Round(view), self.ctx.height, self.backoff(view));
        }
        info!(
            "dbft: height {} view {} index {} role {:?} primary {}",
            self.ctx.height, view, me, self.ctx.state, self.ctx.primary_index
        );
        self.publish_status();

        if view == 0 {
            self.replay_future();
        }
        Ok(())
    }

    fn replay_future(&mut self) {
        let buffered: Vec<(PeerId, ConsensusPayload)> = self.future.drain(..).collect();
        for (from, payload) in buffered {
            if payload.height < self.ctx.height {
                continue;
            }
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

    fn broadcast(&self, msg: DbftMessage, timestamp: u32) {
        let Some(me) = self.ctx.my_index else {
            return;
        };
        let Some(index) = self.ctx.envelope_index() else {
            error!("dbft: bookkeeper index {} does not fit an envelope", me);
            return;
        };
        let payload = ConsensusPayload::new_signed(
            &self.account,
            self.ctx.prev_hash,
            self.ctx.height,
            index,
            timestamp,
            msg.to_bytes(),
        );
        debug!(
            "dbft: broadcast {} height {} view {}",
            msg.type_name(),
            self.ctx.height,
            msg.view
        );
        self.p2p.broadcast(payload.to_wire());
    }

    fn handle_timeout(&mut self, fired: TimerFired<DbftTimer>) -> ConsensusResult<()> {
        if fired.block_num != self.ctx.height {
            return Ok(());
        }
        match fired.kind {
            DbftTimer::Round(view) => {
                if view != self.ctx.view {
                    return Ok(());
                }
                let state = self.ctx.state;
                if state.has(ConsensusState::PRIMARY) && !state.has(ConsensusState::REQUEST_SENT) {
                    self.timer
                        .restart(DbftTimer::Round(view), self.ctx.height, self.backoff(view));
                    self.send_prepare_request()?;
                } else if !state.has(ConsensusState::BLOCK_GENERATED)
                    && (state.has(ConsensusState::PRIMARY) || state.has(ConsensusState::BACKUP))
                {
                    self.request_change_view();
                }
            }
            DbftTimer::ChangeView(expected) => {
                let Some(me) = self.ctx.my_index else {
                    return Ok(());
                };
                if self.ctx.view >= expected || self.ctx.expected_view[me] != expected {
                    return Ok(());
                }
                self.request_change_view();
            }
        }
        Ok(())
    }

    fn send_prepare_request(&mut self) -> ConsensusResult<()> {
        let Some(me) = self.ctx.my_index else {
            return Ok(());
        };
        self.ctx.state |= ConsensusState::REQUEST_SENT;
        if !self.ctx.state.has(ConsensusState::SIGNATURE_SENT) {
            self.ctx.timestamp = unix_now().max(self.ctx.prev_timestamp + 1);
            self.ctx.nonce = rand::random();
            self.ctx.transactions = self
                .txpool
                .pull(self.config.max_tx_in_block, self.ctx.height);
            let block = self.ctx.build_block(&*self.ledger);
            self.ctx.set_header(block)?;
            self.ctx.sign_header(&self.account);
        }
        let Some(signature) = self.ctx.signatures[me] else {
            return Err(ConsensusError::Stale(format!(
                "no own signature for height {}",
                self.ctx.height
            )));
        };
        info!(
            "dbft: primary {} proposes height {} view {} with {} txs",
            me,
            self.ctx.height,
            self.ctx.view,
            self.ctx.transactions.len()
        );
        self.broadcast(
            DbftMessage::new(
                self.ctx.view,
                DbftBody::PrepareRequest {
                    nonce: self.ctx.nonce,
                    next_bookkeeper: self.ctx.next_bookkeeper,
                    transactions: self.ctx.transactions.clone(),
                    signature,
                },
            ),
            self.ctx.timestamp,
        );
        self.publish_status();
        self.check_signatures()
    }

    fn request_change_view(&mut self) {
        let Some(me) = self.ctx.my_index else {
            return;
        };
        let new_view = self.ctx.expected_view[me].max(self.ctx.view).saturating_add(1);
        self.ctx.expected_view[me] = new_view;
        info!(
            "dbft: request change view height {} view {} -> {}",
            self.ctx.height, self.ctx.view, new_view
        );
        self.timer.restart(
            DbftTimer::ChangeView(new_view),
            self.ctx.height,
            self.backoff(new_view),
        );
        self.broadcast(
            DbftMessage::new(self.ctx.view, DbftBody::ChangeView { new_view }),
            unix_now(),
        );
        if let Err(e) = self.check_expected_view(new_view) {
            error!("dbft: view change failed: {}", e);
        }
    }

    fn check_expected_view(&mut self, view: u8) -> ConsensusResult<()> {
        if self.ctx.view >= view {
            return Ok(());
        }
        if self.ctx.expected_view_count(view) >= self.ctx.m() {
            self.initialize_consensus(view)?;
        }
        Ok(())
    }

    fn handle_network(&mut self, event: NetworkEvent) {
        match event {
            NetworkEvent::Connected(info) => debug!("dbft: {} connected", info.id),
            NetworkEvent::Disconnected(id) => debug!("dbft: {} disconnected", id),
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
                warn!("dbft: dropped message from {}: {}", from, err);
                self.scores.note_bad(from, PENALTY);
            }
            ConsensusError::Ledger(_) | ConsensusError::Config(_) => {
                error!("dbft: {}", err);
            }
            _ => debug!("dbft: dropped message from {}: {}", from, err),
        }
    }

    fn process_payload(&mut self, from: PeerId, payload: ConsensusPayload) -> ConsensusResult<()> {
        if payload.height < self.ctx.height {
            return Err(ConsensusError::Stale(format!(
                "height {} below round {}",
                payload.height, self.ctx.height
            )));
        }
        if payload.height > self.ctx.height {
            let err = ConsensusError::Future {
                height: payload.height,
                local: self.ctx.height,
            };
            self.buffer_future(from, payload);
            return Err(err);
        }
        if payload.prev_hash != self.ctx.prev_hash {
            return Err(ConsensusError::Stale(format!(
                "prev hash {} does not match local tip",
                payload.prev_hash
            )));
        }
        let index = payload.bookkeeper_index as usize;
        if index >= self.ctx.n() {
            return Err(ConsensusError::Auth(format!("bookkeeper index {} out of range", index)));
        }
        if Some(index) == self.ctx.my_index {
            return Ok(());
        }
        if payload.owner != self.ctx.bookkeepers[index] {
            return Err(ConsensusError::Auth(format!(
                "owner does not match bookkeeper {}",
                index
            )));
        }
        payload.verify()?;
        let msg = DbftMessage::from_bytes(&payload.data)?;
        if msg.view != self.ctx.view && !matches!(msg.body, DbftBody::ChangeView { .. }) {
            return Err(ConsensusError::Stale(format!(
                "{} for view {} at local view {}",
                msg.type_name(),
                msg.view,
                self.ctx.view
            )));
        }

        match msg.body {
            DbftBody::ChangeView { new_view } => self.on_change_view(index, new_view),
            DbftBody::PrepareRequest {
                nonce,
                next_bookkeeper,
                transactions,
                signature,
            } => self.on_prepare_request(
                index,
                payload.timestamp,
                nonce,
                next_bookkeeper,
                transactions,
                signature,
            ),
            DbftBody::PrepareResponse { signature } => self.on_prepare_response(index, signature),
            DbftBody::BlockSignatures { signatures } => {
                if self.relayed.insert(payload.hash()) {
                    self.p2p.broadcast(payload.to_wire());
                }
                self.on_block_signatures(signatures)
            }
        }
    }

    fn on_change_view(&mut self, index: usize, new_view: u8) -> ConsensusResult<()> {
        if new_view <= self.ctx.view {
            return Err(ConsensusError::Stale(format!(
                "change view to {} at view {}",
                new_view, self.ctx.view
            )));
        }
        if new_view < self.ctx.expected_view[index] {
            return Err(ConsensusError::Stale(format!(
                "bookkeeper {} already expects view {}",
                index, self.ctx.expected_view[index]
            )));
        }
        debug!("dbft: bookkeeper {} expects view {}", index, new_view);
        self.ctx.expected_view[index] = new_view;
        self.check_expected_view(new_view)
    }

    fn on_prepare_request(
        &mut self,
        index: usize,
        timestamp: u32,
        nonce: u64,
        next_bookkeeper: Address,
        transactions: Vec<Transaction>,
        signature: Signature,
    ) -> ConsensusResult<()> {
        let state = self.ctx.state;
        if !state.has(ConsensusState::BACKUP) || state.has(ConsensusState::REQUEST_RECEIVED) {
            return Err(ConsensusError::Stale("prepare request not expected".into()));
        }
        if index != self.ctx.primary_index {
            return Err(ConsensusError::Auth(format!(
                "prepare request from {} but primary is {}",
                index, self.ctx.primary_index
            )));
        }
        if timestamp <= self.ctx.prev_timestamp || timestamp > unix_now() + MAX_TIMESTAMP_SKEW {
            return Err(ConsensusError::Auth(format!("header timestamp {} out of range", timestamp)));
        }
        if next_bookkeeper != Address::from_bookkeepers(&self.ctx.next_bookkeepers) {
            return Err(ConsensusError::Auth("unexpected next bookkeeper".into()));
        }
        for tx in &transactions {
            self.txpool
                .verify_tx(tx)
                .map_err(|e| ConsensusError::Auth(format!("invalid transaction {}: {}", tx.hash(), e)))?;
        }

        let tx_root = Block::transactions_root_of(&transactions);
        let block = Block::new(
            self.ctx.prev_hash,
            self.ledger.block_root_with_new_tx_root(tx_root),
            timestamp,
            self.ctx.height,
            nonce,
            Vec::new(),
            next_bookkeeper,
            transactions.clone(),
        );
        if !self.ctx.bookkeepers[index].verify(block.hash().as_bytes(), &signature) {
            return Err(ConsensusError::Auth("bad primary signature over header".into()));
        }
        self.ctx.set_header(block)?;
        self.ctx.timestamp = timestamp;
        self.ctx.nonce = nonce;
        self.ctx.next_bookkeeper = next_bookkeeper;
        self.ctx.transactions = transactions;
        self.ctx.state |= ConsensusState::REQUEST_RECEIVED;
        self.ctx.add_signature(index, signature)?;
        for rejected in self.ctx.drain_pending() {
            warn!("dbft: dropped unverifiable response from bookkeeper {}", rejected);
        }

        let own = if self.ctx.state.has(ConsensusState::SIGNATURE_SENT) {
            self.ctx.my_index.and_then(|me| self.ctx.signatures[me])
        } else {
            self.ctx.sign_header(&self.account)
        };
        if let Some(signature) = own {
            self.broadcast(
                DbftMessage::new(self.ctx.view, DbftBody::PrepareResponse { signature }),
                unix_now(),
            );
        }
        self.publish_status();
        self.check_signatures()
    }

    fn on_prepare_response(&mut self, index: usize, signature: Signature) -> ConsensusResult<()> {
        if self.ctx.state.has(ConsensusState::BLOCK_GENERATED) {
            return Err(ConsensusError::Stale("block already generated".into()));
        }
        if self.ctx.signatures[index].is_some() {
            return Err(ConsensusError::Stale(format!(
                "duplicate response from bookkeeper {}",
                index
            )));
        }
        if self.ctx.add_signature(index, signature)? {
            self.check_signatures()?;
        }
        Ok(())
    }

    fn on_block_signatures(&mut self, signatures: Vec<(u16, Signature)>) -> ConsensusResult<()> {
        if self.ctx.state.has(ConsensusState::BLOCK_GENERATED) {
            return Ok(());
        }
        if self.ctx.header().is_none() {
            return Err(ConsensusError::Stale(
                "block signatures before prepare request".into(),
            ));
        }
        for (index, sig) in signatures {
            let index = index as usize;
            if Some(index) == self.ctx.my_index {
                continue;
            }
            if let Err(e) = self.ctx.add_signature(index, sig) {
                warn!("dbft: {}", e);
            }
        }
        self.check_signatures()
    }

    fn check_signatures(&mut self) -> ConsensusResult<()> {
        if self.ctx.state.has(ConsensusState::BLOCK_GENERATED)
            || self.ctx.signature_count() < self.ctx.m()
        {
            return Ok(());
        }
        let Some(block) = self.ctx.finalized_block() else {
            return Ok(());
        };
        let result = self.ledger.execute_block(&block)?;
        self.ledger.submit_block(&block, None, &result)?;
        self.ctx.state |= ConsensusState::BLOCK_GENERATED;

        let hash = block.hash();
        info!(
            "dbft: sealed block {} ({}) view {} with {} signatures",
            block.height(),
            hash,
            self.ctx.view,
            block.header.sig_data.len()
        );
        self.last_sealed = Some(SealedBlock {
            height: block.height(),
            hash,
            view: u32::from(self.ctx.view),
            proposer: self.ctx.primary_index as u32,
        });
        self.broadcast(
            DbftMessage::new(
                self.ctx.view,
                DbftBody::BlockSignatures {
                    signatures: self.ctx.signature_list(),
                },
            ),
            unix_now(),
        );
        self.txpool.cleanup_on_commit(&block);
        self.p2p.set_height(block.height());
        self.initialize_consensus(0)
    }

    fn handle_event(&mut self, event: DbftEvent) {
        let result = match event {
            DbftEvent::Network(ev) => {
                self.handle_network(ev);
                Ok(())
            }
            DbftEvent::Timeout(fired) => self.handle_timeout(fired),
        };
        if let Err(e) = result {
            error!("dbft: {}", e);
        }
    }
}

#[async_trait]
impl ConsensusEngine for DbftService {
    fn name(&self) -> &'static str {
        "dbft"
    }

    fn initialize(&mut self) -> ConsensusResult<()> {
        self.config.validate()?;
        self.ctx.reset(&*self.ledger)?;
        if self.ctx.my_index.is_none() {
            warn!("dbft: {} is not a bookkeeper", self.account.public());
        }
        self.publish_status();
        Ok(())
    }

    fn status(&self) -> watch::Receiver<EngineStatus> {
        self.status_tx.subscribe()
    }

    async fn run(mut self: Box<Self>, shutdown: CancellationToken) -> ConsensusResult<()> {
        let network = self.network.take().ok_or(ConsensusError::Halted)?;
        let relay = spawn_network_relay(
            network,
            self.inbound_tx.clone(),
            self.busy.clone(),
            shutdown.clone(),
        );
        self.initialize_consensus(0)?;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = self.inbound_rx.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
            }
        }

        self.timer.cancel_all();
        relay.abort();
        info!("dbft: halted at height {}", self.ledger.current_block_height());
        Ok(())
    }
}
