// SOLO ENGINE
// One validator seals a block every block interval; no voting.
//
// SAFETY INVARIANTS:
// 1. The local account must be the ledger's only bookkeeper
// 2. Each sealed block carries exactly one signature, the local one

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info};
use themis_core::{Address, Block, Ledger, TxPool};
use themis_crypto::KeyPair;
use themis_p2p::{NetworkEvent, P2pService};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::ConsensusConfig;
use crate::engine::{
    unix_now, ConsensusDeps, ConsensusEngine, ConsensusError, ConsensusResult, EngineStatus,
    SealedBlock,
};

pub struct SoloService {
    account: Arc<KeyPair>,
    ledger: Arc<dyn Ledger>,
    txpool: Arc<dyn TxPool>,
    p2p: Arc<dyn P2pService>,
    config: ConsensusConfig,
    network: Option<mpsc::UnboundedReceiver<NetworkEvent>>,
    status_tx: watch::Sender<EngineStatus>,
    last_sealed: Option<SealedBlock>,
}

impl SoloService {
    pub fn new(config: ConsensusConfig, deps: ConsensusDeps) -> Self {
        let (status_tx, _) = watch::channel(EngineStatus::default());
        SoloService {
            account: deps.account,
            ledger: deps.ledger,
            txpool: deps.txpool,
            p2p: deps.p2p,
            config,
            network: Some(deps.network),
            status_tx,
            last_sealed: None,
        }
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(EngineStatus {
            committed_height: self.ledger.current_block_height(),
            view: 0,
            phase: "Solo".to_string(),
            last_sealed: self.last_sealed,
            busy_drops: 0,
        });
    }

    fn seal_next(&mut self) -> ConsensusResult<()> {
        let parent = self.ledger.get_header(self.ledger.current_block_height())?;
        let height = parent.height + 1;
        let transactions = self.txpool.pull(self.config.max_tx_in_block, height);
        let tx_root = Block::transactions_root_of(&transactions);
        let me = self.account.public().clone();
        let mut block = Block::new(
            parent.hash(),
            self.ledger.block_root_with_new_tx_root(tx_root),
            unix_now().max(parent.timestamp + 1),
            height,
            rand::random(),
            Vec::new(),
            Address::from_bookkeepers(std::slice::from_ref(&me)),
            transactions,
        );
        let hash = block.hash();
        block.set_signatures(vec![(me, self.account.sign(hash.as_bytes()))]);

        let result = self.ledger.execute_block(&block)?;
        self.ledger.submit_block(&block, None, &result)?;
        self.txpool.cleanup_on_commit(&block);
        self.p2p.set_height(height);
        info!(
            "solo: sealed block {} ({}) with {} txs",
            height,
            hash,
            block.transactions.len()
        );
        self.last_sealed = Some(SealedBlock {
            height,
            hash,
            view: 0,
            proposer: 0,
        });
        self.publish_status();
        Ok(())
    }
}

#[async_trait]
impl ConsensusEngine for SoloService {
    fn name(&self) -> &'static str {
        "solo"
    }

    fn initialize(&mut self) -> ConsensusResult<()> {
        self.config.validate()?;
        let bookkeepers = self.ledger.get_bookkeepers();
        if bookkeepers.as_slice() != std::slice::from_ref(self.account.public()) {
            return Err(ConsensusError::Config(format!(
                "solo needs the local account as the only bookkeeper, ledger has {}",
                bookkeepers.len()
            )));
        }
        self.publish_status();
        Ok(())
    }

    fn status(&self) -> watch::Receiver<EngineStatus> {
        self.status_tx.subscribe()
    }

    async fn run(mut self: Box<Self>, shutdown: CancellationToken) -> ConsensusResult<()> {
        let mut network = self.network.take().ok_or(ConsensusError::Halted)?;
        let mut ticker = tokio::time::interval(self.config.block_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.seal_next() {
                        error!("solo: {}", e);
                    }
                }
                Some(event) = network.recv() => debug!("solo: ignoring {:?}", event),
            }
        }
        info!("solo: halted at height {}", self.ledger.current_block_height());
        Ok(())
    }
}
