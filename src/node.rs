// DEVNET
// A full validator set on the in-memory transport, one ledger and pool per
// node, driven until every node has committed the requested height.
//
// SAFETY INVARIANTS:
// 1. Every node shares one genesis: same bookkeepers, timestamp and storage
// 2. Synthetic transactions are offered to every pool, so any proposer can
//    include them and commit cleanup empties every pool
// 3. The run only succeeds if all nodes hold the same block at the target height

use std::sync::Arc;

use themis_consensus::engine::unix_now;
use themis_consensus::vbft::governance::genesis_storage;
use themis_consensus::{
    new_consensus_service, ConsensusConfig, ConsensusDeps, ConsensusService, ConsensusType,
};
use themis_core::{Address, GenesisConfig, Ledger, MemLedger, MemTxPool, Transaction};
use themis_crypto::{sha256, Hash256, KeyPair, PublicKey};
use themis_p2p::MemoryNetwork;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{NodeConfig, NodeError};

/// Stake assigned to each devnet validator in the governance peer pool.
const DEVNET_STAKE: u64 = 1_000;

/// Extra block intervals granted per requested block before giving up.
const STALL_FACTOR: u32 = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeReport {
    pub index: usize,
    pub public_key: PublicKey,
    pub height: u32,
    pub tip: Hash256,
    pub pending_txs: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevnetReport {
    pub consensus: ConsensusType,
    pub target: u32,
    pub nodes: Vec<NodeReport>,
}

struct DevnetNode {
    key: Arc<KeyPair>,
    ledger: Arc<MemLedger>,
    pool: Arc<MemTxPool>,
    service: ConsensusService,
}

pub struct Devnet {
    kind: ConsensusType,
    consensus: ConsensusConfig,
    blocks: u32,
    tx_per_block: usize,
    nodes: Vec<DevnetNode>,
    // keeps the hub alive for the lifetime of the run
    _network: MemoryNetwork,
}

fn devnet_key(index: usize) -> Result<KeyPair, NodeError> {
    let seed = sha256(format!("themis-devnet-validator-{}", index).as_bytes());
    KeyPair::from_seed(&seed).map_err(|e| NodeError::Invalid(e.to_string()))
}

/// Fit the VBFT committee parameters to `validators` nodes.
fn fit_vbft(consensus: &mut ConsensusConfig, validators: usize) {
    let n = validators as u32;
    let vbft = &mut consensus.vbft;
    vbft.n = n;
    vbft.k = n;
    vbft.c = (n - 1) / 3;
    if vbft.l <= vbft.k {
        vbft.l = vbft.k * 16;
    }
}

impl Devnet {
    pub fn new(config: &NodeConfig) -> Result<Self, NodeError> {
        config.validate()?;
        let kind: ConsensusType = config.consensus.consensus_type.parse()?;
        let mut consensus = config.consensus.clone();
        let validators = match kind {
            ConsensusType::Solo => {
                if config.devnet.validators != 1 {
                    warn!(
                        "solo seals alone; ignoring validators = {}",
                        config.devnet.validators
                    );
                }
                1
            }
            ConsensusType::Vbft => {
                fit_vbft(&mut consensus, config.devnet.validators);
                config.devnet.validators
            }
            ConsensusType::Dbft => config.devnet.validators,
        };

        let keys = (0..validators)
            .map(|i| devnet_key(i).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        let bookkeepers: Vec<PublicKey> = keys.iter().map(|k| k.public().clone()).collect();
        let storage = match kind {
            ConsensusType::Vbft => {
                let peers: Vec<(PublicKey, u64)> =
                    bookkeepers.iter().map(|pk| (pk.clone(), DEVNET_STAKE)).collect();
                genesis_storage(&consensus.vbft, Vec::new(), Vec::new(), &peers)
            }
            _ => Vec::new(),
        };
        let genesis = GenesisConfig {
            bookkeepers,
            timestamp: unix_now().saturating_sub(1),
            storage,
        };

        let network = MemoryNetwork::new();
        let mut nodes = Vec::with_capacity(validators);
        for key in keys {
            let (transport, events) = network.join(key.public().clone());
            let ledger = Arc::new(MemLedger::new(genesis.clone()));
            let pool = Arc::new(MemTxPool::new(
                config.devnet.tx_per_block.max(1) * (config.devnet.blocks as usize + 1),
            ));
            let deps = ConsensusDeps {
                account: key.clone(),
                ledger: ledger.clone(),
                txpool: pool.clone(),
                p2p: Arc::new(transport),
                network: events,
            };
            let service = new_consensus_service(consensus.clone(), deps)?;
            nodes.push(DevnetNode {
                key,
                ledger,
                pool,
                service,
            });
        }
        info!(
            "devnet: {} {} validators, target height {}",
            nodes.len(),
            kind,
            config.devnet.blocks
        );

        Ok(Devnet {
            kind,
            consensus,
            blocks: config.devnet.blocks,
            tx_per_block: config.devnet.tx_per_block,
            nodes,
            _network: network,
        })
    }

    fn offer_transactions(&self, payer: Address, next_nonce: &mut u32) {
        for _ in 0..self.tx_per_block {
            let tx = Transaction::new(*next_nonce, payer, next_nonce.to_le_bytes().to_vec());
            *next_nonce = next_nonce.wrapping_add(1);
            for node in &self.nodes {
                if !node.pool.add_transaction(tx.clone()) {
                    debug!("devnet: pool rejected tx {}", tx.hash());
                }
            }
        }
    }

    fn lowest_height(&self) -> u32 {
        self.nodes
            .iter()
            .map(|n| n.service.status().borrow().committed_height)
            .min()
            .unwrap_or(0)
    }

    /// Start every engine and run until the target height, `shutdown`, or a stall.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<DevnetReport, NodeError> {
        for node in &mut self.nodes {
            node.service.start()?;
        }

        let payer = match self.nodes.first() {
            Some(node) => Address::from_public_key(node.key.public()),
            None => return Err(NodeError::Invalid("no validators".into())),
        };
        let interval = self.consensus.block_interval();
        let budget = interval * STALL_FACTOR.saturating_mul(self.blocks.saturating_add(1));
        let deadline = tokio::time::Instant::now() + budget;
        let mut ticker = tokio::time::interval(interval / 2);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut next_nonce = 0u32;
        let mut outcome = Ok(());

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("devnet: interrupted at height {}", self.lowest_height());
                    break;
                }
                _ = ticker.tick() => {
                    let lowest = self.lowest_height();
                    if lowest >= self.blocks {
                        break;
                    }
                    if tokio::time::Instant::now() >= deadline {
                        outcome = Err(NodeError::Stalled(format!(
                            "lowest height {} after {:?}",
                            lowest, budget
                        )));
                        break;
                    }
                    self.offer_transactions(payer, &mut next_nonce);
                }
            }
        }

        for node in &mut self.nodes {
            if let Err(e) = node.service.halt().await {
                warn!("devnet: halt failed: {}", e);
            }
        }
        outcome?;
        let report = self.report();
        if !shutdown.is_cancelled() {
            self.check_agreement()?;
        }
        Ok(report)
    }

    fn report(&self) -> DevnetReport {
        DevnetReport {
            consensus: self.kind,
            target: self.blocks,
            nodes: self
                .nodes
                .iter()
                .enumerate()
                .map(|(index, node)| NodeReport {
                    index,
                    public_key: node.key.public().clone(),
                    height: node.ledger.current_block_height(),
                    tip: node.ledger.current_block_hash(),
                    pending_txs: node.pool.pool_size(),
                })
                .collect(),
        }
    }

    fn check_agreement(&self) -> Result<(), NodeError> {
        let Some(first) = self.nodes.first() else {
            return Ok(());
        };
        for height in 1..=self.blocks {
            let expected = first.ledger.get_block(height).map_err(|e| NodeError::Diverged {
                height,
                detail: e.to_string(),
            })?;
            for (index, node) in self.nodes.iter().enumerate().skip(1) {
                let hash = node
                    .ledger
                    .get_block(height)
                    .map(|b| b.hash())
                    .map_err(|e| NodeError::Diverged {
                        height,
                        detail: format!("node {}: {}", index, e),
                    })?;
                if hash != expected.hash() {
                    return Err(NodeError::Diverged {
                        height,
                        detail: format!("node {} has {}, node 0 has {}", index, hash, expected.hash()),
                    });
                }
            }
        }
        Ok(())
    }
}

impl DevnetReport {
    /// One-line summary for the log.
    pub fn summary(&self) -> String {
        let heights: Vec<String> = self.nodes.iter().map(|n| n.height.to_string()).collect();
        format!(
            "{} devnet reached target {} (heights [{}])",
            self.consensus,
            self.target,
            heights.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DevnetConfig;

    fn node_config(kind: &str, validators: usize, blocks: u32) -> NodeConfig {
        NodeConfig {
            consensus: ConsensusConfig {
                consensus_type: kind.into(),
                block_interval_ms: 500,
                ..ConsensusConfig::default()
            },
            devnet: DevnetConfig {
                validators,
                blocks,
                tx_per_block: 2,
            },
            log_level: "info".into(),
        }
    }

    #[test]
    fn test_vbft_parameters_follow_validator_count() {
        let mut consensus = ConsensusConfig::default();
        consensus.vbft.l = 5;
        fit_vbft(&mut consensus, 7);
        assert_eq!((consensus.vbft.n, consensus.vbft.k, consensus.vbft.c), (7, 7, 2));
        assert!(consensus.vbft.l > consensus.vbft.k);
        assert!(consensus.vbft.validate().is_ok());
    }

    #[test]
    fn test_keys_are_stable_and_distinct() {
        let a = devnet_key(0).unwrap();
        assert_eq!(a.public(), devnet_key(0).unwrap().public());
        assert_ne!(a.public(), devnet_key(1).unwrap().public());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_solo_devnet_reaches_target() {
        let devnet = Devnet::new(&node_config("solo", 4, 3)).unwrap();
        let report = devnet.run(CancellationToken::new()).await.unwrap();
        assert_eq!(report.nodes.len(), 1);
        assert!(report.nodes[0].height >= 3);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_dbft_devnet_agrees() {
        let devnet = Devnet::new(&node_config("dbft", 4, 3)).unwrap();
        let report = devnet.run(CancellationToken::new()).await.unwrap();
        assert_eq!(report.consensus, ConsensusType::Dbft);
        assert!(report.nodes.iter().all(|n| n.height >= 3));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_cancelled_run_still_halts() {
        let devnet = Devnet::new(&node_config("dbft", 4, 1_000)).unwrap();
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let report = devnet.run(shutdown).await.unwrap();
        assert_eq!(report.nodes.len(), 4);
    }
}
