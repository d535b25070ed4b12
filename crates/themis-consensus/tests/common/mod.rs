// Shared harness for the multi-node consensus tests: one in-memory network,
// one ledger and pool per validator, engines started through the façade.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use themis_consensus::{
    new_consensus_service, ConsensusConfig, ConsensusDeps, ConsensusService, EngineStatus,
};
use themis_core::{Address, GenesisConfig, Ledger, MemLedger, MemTxPool, Transaction};
use themis_crypto::{KeyPair, PublicKey};
use themis_p2p::{MemoryNetwork, PeerId};

pub type Storage = Vec<(Address, Vec<u8>, Vec<u8>)>;

pub struct TestNode {
    pub key: Arc<KeyPair>,
    pub peer_id: PeerId,
    pub ledger: Arc<MemLedger>,
    pub pool: Arc<MemTxPool>,
    pub service: ConsensusService,
}

pub struct Committee {
    pub network: MemoryNetwork,
    pub nodes: Vec<TestNode>,
}

pub fn keys(n: usize) -> Vec<Arc<KeyPair>> {
    (0..n)
        .map(|i| Arc::new(KeyPair::from_seed(&[i as u8 + 1; 32]).unwrap()))
        .collect()
}

/// Build `n` validators sharing one genesis; nothing is started yet.
pub fn committee(config: &ConsensusConfig, n: usize, storage: impl Fn(&[PublicKey]) -> Storage) -> Committee {
    let keys = keys(n);
    let bookkeepers: Vec<PublicKey> = keys.iter().map(|k| k.public().clone()).collect();
    let storage = storage(&bookkeepers);
    let network = MemoryNetwork::new();

    let nodes = keys
        .into_iter()
        .map(|key| {
            let (transport, events) = network.join(key.public().clone());
            let peer_id = themis_p2p::P2pService::local_id(&transport);
            let ledger = Arc::new(MemLedger::new(GenesisConfig {
                bookkeepers: bookkeepers.clone(),
                timestamp: 1_000,
                storage: storage.clone(),
            }));
            let pool = Arc::new(MemTxPool::new(1_000));
            let deps = ConsensusDeps {
                account: key.clone(),
                ledger: ledger.clone(),
                txpool: pool.clone(),
                p2p: Arc::new(transport),
                network: events,
            };
            let service = new_consensus_service(config.clone(), deps).unwrap();
            TestNode {
                key,
                peer_id,
                ledger,
                pool,
                service,
            }
        })
        .collect();
    Committee { network, nodes }
}

impl Committee {
    pub fn start(&mut self) {
        for node in &mut self.nodes {
            node.service.start().unwrap();
        }
    }

    /// Offer the same transaction to every pool.
    pub fn submit(&self, tx: Transaction) {
        for node in &self.nodes {
            assert!(node.pool.add_transaction(tx.clone()));
        }
    }

    /// Wait until every node in `which` has committed `height`.
    pub async fn wait_height(&self, which: &[usize], height: u32, limit: Duration) {
        for &i in which {
            let mut status = self.nodes[i].service.status();
            tokio::time::timeout(limit, status.wait_for(|s: &EngineStatus| s.committed_height >= height))
                .await
                .unwrap_or_else(|_| panic!("node {} did not reach height {}", i, height))
                .unwrap();
        }
    }

    pub async fn halt(&mut self) {
        for node in &mut self.nodes {
            node.service.halt().await.unwrap();
        }
    }

    /// Every node in `which` holds the same block at each height up to `height`.
    pub fn assert_agree(&self, which: &[usize], height: u32) {
        let first = &self.nodes[which[0]].ledger;
        for h in 1..=height {
            let expected = first.get_block(h).unwrap();
            assert!(expected.header.verify_signatures(), "bad signatures at {}", h);
            for &i in &which[1..] {
                let block = self.nodes[i].ledger.get_block(h).unwrap();
                assert_eq!(block.hash(), expected.hash(), "node {} forked at {}", i, h);
            }
        }
    }
}

pub fn tx(nonce: u32, payer: &KeyPair) -> Transaction {
    Transaction::new(nonce, Address::from_public_key(payer.public()), nonce.to_le_bytes().to_vec())
}
