// Ledger collaborator used by the consensus engines.
//
// SAFETY INVARIANTS:
// 1. Blocks are appended strictly in height order; block h+1 must link to
//    the hash of block h
// 2. A non-genesis block is only accepted with a non-empty, fully verified
//    bookkeeper signature set
// 3. Writes are serial: all mutation goes through one write lock
// 4. The block root of height h is the Merkle root over the transaction
//    roots of blocks 0..=h

use parking_lot::RwLock;
use std::collections::HashMap;
use themis_crypto::{sha256d, Hash256, PublicKey};
use thiserror::Error;

use crate::block::Block;
use crate::merkle_tree::compute_merkle_root;
use crate::transaction::Address;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("block at height {0} not found")]
    NotFound(u32),

    #[error("height mismatch: expected {expected}, got {got}")]
    HeightMismatch { expected: u32, got: u32 },

    #[error("previous hash mismatch at height {0}")]
    PrevHashMismatch(u32),

    #[error("invalid block: {0}")]
    InvalidBlock(String),

    #[error("state root mismatch at height {0}")]
    StateRootMismatch(u32),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Result of executing a block against the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteResult {
    pub height: u32,
    pub state_root: Hash256,
}

/// Cross-chain commitment recorded alongside a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrossChainMsg {
    pub height: u32,
    pub state_root: Hash256,
}

pub trait Ledger: Send + Sync {
    fn current_block_height(&self) -> u32;

    fn current_block_hash(&self) -> Hash256;

    fn get_block(&self, height: u32) -> LedgerResult<Block>;

    fn get_header(&self, height: u32) -> LedgerResult<crate::block::Header> {
        self.get_block(height).map(|b| b.header)
    }

    /// Block root the next block would carry if its transaction root is `tx_root`.
    fn block_root_with_new_tx_root(&self, tx_root: Hash256) -> Hash256;

    /// Execute without committing.
    fn execute_block(&self, block: &Block) -> LedgerResult<ExecuteResult>;

    /// Commit a block whose execution result is already known.
    fn submit_block(
        &self,
        block: &Block,
        cross_chain: Option<&CrossChainMsg>,
        result: &ExecuteResult,
    ) -> LedgerResult<()>;

    /// Execute and commit, checking the resulting state root (used by block sync).
    fn add_block(
        &self,
        block: &Block,
        cross_chain: Option<&CrossChainMsg>,
        state_root: Hash256,
    ) -> LedgerResult<()>;

    fn get_storage_item(&self, contract: &Address, key: &[u8]) -> LedgerResult<Option<Vec<u8>>>;

    /// Bookkeepers configured at genesis.
    fn get_bookkeepers(&self) -> Vec<PublicKey>;
}

/// Genesis parameters for [`MemLedger`].
#[derive(Debug, Clone, Default)]
pub struct GenesisConfig {
    pub bookkeepers: Vec<PublicKey>,
    pub timestamp: u32,
    /// `(contract, key, value)` storage items present from genesis.
    pub storage: Vec<(Address, Vec<u8>, Vec<u8>)>,
}

struct Chain {
    blocks: Vec<Block>,
    tx_roots: Vec<Hash256>,
    state_roots: Vec<Hash256>,
    cross_chain: HashMap<u32, CrossChainMsg>,
    storage: HashMap<(Address, Vec<u8>), Vec<u8>>,
}

/// In-memory ledger with serial write semantics.
pub struct MemLedger {
    chain: RwLock<Chain>,
    bookkeepers: Vec<PublicKey>,
}

impl MemLedger {
    pub fn new(genesis: GenesisConfig) -> Self {
        let tx_root = Block::transactions_root_of(&[]);
        let block = Block::new(
            Hash256::ZERO,
            compute_merkle_root(&[tx_root]),
            genesis.timestamp,
            0,
            0,
            Vec::new(),
            Address::from_bookkeepers(&genesis.bookkeepers),
            Vec::new(),
        );
        let state_root = sha256d(block.hash().as_bytes());
        let storage = genesis
            .storage
            .into_iter()
            .map(|(contract, key, value)| ((contract, key), value))
            .collect();
        MemLedger {
            chain: RwLock::new(Chain {
                blocks: vec![block],
                tx_roots: vec![tx_root],
                state_roots: vec![state_root],
                cross_chain: HashMap::new(),
                storage,
            }),
            bookkeepers: genesis.bookkeepers,
        }
    }

    /// Write a storage item directly (governance updates in tests and the devnet).
    pub fn put_storage_item(&self, contract: Address, key: Vec<u8>, value: Vec<u8>) {
        self.chain.write().storage.insert((contract, key), value);
    }

    pub fn get_cross_chain_msg(&self, height: u32) -> Option<CrossChainMsg> {
        self.chain.read().cross_chain.get(&height).cloned()
    }

    fn check_block(chain: &Chain, block: &Block) -> LedgerResult<ExecuteResult> {
        let expected = chain.blocks.len() as u32;
        if block.height() != expected {
            return Err(LedgerError::HeightMismatch {
                expected,
                got: block.height(),
            });
        }
        let parent = &chain.blocks[chain.blocks.len() - 1];
        if block.header.prev_block_hash != parent.hash() {
            return Err(LedgerError::PrevHashMismatch(block.height()));
        }
        if block.header.timestamp < parent.header.timestamp {
            return Err(LedgerError::InvalidBlock("timestamp before parent".into()));
        }
        block.verify_structure().map_err(LedgerError::InvalidBlock)?;
        if block.header.bookkeepers.is_empty() || !block.header.verify_signatures() {
            return Err(LedgerError::InvalidBlock("bad bookkeeper signatures".into()));
        }
        let prev_state = chain.state_roots[chain.state_roots.len() - 1];
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(prev_state.as_bytes());
        buf.extend_from_slice(block.hash().as_bytes());
        Ok(ExecuteResult {
            height: block.height(),
            state_root: sha256d(&buf),
        })
    }

    fn commit(chain: &mut Chain, block: &Block, cross_chain: Option<&CrossChainMsg>, state_root: Hash256) {
        chain.tx_roots.push(block.header.transactions_root);
        chain.state_roots.push(state_root);
        if let Some(msg) = cross_chain {
            chain.cross_chain.insert(block.height(), msg.clone());
        }
        chain.blocks.push(block.clone());
        log::debug!("ledger committed block {} ({})", block.height(), block.hash());
    }
}

impl Ledger for MemLedger {
    fn current_block_height(&self) -> u32 {
        (self.chain.read().blocks.len() - 1) as u32
    }

    fn current_block_hash(&self) -> Hash256 {
        let chain = self.chain.read();
        chain.blocks[chain.blocks.len() - 1].hash()
    }

    fn get_block(&self, height: u32) -> LedgerResult<Block> {
        self.chain
            .read()
            .blocks
            .get(height as usize)
            .cloned()
            .ok_or(LedgerError::NotFound(height))
    }

    fn block_root_with_new_tx_root(&self, tx_root: Hash256) -> Hash256 {
        let chain = self.chain.read();
        let mut roots = chain.tx_roots.clone();
        roots.push(tx_root);
        compute_merkle_root(&roots)
    }

    fn execute_block(&self, block: &Block) -> LedgerResult<ExecuteResult> {
        Self::check_block(&self.chain.read(), block)
    }

    fn submit_block(
        &self,
        block: &Block,
        cross_chain: Option<&CrossChainMsg>,
        result: &ExecuteResult,
    ) -> LedgerResult<()> {
        let mut chain = self.chain.write();
        let checked = Self::check_block(&chain, block)?;
        if checked != *result {
            return Err(LedgerError::StateRootMismatch(block.height()));
        }
        Self::commit(&mut chain, block, cross_chain, checked.state_root);
        Ok(())
    }

    fn add_block(
        &self,
        block: &Block,
        cross_chain: Option<&CrossChainMsg>,
        state_root: Hash256,
    ) -> LedgerResult<()> {
        let mut chain = self.chain.write();
        let checked = Self::check_block(&chain, block)?;
        if checked.state_root != state_root {
            return Err(LedgerError::StateRootMismatch(block.height()));
        }
        Self::commit(&mut chain, block, cross_chain, state_root);
        Ok(())
    }

    fn get_storage_item(&self, contract: &Address, key: &[u8]) -> LedgerResult<Option<Vec<u8>>> {
        Ok(self
            .chain
            .read()
            .storage
            .get(&(*contract, key.to_vec()))
            .cloned())
    }

    fn get_bookkeepers(&self) -> Vec<PublicKey> {
        self.bookkeepers.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Transaction;
    use themis_crypto::KeyPair;

    fn keys(n: u8) -> Vec<KeyPair> {
        (1..=n).map(|i| KeyPair::from_seed(&[i; 32]).unwrap()).collect()
    }

    fn ledger(keys: &[KeyPair]) -> MemLedger {
        MemLedger::new(GenesisConfig {
            bookkeepers: keys.iter().map(|k| k.public().clone()).collect(),
            timestamp: 1_000,
            storage: vec![(Address::governance(), b"k".to_vec(), b"v".to_vec())],
        })
    }

    fn next_block(ledger: &MemLedger, signers: &[KeyPair]) -> Block {
        let txs = vec![Transaction::new(1, Address([1u8; 20]), vec![7])];
        let root = ledger.block_root_with_new_tx_root(Block::transactions_root_of(&txs));
        let mut block = Block::new(
            ledger.current_block_hash(),
            root,
            1_001,
            ledger.current_block_height() + 1,
            0,
            Vec::new(),
            Address::ZERO,
            txs,
        );
        let hash = block.hash();
        block.set_signatures(
            signers
                .iter()
                .map(|k| (k.public().clone(), k.sign(hash.as_bytes())))
                .collect(),
        );
        block
    }

    #[test]
    fn test_genesis_state() {
        let ks = keys(4);
        let ledger = ledger(&ks);
        assert_eq!(ledger.current_block_height(), 0);
        assert_eq!(ledger.get_bookkeepers().len(), 4);
        assert_eq!(
            ledger.get_storage_item(&Address::governance(), b"k").unwrap(),
            Some(b"v".to_vec())
        );
        assert_eq!(ledger.get_storage_item(&Address::governance(), b"x").unwrap(), None);
    }

    #[test]
    fn test_execute_then_submit() {
        let ks = keys(4);
        let ledger = ledger(&ks);
        let block = next_block(&ledger, &ks[..3]);
        let result = ledger.execute_block(&block).unwrap();
        ledger.submit_block(&block, None, &result).unwrap();
        assert_eq!(ledger.current_block_height(), 1);
        assert_eq!(ledger.current_block_hash(), block.hash());
        assert_eq!(ledger.get_header(1).unwrap(), block.header);
    }

    #[test]
    fn test_rejects_unlinked_or_unsigned_blocks() {
        let ks = keys(4);
        let ledger = ledger(&ks);
        let mut unsigned = next_block(&ledger, &ks[..3]);
        unsigned.set_signatures(Vec::new());
        assert!(ledger.execute_block(&unsigned).is_err());

        let mut orphan = next_block(&ledger, &ks[..3]);
        orphan.header.prev_block_hash = Hash256::ZERO;
        assert!(matches!(
            ledger.execute_block(&orphan),
            Err(LedgerError::PrevHashMismatch(1)) | Err(LedgerError::InvalidBlock(_))
        ));
    }

    #[test]
    fn test_add_block_checks_state_root() {
        let ks = keys(4);
        let ledger = ledger(&ks);
        let block = next_block(&ledger, &ks[..3]);
        let root = ledger.execute_block(&block).unwrap().state_root;
        assert_eq!(
            ledger.add_block(&block, None, Hash256::ZERO),
            Err(LedgerError::StateRootMismatch(1))
        );
        let msg = CrossChainMsg { height: 1, state_root: root };
        ledger.add_block(&block, Some(&msg), root).unwrap();
        assert_eq!(ledger.get_cross_chain_msg(1), Some(msg));
        assert!(matches!(ledger.get_block(5), Err(LedgerError::NotFound(5))));
    }
}
