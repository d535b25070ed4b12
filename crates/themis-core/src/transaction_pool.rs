use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use themis_crypto::Hash256;

use crate::block::Block;
use crate::transaction::Transaction;

/// Transaction pool collaborator used by block producers.
pub trait TxPool: Send + Sync {
    /// Up to `max_count` valid transactions for the block at `height`, oldest first.
    fn pull(&self, max_count: usize, height: u32) -> Vec<Transaction>;

    fn remove(&self, hashes: &[Hash256]);

    /// Drop everything the committed block included.
    fn cleanup_on_commit(&self, block: &Block) {
        let hashes: Vec<Hash256> = block.transactions.iter().map(Transaction::hash).collect();
        self.remove(&hashes);
    }

    /// Stateless check applied to transactions received inside a proposal.
    fn verify_tx(&self, tx: &Transaction) -> Result<(), String> {
        tx.verify()
    }
}

struct Pool {
    queue: VecDeque<Transaction>,
    seen: HashSet<Hash256>,
}

/// A bounded FIFO transaction pool.
///
/// SAFETY INVARIANTS:
/// 1. `queue.len() <= max_size`
/// 2. No two queued transactions share a hash
pub struct MemTxPool {
    pool: Mutex<Pool>,
    max_size: usize,
}

impl MemTxPool {
    pub fn new(max_size: usize) -> Self {
        Self {
            pool: Mutex::new(Pool {
                queue: VecDeque::with_capacity(max_size),
                seen: HashSet::new(),
            }),
            max_size,
        }
    }

    /// Returns false if the pool is full, the transaction is a duplicate, or it fails `verify`.
    pub fn add_transaction(&self, tx: Transaction) -> bool {
        if let Err(e) = tx.verify() {
            log::error!("Transaction validation failed: {}", e);
            return false;
        }
        let mut pool = self.pool.lock();
        if pool.queue.len() >= self.max_size {
            log::warn!(
                "Transaction pool at capacity ({}), rejecting transaction",
                self.max_size
            );
            return false;
        }
        let hash = tx.hash();
        if !pool.seen.insert(hash) {
            log::warn!("Duplicate transaction rejected: {}", hash);
            return false;
        }
        pool.queue.push_back(tx);
        log::debug!("Transaction added to pool. Pool size: {}/{}", pool.queue.len(), self.max_size);
        true
    }

    pub fn pool_size(&self) -> usize {
        self.pool.lock().queue.len()
    }
}

impl TxPool for MemTxPool {
    fn pull(&self, max_count: usize, height: u32) -> Vec<Transaction> {
        let pool = self.pool.lock();
        let txs: Vec<Transaction> = pool
            .queue
            .iter()
            .filter(|tx| tx.verify().is_ok())
            .take(max_count)
            .cloned()
            .collect();
        log::debug!("pulled {} transactions for height {}", txs.len(), height);
        txs
    }

    fn remove(&self, hashes: &[Hash256]) {
        let drop: HashSet<&Hash256> = hashes.iter().collect();
        let mut pool = self.pool.lock();
        pool.queue.retain(|tx| !drop.contains(&tx.hash()));
        for h in hashes {
            pool.seen.remove(h);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Address;

    fn tx(nonce: u32) -> Transaction {
        Transaction::new(nonce, Address([1u8; 20]), vec![nonce as u8])
    }

    #[test]
    fn test_capacity_and_duplicates() {
        let pool = MemTxPool::new(2);
        assert!(pool.add_transaction(tx(1)));
        assert!(!pool.add_transaction(tx(1)));
        assert!(pool.add_transaction(tx(2)));
        assert!(!pool.add_transaction(tx(3)));
        assert_eq!(pool.pool_size(), 2);
    }

    #[test]
    fn test_pull_is_fifo_and_non_destructive() {
        let pool = MemTxPool::new(10);
        for i in 0..5 {
            pool.add_transaction(tx(i));
        }
        let pulled = pool.pull(3, 1);
        assert_eq!(pulled, vec![tx(0), tx(1), tx(2)]);
        assert_eq!(pool.pool_size(), 5);
    }

    #[test]
    fn test_cleanup_on_commit_removes_included() {
        let pool = MemTxPool::new(10);
        for i in 0..4 {
            pool.add_transaction(tx(i));
        }
        let block = Block::new(
            Hash256::ZERO,
            Hash256::ZERO,
            0,
            1,
            0,
            Vec::new(),
            Address::ZERO,
            vec![tx(0), tx(2)],
        );
        pool.cleanup_on_commit(&block);
        assert_eq!(pool.pull(10, 2), vec![tx(1), tx(3)]);
        // removed transactions may be re-added
        assert!(pool.add_transaction(tx(0)));
    }
}
