// Block syncer driven from the VBFT server loop.
//
// Peers are asked for block hashes first; a hash is trusted once enough
// peers agree on it, and only then is the block itself fetched and applied.
//
// SAFETY INVARIANTS:
// 1. A fetched block is accepted only if its hash equals the agreed hash
// 2. Blocks are handed out strictly in height order

use std::collections::{BTreeMap, HashMap, HashSet};
use themis_core::Block;
use themis_crypto::Hash256;

use crate::vbft::message::BLOCK_INFO_BATCH;

#[derive(Debug, Default)]
pub struct Syncer {
    active: bool,
    target: u32,
    /// height -> hash -> peers vouching for it
    votes: BTreeMap<u32, HashMap<Hash256, HashSet<u32>>>,
    agreed: BTreeMap<u32, Hash256>,
    blocks: BTreeMap<u32, Block>,
    requested: HashSet<u32>,
    threshold: usize,
}

impl Syncer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn target(&self) -> u32 {
        self.target
    }

    /// Begin or extend a sync towards `target`; `threshold` peers must agree
    /// on a block hash before it is fetched.
    pub fn start(&mut self, target: u32, threshold: usize) {
        if !self.active {
            self.votes.clear();
            self.agreed.clear();
            self.blocks.clear();
            self.requested.clear();
        }
        self.active = true;
        self.target = self.target.max(target);
        self.threshold = threshold.max(1);
        log::info!("vbft sync started towards {}", self.target);
    }

    pub fn finish(&mut self) {
        self.active = false;
        self.votes.clear();
        self.agreed.clear();
        self.blocks.clear();
        self.requested.clear();
    }

    /// Start heights for `BlockInfoFetch` batches still missing agreement.
    pub fn info_requests(&self, local: u32) -> Vec<u32> {
        let mut out = Vec::new();
        let mut start = local + 1;
        while start <= self.target {
            let end = (start + BLOCK_INFO_BATCH - 1).min(self.target);
            if (start..=end).any(|h| !self.agreed.contains_key(&h)) {
                out.push(start);
            }
            start = end + 1;
        }
        out
    }

    /// Record block hashes reported by `peer`; returns heights that reached
    /// agreement with this report.
    pub fn on_block_info(&mut self, peer: u32, infos: &[(u32, Hash256)], local: u32) -> Vec<u32> {
        let mut newly = Vec::new();
        if !self.active {
            return newly;
        }
        for (height, hash) in infos {
            if *height <= local || *height > self.target || self.agreed.contains_key(height) {
                continue;
            }
            let voters = self.votes.entry(*height).or_default().entry(*hash).or_default();
            voters.insert(peer);
            if voters.len() >= self.threshold {
                self.agreed.insert(*height, *hash);
                self.votes.remove(height);
                newly.push(*height);
            }
        }
        newly
    }

    pub fn agreed_hash(&self, height: u32) -> Option<Hash256> {
        self.agreed.get(&height).copied()
    }

    /// Agreed heights whose block has neither arrived nor been requested.
    /// Marks them requested.
    pub fn take_block_requests(&mut self) -> Vec<u32> {
        let wanted: Vec<u32> = self
            .agreed
            .keys()
            .copied()
            .filter(|h| !self.blocks.contains_key(h) && !self.requested.contains(h))
            .collect();
        self.requested.extend(wanted.iter().copied());
        wanted
    }

    /// Allow every outstanding block to be requested again.
    pub fn retry(&mut self) {
        self.requested.clear();
    }

    /// Store a fetched block if it matches the agreed hash.
    pub fn on_block(&mut self, block: Block) -> bool {
        let height = block.height();
        match self.agreed.get(&height) {
            Some(hash) if *hash == block.hash() => {
                self.blocks.insert(height, block);
                true
            }
            _ => false,
        }
    }

    /// The next block to apply on top of `local`, if it has arrived.
    pub fn next_block(&mut self, local: u32) -> Option<Block> {
        let block = self.blocks.remove(&(local + 1))?;
        self.agreed.remove(&(local + 1));
        self.requested.remove(&(local + 1));
        Some(block)
    }
}
