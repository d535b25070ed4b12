// VBFT block pool: proposals, endorsements and commits per height.
//
// SAFETY INVARIANTS:
// 1. At most one proposal per (height, proposer); at most one endorsement
//    and one commit per (height, signer)
// 2. Stored signatures were verified by the server before insertion
// 3. Rounds below the committed height are purged on every seal

use std::collections::{BTreeMap, HashMap};
use themis_core::Block;
use themis_crypto::{Hash256, Signature};

use crate::vbft::block_info::VbftBlockInfo;

#[derive(Debug, Clone)]
pub struct Candidate {
    pub block: Block,
    pub info: VbftBlockInfo,
    pub hash: Hash256,
    /// Proposer rank for this height, 0 first.
    pub rank: usize,
    pub signature: Signature,
    /// Signed envelope as received, re-served on `ProposalFetch`.
    pub frame: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vote {
    pub proposer: u32,
    pub block_hash: Hash256,
    pub signature: Signature,
}

#[derive(Debug, Default)]
pub struct HeightRound {
    pub proposals: HashMap<u32, Candidate>,
    pub endorsements: HashMap<u32, Vote>,
    pub commits: HashMap<u32, Vote>,
    pub proposed: bool,
    pub endorsed: bool,
    pub committed: bool,
    /// Endorse deadline passed; proposals are endorsed on arrival.
    pub endorse_due: bool,
    pub proposal_fetched: bool,
}

fn quorum_of(votes: &HashMap<u32, Vote>, quorum: usize) -> Option<(u32, Hash256)> {
    let mut tally: HashMap<(u32, Hash256), usize> = HashMap::new();
    for vote in votes.values() {
        *tally.entry((vote.proposer, vote.block_hash)).or_insert(0) += 1;
    }
    let mut reached: Vec<(u32, Hash256)> = tally
        .into_iter()
        .filter(|(_, count)| *count >= quorum)
        .map(|(key, _)| key)
        .collect();
    reached.sort();
    reached.into_iter().next()
}

#[derive(Debug, Default)]
pub struct BlockPool {
    rounds: BTreeMap<u32, HeightRound>,
}

impl BlockPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn round(&mut self, height: u32) -> &mut HeightRound {
        self.rounds.entry(height).or_default()
    }

    pub fn get_round(&self, height: u32) -> Option<&HeightRound> {
        self.rounds.get(&height)
    }

    /// Returns false for a second proposal from the same proposer.
    pub fn add_proposal(&mut self, height: u32, proposer: u32, candidate: Candidate) -> bool {
        let round = self.round(height);
        if round.proposals.contains_key(&proposer) {
            return false;
        }
        round.proposals.insert(proposer, candidate);
        true
    }

    pub fn proposal(&self, height: u32, proposer: u32) -> Option<&Candidate> {
        self.rounds.get(&height)?.proposals.get(&proposer)
    }

    /// Lowest rank wins; equal ranks go to the lower block hash.
    pub fn best_proposal(&self, height: u32) -> Option<&Candidate> {
        self.rounds
            .get(&height)?
            .proposals
            .values()
            .min_by(|a, b| a.rank.cmp(&b.rank).then_with(|| a.hash.cmp(&b.hash)))
    }

    pub fn add_endorsement(&mut self, height: u32, endorser: u32, vote: Vote) -> bool {
        let round = self.round(height);
        if round.endorsements.contains_key(&endorser) {
            return false;
        }
        round.endorsements.insert(endorser, vote);
        true
    }

    pub fn add_commit(&mut self, height: u32, committer: u32, vote: Vote) -> bool {
        let round = self.round(height);
        if round.commits.contains_key(&committer) {
            return false;
        }
        round.commits.insert(committer, vote);
        true
    }

    pub fn endorsement_quorum(&self, height: u32, quorum: usize) -> Option<(u32, Hash256)> {
        quorum_of(&self.rounds.get(&height)?.endorsements, quorum)
    }

    pub fn commit_quorum(&self, height: u32, quorum: usize) -> Option<(u32, Hash256)> {
        quorum_of(&self.rounds.get(&height)?.commits, quorum)
    }

    /// Commit signatures for `(proposer, hash)`, ordered by committer index.
    pub fn commit_signatures(&self, height: u32, proposer: u32, hash: &Hash256) -> Vec<(u32, Signature)> {
        let Some(round) = self.rounds.get(&height) else {
            return Vec::new();
        };
        let mut sigs: Vec<(u32, Signature)> = round
            .commits
            .iter()
            .filter(|(_, v)| v.proposer == proposer && v.block_hash == *hash)
            .map(|(index, v)| (*index, v.signature))
            .collect();
        sigs.sort_by_key(|(index, _)| *index);
        sigs
    }

    pub fn purge_below(&mut self, height: u32) {
        self.rounds = self.rounds.split_off(&height);
    }

    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use themis_core::Address;
    use themis_crypto::sha256d;

    fn candidate(rank: usize, ts: u32) -> Candidate {
        let block = Block::new(Hash256::ZERO, Hash256::ZERO, ts, 1, 0, vec![], Address::ZERO, vec![]);
        Candidate {
            hash: block.hash(),
            block,
            info: VbftBlockInfo {
                proposer: rank as u32,
                vrf_value: vec![],
                vrf_proof: vec![],
                last_config_block_num: 0,
                new_chain_config: None,
            },
            rank,
            signature: Signature([0u8; 64]),
            frame: vec![],
        }
    }

    fn vote(proposer: u32, tag: &[u8]) -> Vote {
        Vote {
            proposer,
            block_hash: sha256d(tag),
            signature: Signature([1u8; 64]),
        }
    }

    #[test]
    fn test_best_proposal_prefers_rank_then_hash() {
        let mut pool = BlockPool::new();
        pool.add_proposal(1, 7, candidate(1, 10));
        assert_eq!(pool.best_proposal(1).map(|c| c.rank), Some(1));
        assert!(pool.add_proposal(1, 5, candidate(0, 11)));
        assert!(!pool.add_proposal(1, 5, candidate(0, 12)));
        assert_eq!(pool.best_proposal(1).map(|c| c.rank), Some(0));

        let mut tie = BlockPool::new();
        let (a, b) = (candidate(0, 20), candidate(0, 21));
        let lower = a.hash.min(b.hash);
        tie.add_proposal(2, 1, a);
        tie.add_proposal(2, 2, b);
        assert_eq!(tie.best_proposal(2).map(|c| c.hash), Some(lower));
    }

    #[test]
    fn test_quorums_count_matching_votes_only() {
        let mut pool = BlockPool::new();
        assert!(pool.add_endorsement(3, 1, vote(1, b"x")));
        assert!(!pool.add_endorsement(3, 1, vote(1, b"y")));
        pool.add_endorsement(3, 2, vote(1, b"x"));
        pool.add_endorsement(3, 3, vote(2, b"x"));
        assert_eq!(pool.endorsement_quorum(3, 3), None);
        pool.add_endorsement(3, 4, vote(1, b"x"));
        assert_eq!(pool.endorsement_quorum(3, 3), Some((1, sha256d(b"x"))));

        for i in [4, 1, 3] {
            pool.add_commit(3, i, vote(1, b"x"));
        }
        let sigs = pool.commit_signatures(3, 1, &sha256d(b"x"));
        let order: Vec<u32> = sigs.iter().map(|(i, _)| *i).collect();
        assert_eq!(order, vec![1, 3, 4]);
        assert!(pool.commit_quorum(3, 3).is_some());
    }

    #[test]
    fn test_purge_below() {
        let mut pool = BlockPool::new();
        for h in 1..=5 {
            pool.round(h).proposed = true;
        }
        pool.purge_below(4);
        assert_eq!(pool.len(), 2);
        assert!(pool.get_round(3).is_none());
        assert!(pool.get_round(4).is_some());
    }
}
