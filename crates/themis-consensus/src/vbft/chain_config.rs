// CHAIN-CONFIG RESOLVER
// Builds the per-view committee snapshot and the per-height participant lists.
//
// SAFETY INVARIANTS:
// 1. Same inputs produce a byte-identical ChainConfig on every node
// 2. Shuffle inputs are compact JSON with a fixed field order, hashed with
//    FNV-1a-64
// 3. Every peer taken into the table holds at least one position
// 4. Participant lists never contain the same peer twice

use serde::Serialize;
use themis_crypto::{fnv64a, sha256, Hash256};

use crate::config::VbftParams;
use crate::engine::{ConsensusError, ConsensusResult};
use crate::vbft::config::{ChainConfig, PeerConfig};

/// An electable peer as read from governance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStake {
    pub index: u32,
    /// Hex public key; also the tie-break key when stakes are equal.
    pub id: String,
    pub stake: u64,
}

/// Proof-of-contribution winner folded into committee order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WinnerInfo {
    pub winner: String,
}

#[derive(Serialize)]
struct WinnerSeed<'a> {
    winner: &'a str,
    view: u32,
    index: usize,
}

#[derive(Serialize)]
struct PositionSeed<'a> {
    txid: &'a str,
    height: u32,
    node_id: &'a str,
    index: usize,
}

fn seed_hash<T: Serialize>(seed: &T) -> ConsensusResult<u64> {
    let bytes = serde_json::to_vec(seed)
        .map_err(|e| ConsensusError::Config(format!("shuffle seed: {}", e)))?;
    Ok(fnv64a(&bytes))
}

/// Select the top-K peers and lay out the stake-weighted position table.
///
/// Returns the selected peers (in table order) and the table itself, whose
/// entries index into that peer list.
pub fn position_table(
    stakes: &[PeerStake],
    k: u32,
    l: u32,
    view: u32,
    winner: Option<&WinnerInfo>,
    txid: &Hash256,
    height: u32,
) -> ConsensusResult<(Vec<PeerStake>, Vec<u32>)> {
    if l <= k {
        return Err(ConsensusError::Config(format!(
            "position table length L={} must exceed K={}",
            l, k
        )));
    }
    let k = k as usize;
    if stakes.len() < k {
        return Err(ConsensusError::Config(format!(
            "{} electable peers, need K={}",
            stakes.len(),
            k
        )));
    }

    let mut peers = stakes.to_vec();
    peers.sort_by(|a, b| b.stake.cmp(&a.stake).then_with(|| b.id.cmp(&a.id)));

    if let Some(winner) = winner {
        for i in (1..peers.len()).rev() {
            let j = seed_hash(&WinnerSeed {
                winner: &winner.winner,
                view,
                index: i,
            })? % i as u64;
            peers.swap(i, j as usize);
        }
    }
    peers.truncate(k);

    let total: u128 = peers.iter().map(|p| u128::from(p.stake)).sum();
    if total == 0 {
        return Err(ConsensusError::Config("selected peers hold no stake".into()));
    }
    let scale = u128::from(l) / k as u128 - 1;

    let mut table = Vec::new();
    for (pos, peer) in peers.iter().enumerate() {
        let weighted = u128::from(peer.stake) * scale * k as u128;
        let rank = ((weighted + total - 1) / total).max(1);
        table.extend(std::iter::repeat(pos as u32).take(rank as usize));
    }

    let txid = txid.to_hex();
    for i in (1..table.len()).rev() {
        let j = seed_hash(&PositionSeed {
            txid: &txid,
            height,
            node_id: &peers[table[i] as usize].id,
            index: i,
        })? % i as u64;
        table.swap(i, j as usize);
    }
    Ok((peers, table))
}

/// Build the chain config for `view` from governance stakes.
pub fn build_chain_config(
    params: &VbftParams,
    version: u32,
    view: u32,
    stakes: &[PeerStake],
    winner: Option<&WinnerInfo>,
    txid: &Hash256,
    height: u32,
) -> ConsensusResult<ChainConfig> {
    params.validate()?;
    let (selected, pos_table) = position_table(stakes, params.k, params.l, view, winner, txid, height)?;
    let peers = selected
        .iter()
        .map(|p| {
            PeerConfig::from_hex(p.index, &p.id)
                .map_err(|e| ConsensusError::Config(format!("peer {}: {}", p.index, e)))
        })
        .collect::<ConsensusResult<Vec<_>>>()?;
    for (i, a) in peers.iter().enumerate() {
        if peers[i + 1..].iter().any(|b| b.index == a.index || b.id == a.id) {
            return Err(ConsensusError::Config(format!("duplicate peer {}", a.index)));
        }
    }
    Ok(ChainConfig {
        version,
        view,
        n: params.n,
        c: params.c,
        block_msg_delay: params.block_msg_delay(),
        hash_msg_delay: params.hash_msg_delay(),
        peer_handshake_timeout: params.peer_handshake_timeout(),
        peers,
        pos_table,
        max_block_change_view: params.max_block_change_view,
    })
}

const PROPOSER_TAG: u8 = 0;
const ENDORSER_TAG: u8 = 1;
const COMMITTER_TAG: u8 = 2;

/// Peer indexes acting in each role for one height, best rank first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participants {
    pub proposers: Vec<u32>,
    pub endorsers: Vec<u32>,
    pub committers: Vec<u32>,
}

impl Participants {
    /// Proposer rank of `index`, 0 being the preferred proposer.
    pub fn proposer_rank(&self, index: u32) -> Option<usize> {
        self.proposers.iter().position(|p| *p == index)
    }

    pub fn is_endorser(&self, index: u32) -> bool {
        self.endorsers.contains(&index)
    }

    pub fn is_committer(&self, index: u32) -> bool {
        self.committers.contains(&index)
    }
}

fn draw(cfg: &ChainConfig, vrf_value: &[u8], tag: u8, count: usize) -> Vec<u32> {
    let count = count.min(cfg.peers.len());
    let mut out = Vec::with_capacity(count);
    if cfg.pos_table.is_empty() {
        return out;
    }
    let attempts = cfg.pos_table.len() * 4;
    for k in 0..attempts {
        if out.len() == count {
            return out;
        }
        let mut seed = Vec::with_capacity(vrf_value.len() + 5);
        seed.extend_from_slice(vrf_value);
        seed.push(tag);
        seed.extend_from_slice(&(k as u32).to_be_bytes());
        let digest = sha256(&seed);
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        let slot = (u64::from_be_bytes(head) % cfg.pos_table.len() as u64) as usize;
        let index = cfg.peers[cfg.pos_table[slot] as usize].index;
        if !out.contains(&index) {
            out.push(index);
        }
    }
    // unlucky draw: fill in table order
    for peer in &cfg.peers {
        if out.len() == count {
            break;
        }
        if !out.contains(&peer.index) {
            out.push(peer.index);
        }
    }
    out
}

/// Proposers (C+1), endorsers and committers (N each) for the height whose
/// parent carries `vrf_value`.
pub fn participants(cfg: &ChainConfig, vrf_value: &[u8]) -> Participants {
    Participants {
        proposers: draw(cfg, vrf_value, PROPOSER_TAG, cfg.c as usize + 1),
        endorsers: draw(cfg, vrf_value, ENDORSER_TAG, cfg.n as usize),
        committers: draw(cfg, vrf_value, COMMITTER_TAG, cfg.n as usize),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use themis_crypto::{sha256d, KeyPair};

    fn stake(index: u32, id: &str, stake: u64) -> PeerStake {
        PeerStake {
            index,
            id: id.to_string(),
            stake,
        }
    }

    fn keyed_stakes(n: u8) -> Vec<PeerStake> {
        (1..=n)
            .map(|i| {
                let pk = KeyPair::from_seed(&[i; 32]).unwrap().public().clone();
                stake(u32::from(i), &pk.to_hex(), 100 * u64::from(i))
            })
            .collect()
    }

    #[test]
    fn test_rejects_short_table_and_few_peers() {
        let stakes = vec![stake(1, "a", 1), stake(2, "b", 1)];
        assert!(position_table(&stakes, 2, 2, 1, None, &Hash256::ZERO, 1).is_err());
        assert!(position_table(&stakes, 3, 12, 1, None, &Hash256::ZERO, 1).is_err());
        let zero = vec![stake(1, "a", 0), stake(2, "b", 0)];
        assert!(matches!(
            position_table(&zero, 2, 8, 1, None, &Hash256::ZERO, 1),
            Err(ConsensusError::Config(_))
        ));
    }

    #[test]
    fn test_low_stake_keeps_one_position() {
        let stakes = vec![stake(1, "a", 1_000_000), stake(2, "b", 1)];
        let (peers, table) = position_table(&stakes, 2, 8, 1, None, &Hash256::ZERO, 1).unwrap();
        assert_eq!(peers[1].id, "b");
        assert_eq!(table.iter().filter(|p| **p == 1).count(), 1);
    }

    #[test]
    fn test_winner_reorders_committee() {
        let stakes: Vec<PeerStake> = (0..6).map(|i| stake(i, &format!("p{}", i), 10)).collect();
        let (plain, _) = position_table(&stakes, 6, 24, 1, None, &Hash256::ZERO, 1).unwrap();
        let winner = WinnerInfo {
            winner: "p3".into(),
        };
        let (shuffled, _) =
            position_table(&stakes, 6, 24, 1, Some(&winner), &Hash256::ZERO, 1).unwrap();
        let mut a: Vec<_> = plain.iter().map(|p| p.index).collect();
        let mut b: Vec<_> = shuffled.iter().map(|p| p.index).collect();
        assert_ne!(a, b);
        a.sort();
        b.sort();
        assert_eq!(a, b);
    }

    #[test]
    fn test_build_chain_config_is_deterministic() {
        let params = VbftParams::default();
        let stakes = keyed_stakes(4);
        let txid = sha256d(b"gov tx");
        let a = build_chain_config(&params, 1, 1, &stakes, None, &txid, 0).unwrap();
        let b = build_chain_config(&params, 1, 1, &stakes, None, &txid, 0).unwrap();
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.peers.len(), 4);
        assert_eq!(a.peers[0].index, 4);
        assert!(a.pos_table.iter().all(|p| (*p as usize) < a.peers.len()));
    }

    #[test]
    fn test_participants_are_distinct_and_sized() {
        let params = VbftParams::default();
        let cfg = build_chain_config(&params, 1, 1, &keyed_stakes(4), None, &Hash256::ZERO, 0).unwrap();
        for seed in 0..20u8 {
            let p = participants(&cfg, &[seed; 32]);
            assert_eq!(p.proposers.len(), 2);
            assert_eq!(p.endorsers.len(), 4);
            assert_eq!(p.committers.len(), 4);
            let mut e = p.endorsers.clone();
            e.sort();
            e.dedup();
            assert_eq!(e.len(), 4);
            assert_ne!(p.proposers[0], p.proposers[1]);
            assert_eq!(p.proposer_rank(p.proposers[1]), Some(1));
        }
        assert_eq!(participants(&cfg, b"vrf"), participants(&cfg, b"vrf"));
    }
}
