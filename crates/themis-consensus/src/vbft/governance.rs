// Governance storage records read by the VBFT chain-config resolver.
//
// All records live under `Address::governance()` and use the ledger codec.
//
// SAFETY INVARIANTS:
// 1. Readers never mutate storage; only genesis seeding and governance
//    transactions write these keys
// 2. The same ledger state yields the same stake list on every node

use themis_core::{Address, CodecError, CodecResult, Decode, Encode, Ledger, Sink, Source};
use themis_crypto::{Hash256, PublicKey};

use crate::config::VbftParams;
use crate::engine::{ConsensusError, ConsensusResult};
use crate::vbft::chain_config::{PeerStake, WinnerInfo};

pub const GOV_VIEW: &[u8] = b"govView";
pub const PEER_POOL: &[u8] = b"peerPool";
pub const PRE_CONFIG: &[u8] = b"preConfig";
pub const CONS_GROUP_INFO: &[u8] = b"consGroupInfo";
pub const VBFT_CONFIG: &[u8] = b"vbftConfig";
pub const WINNER_INFO: &[u8] = b"winnerInfo";

/// First governance view of a fresh chain.
pub const GENESIS_VIEW: u32 = 1;

/// `prefix ‖ view (u32 LE)`.
pub fn key_with_view(prefix: &[u8], view: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 4);
    key.extend_from_slice(prefix);
    key.extend_from_slice(&view.to_le_bytes());
    key
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GovernanceView {
    pub view: u32,
    /// Height at which the view took effect.
    pub height: u32,
    pub tx_hash: Hash256,
}

impl Encode for GovernanceView {
    fn encode(&self, sink: &mut Sink) {
        sink.write_u32(self.view);
        sink.write_u32(self.height);
        sink.write_hash(&self.tx_hash);
    }
}

impl Decode for GovernanceView {
    fn decode(source: &mut Source<'_>) -> CodecResult<Self> {
        Ok(GovernanceView {
            view: source.read_u32()?,
            height: source.read_u32()?,
            tx_hash: source.read_hash()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    RegisterCandidate = 0,
    Candidate = 1,
    Consensus = 2,
    QuitConsensus = 3,
    Quitting = 4,
    Blacklisted = 5,
}

impl PeerStatus {
    fn from_u8(v: u8) -> CodecResult<Self> {
        Ok(match v {
            0 => PeerStatus::RegisterCandidate,
            1 => PeerStatus::Candidate,
            2 => PeerStatus::Consensus,
            3 => PeerStatus::QuitConsensus,
            4 => PeerStatus::Quitting,
            5 => PeerStatus::Blacklisted,
            other => return Err(CodecError::Irregular(format!("peer status {}", other))),
        })
    }

    /// Eligible for a committee seat.
    pub fn is_electable(self) -> bool {
        matches!(self, PeerStatus::Candidate | PeerStatus::Consensus)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStakeInfo {
    pub index: u32,
    /// Hex-encoded public key.
    pub peer_pubkey: String,
    pub address: Address,
    pub status: PeerStatus,
    pub init_pos: u64,
    pub total_pos: u64,
    pub in_consensus_group: bool,
}

impl PeerStakeInfo {
    pub fn stake(&self) -> u64 {
        self.init_pos.saturating_add(self.total_pos)
    }
}

impl Encode for PeerStakeInfo {
    fn encode(&self, sink: &mut Sink) {
        sink.write_u32(self.index);
        sink.write_string(&self.peer_pubkey);
        self.address.encode(sink);
        sink.write_u8(self.status as u8);
        sink.write_u64(self.init_pos);
        sink.write_u64(self.total_pos);
        sink.write_bool(self.in_consensus_group);
    }
}

impl Decode for PeerStakeInfo {
    fn decode(source: &mut Source<'_>) -> CodecResult<Self> {
        Ok(PeerStakeInfo {
            index: source.read_u32()?,
            peer_pubkey: source.read_string()?,
            address: Address::decode(source)?,
            status: PeerStatus::from_u8(source.read_u8()?)?,
            init_pos: source.read_u64()?,
            total_pos: source.read_u64()?,
            in_consensus_group: source.read_bool()?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerPoolMap {
    pub items: Vec<PeerStakeInfo>,
}

impl Encode for PeerPoolMap {
    fn encode(&self, sink: &mut Sink) {
        self.items.encode(sink);
    }
}

impl Decode for PeerPoolMap {
    fn decode(source: &mut Source<'_>) -> CodecResult<Self> {
        Ok(PeerPoolMap {
            items: Vec::<PeerStakeInfo>::decode(source)?,
        })
    }
}

/// Stored VBFT parameters plus the genesis VRF seed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VbftConfigRecord {
    pub params: VbftParams,
    pub vrf_value: Vec<u8>,
    pub vrf_proof: Vec<u8>,
}

impl Encode for VbftConfigRecord {
    fn encode(&self, sink: &mut Sink) {
        let p = &self.params;
        sink.write_u32(p.n);
        sink.write_u32(p.c);
        sink.write_u32(p.k);
        sink.write_u32(p.l);
        sink.write_u64(p.block_msg_delay_ms);
        sink.write_u64(p.hash_msg_delay_ms);
        sink.write_u64(p.peer_handshake_timeout_secs);
        sink.write_u32(p.max_block_change_view);
        sink.write_var_bytes(&self.vrf_value);
        sink.write_var_bytes(&self.vrf_proof);
    }
}

impl Decode for VbftConfigRecord {
    fn decode(source: &mut Source<'_>) -> CodecResult<Self> {
        let params = VbftParams {
            n: source.read_u32()?,
            c: source.read_u32()?,
            k: source.read_u32()?,
            l: source.read_u32()?,
            block_msg_delay_ms: source.read_u64()?,
            hash_msg_delay_ms: source.read_u64()?,
            peer_handshake_timeout_secs: source.read_u64()?,
            max_block_change_view: source.read_u32()?,
        };
        Ok(VbftConfigRecord {
            params,
            vrf_value: source.read_var_bytes()?.to_vec(),
            vrf_proof: source.read_var_bytes()?.to_vec(),
        })
    }
}

/// Parameters scheduled to take effect at `set_view`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreConfig {
    pub config: VbftConfigRecord,
    pub set_view: u32,
}

impl Encode for PreConfig {
    fn encode(&self, sink: &mut Sink) {
        self.config.encode(sink);
        sink.write_u32(self.set_view);
    }
}

impl Decode for PreConfig {
    fn decode(source: &mut Source<'_>) -> CodecResult<Self> {
        Ok(PreConfig {
            config: VbftConfigRecord::decode(source)?,
            set_view: source.read_u32()?,
        })
    }
}

/// Public keys elected into the consensus group of a view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsGroupInfo {
    pub pubkeys: Vec<PublicKey>,
}

impl Encode for ConsGroupInfo {
    fn encode(&self, sink: &mut Sink) {
        self.pubkeys.encode(sink);
    }
}

impl Decode for ConsGroupInfo {
    fn decode(source: &mut Source<'_>) -> CodecResult<Self> {
        Ok(ConsGroupInfo {
            pubkeys: Vec::<PublicKey>::decode(source)?,
        })
    }
}

impl Encode for WinnerInfo {
    fn encode(&self, sink: &mut Sink) {
        sink.write_string(&self.winner);
    }
}

impl Decode for WinnerInfo {
    fn decode(source: &mut Source<'_>) -> CodecResult<Self> {
        Ok(WinnerInfo {
            winner: source.read_string()?,
        })
    }
}

fn read_record<T: Decode>(ledger: &dyn Ledger, key: &[u8]) -> ConsensusResult<Option<T>> {
    match ledger.get_storage_item(&Address::governance(), key)? {
        Some(bytes) => Ok(Some(T::from_bytes(&bytes).map_err(|e| {
            ConsensusError::Config(format!(
                "governance record {}: {}",
                String::from_utf8_lossy(key),
                e
            ))
        })?)),
        None => Ok(None),
    }
}

pub fn read_governance_view(ledger: &dyn Ledger) -> ConsensusResult<Option<GovernanceView>> {
    read_record(ledger, GOV_VIEW)
}

pub fn read_vbft_config(ledger: &dyn Ledger) -> ConsensusResult<Option<VbftConfigRecord>> {
    read_record(ledger, VBFT_CONFIG)
}

pub fn read_pre_config(ledger: &dyn Ledger) -> ConsensusResult<Option<PreConfig>> {
    read_record(ledger, PRE_CONFIG)
}

pub fn read_peer_pool(ledger: &dyn Ledger, view: u32) -> ConsensusResult<Option<PeerPoolMap>> {
    read_record(ledger, &key_with_view(PEER_POOL, view))
}

pub fn read_cons_group(ledger: &dyn Ledger, view: u32) -> ConsensusResult<Option<ConsGroupInfo>> {
    read_record(ledger, &key_with_view(CONS_GROUP_INFO, view))
}

/// Election winner recorded for `view`, if the election produced one.
pub fn read_winner_info(ledger: &dyn Ledger, view: u32) -> ConsensusResult<Option<WinnerInfo>> {
    read_record(ledger, &key_with_view(WINNER_INFO, view))
}

/// A view ends its governance period once the next period's consensus
/// group has been elected and stored.
pub fn is_period_end(ledger: &dyn Ledger, view: u32) -> ConsensusResult<bool> {
    Ok(ledger
        .get_storage_item(&Address::governance(), &key_with_view(CONS_GROUP_INFO, view + 1))?
        .is_some())
}

/// VBFT parameters in force for `view`: a matching pre-config wins over the
/// stored config.
pub fn effective_params(ledger: &dyn Ledger, view: u32) -> ConsensusResult<Option<VbftConfigRecord>> {
    if let Some(pre) = read_pre_config(ledger)? {
        if pre.set_view == view {
            return Ok(Some(pre.config));
        }
    }
    read_vbft_config(ledger)
}

/// Electable peers of `view` with their stakes.
///
/// Peers must be Candidate or Consensus. Membership normally comes from the
/// consensus-group bit; at the end of a governance period it comes from the
/// next period's consensus-group list instead.
pub fn read_peer_stakes(
    ledger: &dyn Ledger,
    view: u32,
    period_end: bool,
) -> ConsensusResult<Vec<PeerStake>> {
    let pool = read_peer_pool(ledger, view)?
        .ok_or_else(|| ConsensusError::Config(format!("no peer pool for view {}", view)))?;
    let next_group = if period_end {
        read_cons_group(ledger, view + 1)?
    } else {
        None
    };

    let mut stakes = Vec::new();
    for item in pool.items {
        if !item.status.is_electable() {
            continue;
        }
        let member = match &next_group {
            Some(group) => group.pubkeys.iter().any(|pk| pk.to_hex() == item.peer_pubkey),
            None => item.in_consensus_group,
        };
        if member {
            stakes.push(PeerStake {
                index: item.index,
                id: item.peer_pubkey.clone(),
                stake: item.stake(),
            });
        }
    }
    Ok(stakes)
}

/// Storage items seeding governance for a fresh chain: view 1, the peer
/// pool with every listed key in the consensus group, and the VBFT config.
pub fn genesis_storage(
    params: &VbftParams,
    vrf_value: Vec<u8>,
    vrf_proof: Vec<u8>,
    peers: &[(PublicKey, u64)],
) -> Vec<(Address, Vec<u8>, Vec<u8>)> {
    let gov = Address::governance();
    let view = GovernanceView {
        view: GENESIS_VIEW,
        height: 0,
        tx_hash: Hash256::ZERO,
    };
    let pool = PeerPoolMap {
        items: peers
            .iter()
            .enumerate()
            .map(|(i, (pk, stake))| PeerStakeInfo {
                index: i as u32 + 1,
                peer_pubkey: pk.to_hex(),
                address: Address::from_public_key(pk),
                status: PeerStatus::Consensus,
                init_pos: *stake,
                total_pos: 0,
                in_consensus_group: true,
            })
            .collect(),
    };
    let record = VbftConfigRecord {
        params: params.clone(),
        vrf_value,
        vrf_proof,
    };
    vec![
        (gov, GOV_VIEW.to_vec(), view.to_bytes()),
        (gov, key_with_view(PEER_POOL, GENESIS_VIEW), pool.to_bytes()),
        (gov, VBFT_CONFIG.to_vec(), record.to_bytes()),
    ]
}
