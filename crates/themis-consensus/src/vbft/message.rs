// VBFT sub-messages carried in `ConsensusPayload::data`.
//
// Inner header: `{ message_type: u8, block_num: u32 }`. Type bytes
// 0x10..=0x1F belong to VBFT.

use themis_core::{Block, CodecError, CodecResult, Decode, Encode, Sink, Source};
use themis_crypto::{Hash256, Signature};

pub const BLOCK_PROPOSAL: u8 = 0x10;
pub const BLOCK_ENDORSE: u8 = 0x11;
pub const BLOCK_COMMIT: u8 = 0x12;
pub const PEER_HANDSHAKE: u8 = 0x13;
pub const PEER_HEARTBEAT: u8 = 0x14;
pub const BLOCK_INFO_FETCH: u8 = 0x15;
pub const BLOCK_INFO_FETCH_RESP: u8 = 0x16;
pub const PROPOSAL_FETCH: u8 = 0x17;
pub const BLOCK_FETCH: u8 = 0x18;
pub const BLOCK_FETCH_RESP: u8 = 0x19;

/// Block infos returned per `BlockInfoFetch`.
pub const BLOCK_INFO_BATCH: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerHandshakeMsg {
    pub committed_block_num: u32,
    pub chain_config_view: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerHeartbeatMsg {
    pub committed_block_num: u32,
    pub chain_config_view: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VbftBody {
    /// Proposed block; VRF value and proof travel in the block info.
    BlockProposal { block: Block, signature: Signature },
    BlockEndorse {
        proposer: u32,
        block_hash: Hash256,
        signature: Signature,
    },
    BlockCommit {
        proposer: u32,
        block_hash: Hash256,
        signature: Signature,
    },
    PeerHandshake {
        msg: PeerHandshakeMsg,
        /// Transport address the sender listens on.
        address: String,
    },
    PeerHeartbeat(PeerHeartbeatMsg),
    BlockInfoFetch { start_block_num: u32 },
    BlockInfoFetchResp { infos: Vec<(u32, Hash256)> },
    ProposalFetch { proposer: u32 },
    BlockFetch { block_num: u32 },
    BlockFetchResp { block: Block },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VbftMessage {
    pub block_num: u32,
    pub body: VbftBody,
}

impl VbftMessage {
    pub fn new(block_num: u32, body: VbftBody) -> Self {
        VbftMessage { block_num, body }
    }

    pub fn message_type(&self) -> u8 {
        match self.body {
            VbftBody::BlockProposal { .. } => BLOCK_PROPOSAL,
            VbftBody::BlockEndorse { .. } => BLOCK_ENDORSE,
            VbftBody::BlockCommit { .. } => BLOCK_COMMIT,
            VbftBody::PeerHandshake { .. } => PEER_HANDSHAKE,
            VbftBody::PeerHeartbeat(_) => PEER_HEARTBEAT,
            VbftBody::BlockInfoFetch { .. } => BLOCK_INFO_FETCH,
            VbftBody::BlockInfoFetchResp { .. } => BLOCK_INFO_FETCH_RESP,
            VbftBody::ProposalFetch { .. } => PROPOSAL_FETCH,
            VbftBody::BlockFetch { .. } => BLOCK_FETCH,
            VbftBody::BlockFetchResp { .. } => BLOCK_FETCH_RESP,
        }
    }

    /// Proposal, endorse and commit messages take part in a height's round.
    pub fn is_consensus(&self) -> bool {
        matches!(
            self.body,
            VbftBody::BlockProposal { .. } | VbftBody::BlockEndorse { .. } | VbftBody::BlockCommit { .. }
        )
    }
}

impl Encode for VbftMessage {
    fn encode(&self, sink: &mut Sink) {
        sink.write_u8(self.message_type());
        sink.write_u32(self.block_num);
        match &self.body {
            VbftBody::BlockProposal { block, signature } => {
                block.encode(sink);
                sink.write_signature(signature);
            }
            VbftBody::BlockEndorse {
                proposer,
                block_hash,
                signature,
            }
            | VbftBody::BlockCommit {
                proposer,
                block_hash,
                signature,
            } => {
                sink.write_u32(*proposer);
                sink.write_hash(block_hash);
                sink.write_signature(signature);
            }
            VbftBody::PeerHandshake { msg, address } => {
                sink.write_u32(msg.committed_block_num);
                sink.write_u32(msg.chain_config_view);
                sink.write_string(address);
            }
            VbftBody::PeerHeartbeat(msg) => {
                sink.write_u32(msg.committed_block_num);
                sink.write_u32(msg.chain_config_view);
            }
            VbftBody::BlockInfoFetch { start_block_num } => sink.write_u32(*start_block_num),
            VbftBody::BlockInfoFetchResp { infos } => {
                sink.write_var_uint(infos.len() as u64);
                for (num, hash) in infos {
                    sink.write_u32(*num);
                    sink.write_hash(hash);
                }
            }
            VbftBody::ProposalFetch { proposer } => sink.write_u32(*proposer),
            VbftBody::BlockFetch { block_num } => sink.write_u32(*block_num),
            VbftBody::BlockFetchResp { block } => block.encode(sink),
        }
    }
}

impl Decode for VbftMessage {
    fn decode(source: &mut Source<'_>) -> CodecResult<Self> {
        let message_type = source.read_u8()?;
        let block_num = source.read_u32()?;
        let body = match message_type {
            BLOCK_PROPOSAL => VbftBody::BlockProposal {
                block: Block::decode(source)?,
                signature: source.read_signature()?,
            },
            BLOCK_ENDORSE => VbftBody::BlockEndorse {
                proposer: source.read_u32()?,
                block_hash: source.read_hash()?,
                signature: source.read_signature()?,
            },
            BLOCK_COMMIT => VbftBody::BlockCommit {
                proposer: source.read_u32()?,
                block_hash: source.read_hash()?,
                signature: source.read_signature()?,
            },
            PEER_HANDSHAKE => VbftBody::PeerHandshake {
                msg: PeerHandshakeMsg {
                    committed_block_num: source.read_u32()?,
                    chain_config_view: source.read_u32()?,
                },
                address: source.read_string()?,
            },
            PEER_HEARTBEAT => VbftBody::PeerHeartbeat(PeerHeartbeatMsg {
                committed_block_num: source.read_u32()?,
                chain_config_view: source.read_u32()?,
            }),
            BLOCK_INFO_FETCH => VbftBody::BlockInfoFetch {
                start_block_num: source.read_u32()?,
            },
            BLOCK_INFO_FETCH_RESP => {
                let count = source.read_count(4 + 32)?;
                if count > BLOCK_INFO_BATCH as usize {
                    return Err(CodecError::Irregular(format!("{} block infos in one response", count)));
                }
                let mut infos = Vec::with_capacity(count);
                for _ in 0..count {
                    infos.push((source.read_u32()?, source.read_hash()?));
                }
                VbftBody::BlockInfoFetchResp { infos }
            }
            PROPOSAL_FETCH => VbftBody::ProposalFetch {
                proposer: source.read_u32()?,
            },
            BLOCK_FETCH => VbftBody::BlockFetch {
                block_num: source.read_u32()?,
            },
            BLOCK_FETCH_RESP => VbftBody::BlockFetchResp {
                block: Block::decode(source)?,
            },
            other => {
                return Err(CodecError::Irregular(format!(
                    "unknown VBFT message type {:#04x}",
                    other
                )))
            }
        };
        Ok(VbftMessage { block_num, body })
    }
}
