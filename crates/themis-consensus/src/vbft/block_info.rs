// VBFT block info carried in `Header::consensus_payload`, plus the VRF
// chaining helpers.
//
// SAFETY INVARIANTS:
// 1. The VRF input for height h is compact JSON
//    `{"block_num":h,"prev_vrf":"<lower hex>"}` in that field order
// 2. prev_vrf is the VRF value of block h-1; for h = 1 it is the genesis
//    value from the VBFT config

use serde::Serialize;
use themis_core::{Block, CodecResult, Decode, Encode, Sink, Source};
use themis_crypto::{vrf_prove, vrf_verify, KeyPair, PublicKey};

use crate::engine::{ConsensusError, ConsensusResult};
use crate::vbft::config::ChainConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VbftBlockInfo {
    pub proposer: u32,
    pub vrf_value: Vec<u8>,
    pub vrf_proof: Vec<u8>,
    /// Height of the block that installed the chain config in force.
    pub last_config_block_num: u32,
    pub new_chain_config: Option<ChainConfig>,
}

impl VbftBlockInfo {
    pub fn of_block(block: &Block) -> ConsensusResult<Self> {
        Ok(Self::from_bytes(&block.header.consensus_payload)?)
    }
}

impl Encode for VbftBlockInfo {
    fn encode(&self, sink: &mut Sink) {
        sink.write_u32(self.proposer);
        sink.write_var_bytes(&self.vrf_value);
        sink.write_var_bytes(&self.vrf_proof);
        sink.write_u32(self.last_config_block_num);
        match &self.new_chain_config {
            Some(cfg) => {
                sink.write_bool(true);
                cfg.encode(sink);
            }
            None => sink.write_bool(false),
        }
    }
}

impl Decode for VbftBlockInfo {
    fn decode(source: &mut Source<'_>) -> CodecResult<Self> {
        let proposer = source.read_u32()?;
        let vrf_value = source.read_var_bytes()?.to_vec();
        let vrf_proof = source.read_var_bytes()?.to_vec();
        let last_config_block_num = source.read_u32()?;
        let new_chain_config = if source.read_bool()? {
            Some(ChainConfig::decode(source)?)
        } else {
            None
        };
        Ok(VbftBlockInfo {
            proposer,
            vrf_value,
            vrf_proof,
            last_config_block_num,
            new_chain_config,
        })
    }
}

#[derive(Serialize)]
struct VrfInput {
    block_num: u32,
    prev_vrf: String,
}

/// Canonical VRF input for `block_num`.
pub fn vrf_input(block_num: u32, prev_vrf: &[u8]) -> ConsensusResult<Vec<u8>> {
    serde_json::to_vec(&VrfInput {
        block_num,
        prev_vrf: hex::encode(prev_vrf),
    })
    .map_err(|e| ConsensusError::Config(format!("vrf input: {}", e)))
}

/// `(value, proof)` for `block_num` chained on `prev_vrf`.
pub fn compute_vrf(
    keypair: &KeyPair,
    block_num: u32,
    prev_vrf: &[u8],
) -> ConsensusResult<(Vec<u8>, Vec<u8>)> {
    Ok(vrf_prove(keypair, &vrf_input(block_num, prev_vrf)?))
}

pub fn verify_vrf(
    public_key: &PublicKey,
    block_num: u32,
    prev_vrf: &[u8],
    value: &[u8],
    proof: &[u8],
) -> bool {
    match vrf_input(block_num, prev_vrf) {
        Ok(input) => vrf_verify(public_key, &input, value, proof),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vrf_input_layout() {
        let input = vrf_input(5, &[0xAB, 0x01]).unwrap();
        assert_eq!(input, br#"{"block_num":5,"prev_vrf":"ab01"}"#.to_vec());
    }

    #[test]
    fn test_block_info_decode() {
        let info = VbftBlockInfo {
            proposer: 3,
            vrf_value: vec![1; 32],
            vrf_proof: vec![2; 64],
            last_config_block_num: 0,
            new_chain_config: None,
        };
        assert_eq!(VbftBlockInfo::from_bytes(&info.to_bytes()).unwrap(), info);
        let mut bytes = info.to_bytes();
        bytes.push(0);
        assert!(VbftBlockInfo::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_vrf_chain_verifies() {
        let kp = KeyPair::from_seed(&[9u8; 32]).unwrap();
        let (value, proof) = compute_vrf(&kp, 2, &[0u8; 32]).unwrap();
        assert!(verify_vrf(kp.public(), 2, &[0u8; 32], &value, &proof));
        assert!(!verify_vrf(kp.public(), 3, &[0u8; 32], &value, &proof));
    }
}
