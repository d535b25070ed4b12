use serde::{Deserialize, Serialize};
use themis_crypto::{sha256d, Hash256, PublicKey, Signature};

use crate::codec::{CodecError, CodecResult, Decode, Encode, Sink, Source};
use crate::merkle_tree::compute_merkle_root;
use crate::transaction::{Address, Transaction};

/// Block header.
///
/// SAFETY INVARIANTS:
/// 1. The header hash covers only the unsigned fields; `bookkeepers` and
///    `sig_data` are appended after consensus and never change the hash
/// 2. `bookkeepers.len() == sig_data.len()`; entry i of `sig_data` is the
///    signature of `bookkeepers[i]` over the header hash
/// 3. `transactions_root` is the Merkle root of the block's transaction hashes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub version: u32,
    pub prev_block_hash: Hash256,
    pub transactions_root: Hash256,
    /// Accumulated root over all transaction roots up to this block.
    pub block_root: Hash256,
    /// Seconds since the Unix epoch.
    pub timestamp: u32,
    pub height: u32,
    /// DBFT nonce; unused by VBFT.
    pub consensus_data: u64,
    /// Engine-specific payload (VBFT block info).
    pub consensus_payload: Vec<u8>,
    pub next_bookkeeper: Address,

    pub bookkeepers: Vec<PublicKey>,
    pub sig_data: Vec<Signature>,
}

impl Header {
    pub fn encode_unsigned(&self, sink: &mut Sink) {
        sink.write_u32(self.version);
        sink.write_hash(&self.prev_block_hash);
        sink.write_hash(&self.transactions_root);
        sink.write_hash(&self.block_root);
        sink.write_u32(self.timestamp);
        sink.write_u32(self.height);
        sink.write_u64(self.consensus_data);
        sink.write_var_bytes(&self.consensus_payload);
        self.next_bookkeeper.encode(sink);
    }

    pub fn hash(&self) -> Hash256 {
        let mut sink = Sink::with_capacity(256);
        self.encode_unsigned(&mut sink);
        sha256d(&sink.into_bytes())
    }

    /// Verify every attached bookkeeper signature against the header hash.
    pub fn verify_signatures(&self) -> bool {
        if self.bookkeepers.len() != self.sig_data.len() {
            return false;
        }
        let hash = self.hash();
        self.bookkeepers
            .iter()
            .zip(self.sig_data.iter())
            .all(|(pk, sig)| pk.verify(hash.as_bytes(), sig))
    }
}

impl Encode for Header {
    fn encode(&self, sink: &mut Sink) {
        self.encode_unsigned(sink);
        self.bookkeepers.encode(sink);
        self.sig_data.encode(sink);
    }
}

impl Decode for Header {
    fn decode(source: &mut Source<'_>) -> CodecResult<Self> {
        let header = Header {
            version: source.read_u32()?,
            prev_block_hash: source.read_hash()?,
            transactions_root: source.read_hash()?,
            block_root: source.read_hash()?,
            timestamp: source.read_u32()?,
            height: source.read_u32()?,
            consensus_data: source.read_u64()?,
            consensus_payload: source.read_var_bytes()?.to_vec(),
            next_bookkeeper: Address::decode(source)?,
            bookkeepers: Vec::<PublicKey>::decode(source)?,
            sig_data: Vec::<Signature>::decode(source)?,
        };
        if header.bookkeepers.len() != header.sig_data.len() {
            return Err(CodecError::Irregular(format!(
                "{} bookkeepers but {} signatures",
                header.bookkeepers.len(),
                header.sig_data.len()
            )));
        }
        Ok(header)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Assemble an unsigned block; the transaction root is derived from `transactions`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        prev_block_hash: Hash256,
        block_root: Hash256,
        timestamp: u32,
        height: u32,
        consensus_data: u64,
        consensus_payload: Vec<u8>,
        next_bookkeeper: Address,
        transactions: Vec<Transaction>,
    ) -> Self {
        let header = Header {
            version: 0,
            prev_block_hash,
            transactions_root: Self::transactions_root_of(&transactions),
            block_root,
            timestamp,
            height,
            consensus_data,
            consensus_payload,
            next_bookkeeper,
            bookkeepers: Vec::new(),
            sig_data: Vec::new(),
        };
        Block {
            header,
            transactions,
        }
    }

    pub fn transactions_root_of(transactions: &[Transaction]) -> Hash256 {
        let hashes: Vec<Hash256> = transactions.iter().map(Transaction::hash).collect();
        compute_merkle_root(&hashes)
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn height(&self) -> u32 {
        self.header.height
    }

    /// Attach the finalizing signatures (in bookkeeper order).
    pub fn set_signatures(&mut self, signers: Vec<(PublicKey, Signature)>) {
        let (bookkeepers, sigs) = signers.into_iter().unzip();
        self.header.bookkeepers = bookkeepers;
        self.header.sig_data = sigs;
    }

    /// Structural checks that do not need ledger state.
    pub fn verify_structure(&self) -> Result<(), String> {
        let root = Self::transactions_root_of(&self.transactions);
        if root != self.header.transactions_root {
            return Err(format!(
                "transactions root mismatch: header {} computed {}",
                self.header.transactions_root, root
            ));
        }
        for tx in &self.transactions {
            tx.verify()?;
        }
        Ok(())
    }
}

impl Encode for Block {
    fn encode(&self, sink: &mut Sink) {
        self.header.encode(sink);
        self.transactions.encode(sink);
    }
}

impl Decode for Block {
    fn decode(source: &mut Source<'_>) -> CodecResult<Self> {
        Ok(Block {
            header: Header::decode(source)?,
            transactions: Vec::<Transaction>::decode(source)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use themis_crypto::KeyPair;

    fn sample_block() -> Block {
        let payer = Address([5u8; 20]);
        Block::new(
            sha256d(b"parent"),
            Hash256::ZERO,
            1_700_000_000,
            3,
            42,
            vec![1, 2, 3],
            Address([9u8; 20]),
            vec![
                Transaction::new(1, payer, vec![1]),
                Transaction::new(2, payer, vec![2]),
            ],
        )
    }

    #[test]
    fn test_signatures_do_not_change_hash() {
        let mut block = sample_block();
        let before = block.hash();
        let kp = KeyPair::from_seed(&[1u8; 32]).unwrap();
        let sig = kp.sign(before.as_bytes());
        block.set_signatures(vec![(kp.public().clone(), sig)]);
        assert_eq!(block.hash(), before);
        assert!(block.header.verify_signatures());
    }

    #[test]
    fn test_bad_signature_is_detected() {
        let mut block = sample_block();
        let kp = KeyPair::from_seed(&[1u8; 32]).unwrap();
        let sig = kp.sign(b"not the header");
        block.set_signatures(vec![(kp.public().clone(), sig)]);
        assert!(!block.header.verify_signatures());
    }

    #[test]
    fn test_block_decode_preserves_fields() {
        let mut block = sample_block();
        let kp = KeyPair::from_seed(&[2u8; 32]).unwrap();
        let sig = kp.sign(block.hash().as_bytes());
        block.set_signatures(vec![(kp.public().clone(), sig)]);
        let bytes = block.to_bytes();
        let decoded = Block::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, block);
        assert!(decoded.verify_structure().is_ok());
    }

    #[test]
    fn test_tampered_transactions_fail_structure_check() {
        let mut block = sample_block();
        block.transactions.pop();
        assert!(block.verify_structure().is_err());
    }

    #[test]
    fn test_signed_block_json_roundtrip() {
        let mut block = sample_block();
        let kp = KeyPair::from_seed(&[3u8; 32]).unwrap();
        let sig = kp.sign(block.hash().as_bytes());
        block.set_signatures(vec![(kp.public().clone(), sig)]);
        let json = serde_json::to_string(&block).unwrap();
        let back: Block = serde_json::from_str(&json).unwrap();
        assert_eq!(back, block);
        assert!(back.header.verify_signatures());
    }
}
