// Addresses and transactions.
//
// The consensus core treats transaction payloads as opaque. Only the
// identity hash, the payer and basic well-formedness are inspected.

use serde::{Deserialize, Serialize};
use std::fmt;
use themis_crypto::{sha256, sha256d, Hash256, PublicKey};

use crate::codec::{CodecResult, Decode, Encode, Sink, Source};

pub const ADDRESS_LENGTH: usize = 20;

/// Maximum opaque payload accepted by `Transaction::verify`.
pub const MAX_TX_PAYLOAD: usize = 64 * 1024;

/// A 20-byte account or multi-signature address.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(pub [u8; ADDRESS_LENGTH]);

impl Address {
    pub const ZERO: Address = Address([0u8; ADDRESS_LENGTH]);

    fn from_digest(digest: [u8; 32]) -> Self {
        let mut out = [0u8; ADDRESS_LENGTH];
        out.copy_from_slice(&digest[..ADDRESS_LENGTH]);
        Address(out)
    }

    /// Single-key address: first 20 bytes of `sha256(pk)`.
    pub fn from_public_key(pk: &PublicKey) -> Self {
        Self::from_digest(sha256(pk.as_bytes()))
    }

    /// Address of a bookkeeper set. Order-independent: keys are sorted first.
    pub fn from_bookkeepers(keys: &[PublicKey]) -> Self {
        let mut sorted: Vec<&PublicKey> = keys.iter().collect();
        sorted.sort();
        let mut sink = Sink::new();
        sink.write_var_uint(sorted.len() as u64);
        for pk in sorted {
            sink.write_public_key(pk);
        }
        Self::from_digest(sha256(&sink.into_bytes()))
    }

    /// Well-known governance contract address used for consensus storage keys.
    pub fn governance() -> Self {
        let mut out = [0u8; ADDRESS_LENGTH];
        out[ADDRESS_LENGTH - 1] = 0x07;
        Address(out)
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LENGTH] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_hex())
    }
}

impl Encode for Address {
    fn encode(&self, sink: &mut Sink) {
        sink.write_bytes(&self.0);
    }
}

impl Decode for Address {
    fn decode(source: &mut Source<'_>) -> CodecResult<Self> {
        let mut out = [0u8; ADDRESS_LENGTH];
        out.copy_from_slice(source.read_bytes(ADDRESS_LENGTH)?);
        Ok(Address(out))
    }
}

/// A ledger transaction with an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u8,
    pub nonce: u32,
    pub payer: Address,
    pub payload: Vec<u8>,
}

impl Transaction {
    pub fn new(nonce: u32, payer: Address, payload: Vec<u8>) -> Self {
        Transaction {
            version: 0,
            nonce,
            payer,
            payload,
        }
    }

    pub fn hash(&self) -> Hash256 {
        sha256d(&self.to_bytes())
    }

    /// Stateless validity check run before a transaction enters a block.
    pub fn verify(&self) -> Result<(), String> {
        if self.version != 0 {
            return Err(format!("unsupported transaction version {}", self.version));
        }
        if self.payer == Address::ZERO {
            return Err("missing payer".to_string());
        }
        if self.payload.len() > MAX_TX_PAYLOAD {
            return Err(format!("payload of {} bytes too large", self.payload.len()));
        }
        Ok(())
    }
}

impl Encode for Transaction {
    fn encode(&self, sink: &mut Sink) {
        sink.write_u8(self.version);
        sink.write_u32(self.nonce);
        self.payer.encode(sink);
        sink.write_var_bytes(&self.payload);
    }
}

impl Decode for Transaction {
    fn decode(source: &mut Source<'_>) -> CodecResult<Self> {
        Ok(Transaction {
            version: source.read_u8()?,
            nonce: source.read_u32()?,
            payer: Address::decode(source)?,
            payload: source.read_var_bytes()?.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use themis_crypto::KeyPair;

    #[test]
    fn test_bookkeeper_address_ignores_order() {
        let a = KeyPair::from_seed(&[1u8; 32]).unwrap().public().clone();
        let b = KeyPair::from_seed(&[2u8; 32]).unwrap().public().clone();
        let ab = Address::from_bookkeepers(&[a.clone(), b.clone()]);
        let ba = Address::from_bookkeepers(&[b.clone(), a.clone()]);
        assert_eq!(ab, ba);
        assert_ne!(ab, Address::from_bookkeepers(&[a.clone()]));
        assert_ne!(Address::from_public_key(&a), Address::from_public_key(&b));
    }

    #[test]
    fn test_transaction_verify() {
        let payer = Address([3u8; ADDRESS_LENGTH]);
        assert!(Transaction::new(1, payer, vec![1, 2, 3]).verify().is_ok());
        assert!(Transaction::new(1, Address::ZERO, vec![]).verify().is_err());
        assert!(Transaction::new(1, payer, vec![0u8; MAX_TX_PAYLOAD + 1]).verify().is_err());
    }

    #[test]
    fn test_transaction_hash_covers_nonce() {
        let payer = Address([3u8; ADDRESS_LENGTH]);
        let t1 = Transaction::new(1, payer, vec![9]);
        let t2 = Transaction::new(2, payer, vec![9]);
        assert_ne!(t1.hash(), t2.hash());
        assert_eq!(Transaction::from_bytes(&t1.to_bytes()).unwrap(), t1);
    }
}
