// Consensus envelope exchanged between validators.
//
// SAFETY INVARIANTS:
// 1. The envelope hash is sha256d over the unsigned encoding, which covers
//    every field except the signature; the signature always signs that hash
// 2. `data` is carried as opaque var-bytes so relayers forward it unparsed
// 3. On the wire every envelope is a single var-bytes frame; a frame with
//    trailing bytes or an irregular length is rejected

use themis_core::{CodecError, CodecResult, Decode, Encode, Sink, Source};
use themis_crypto::{sha256d, Hash256, KeyPair, PublicKey, Signature};

use crate::engine::{ConsensusError, ConsensusResult};

pub const PAYLOAD_VERSION: u32 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusPayload {
    pub version: u32,
    pub prev_hash: Hash256,
    pub height: u32,
    pub bookkeeper_index: u16,
    pub timestamp: u32,
    pub data: Vec<u8>,
    pub owner: PublicKey,
    pub signature: Signature,
}

impl ConsensusPayload {
    /// Build and sign an envelope with `keypair` as owner.
    pub fn new_signed(
        keypair: &KeyPair,
        prev_hash: Hash256,
        height: u32,
        bookkeeper_index: u16,
        timestamp: u32,
        data: Vec<u8>,
    ) -> Self {
        let mut payload = ConsensusPayload {
            version: PAYLOAD_VERSION,
            prev_hash,
            height,
            bookkeeper_index,
            timestamp,
            data,
            owner: keypair.public().clone(),
            signature: Signature([0u8; 64]),
        };
        payload.signature = keypair.sign(payload.hash().as_bytes());
        payload
    }

    fn encode_unsigned(&self, sink: &mut Sink) {
        sink.write_u32(self.version);
        sink.write_hash(&self.prev_hash);
        sink.write_u32(self.height);
        sink.write_u16(self.bookkeeper_index);
        sink.write_u32(self.timestamp);
        sink.write_var_bytes(&self.data);
        sink.write_public_key(&self.owner);
    }

    pub fn hash(&self) -> Hash256 {
        let mut sink = Sink::with_capacity(128 + self.data.len());
        self.encode_unsigned(&mut sink);
        sha256d(&sink.into_bytes())
    }

    /// Check the owner's signature over the envelope hash.
    pub fn verify(&self) -> ConsensusResult<()> {
        if self.version != PAYLOAD_VERSION {
            return Err(ConsensusError::Auth(format!(
                "unsupported payload version {}",
                self.version
            )));
        }
        if !self.owner.verify(self.hash().as_bytes(), &self.signature) {
            return Err(ConsensusError::Auth(format!(
                "bad envelope signature from bookkeeper {}",
                self.bookkeeper_index
            )));
        }
        Ok(())
    }

    /// Length-prefixed frame sent over the P2P layer.
    pub fn to_wire(&self) -> Vec<u8> {
        let body = self.to_bytes();
        let mut sink = Sink::with_capacity(body.len() + 5);
        sink.write_var_bytes(&body);
        sink.into_bytes()
    }

    pub fn from_wire(frame: &[u8]) -> ConsensusResult<Self> {
        let mut source = Source::new(frame);
        let body = source.read_var_bytes()?;
        if !source.is_empty() {
            return Err(CodecError::Irregular(format!(
                "{} bytes after envelope frame",
                source.remaining()
            ))
            .into());
        }
        Ok(Self::from_bytes(body)?)
    }
}

impl Encode for ConsensusPayload {
    fn encode(&self, sink: &mut Sink) {
        self.encode_unsigned(sink);
        sink.write_signature(&self.signature);
    }
}

impl Decode for ConsensusPayload {
    fn decode(source: &mut Source<'_>) -> CodecResult<Self> {
        Ok(ConsensusPayload {
            version: source.read_u32()?,
            prev_hash: source.read_hash()?,
            height: source.read_u32()?,
            bookkeeper_index: source.read_u16()?,
            timestamp: source.read_u32()?,
            data: source.read_var_bytes()?.to_vec(),
            owner: source.read_public_key()?,
            signature: source.read_signature()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (KeyPair, ConsensusPayload) {
        let kp = KeyPair::from_seed(&[3u8; 32]).unwrap();
        let p = ConsensusPayload::new_signed(&kp, sha256d(b"prev"), 9, 2, 1_700_000_000, vec![1, 2, 3]);
        (kp, p)
    }

    #[test]
    fn test_signed_payload_verifies() {
        let (_, p) = sample();
        assert!(p.verify().is_ok());
    }

    #[test]
    fn test_any_field_change_breaks_signature() {
        let (_, p) = sample();
        let mut tampered = p.clone();
        tampered.height += 1;
        assert!(matches!(tampered.verify(), Err(ConsensusError::Auth(_))));

        let mut tampered = p.clone();
        tampered.data.push(0);
        assert!(tampered.verify().is_err());

        let mut tampered = p;
        tampered.owner = KeyPair::from_seed(&[4u8; 32]).unwrap().public().clone();
        assert!(tampered.verify().is_err());
    }

    #[test]
    fn test_wire_frame() {
        let (_, p) = sample();
        let frame = p.to_wire();
        let back = ConsensusPayload::from_wire(&frame).unwrap();
        assert_eq!(back, p);
        assert_eq!(back.hash(), p.hash());

        let mut trailing = frame.clone();
        trailing.push(0);
        assert!(matches!(
            ConsensusPayload::from_wire(&trailing),
            Err(ConsensusError::Decode(CodecError::Irregular(_)))
        ));
        assert!(matches!(
            ConsensusPayload::from_wire(&frame[..frame.len() - 1]),
            Err(ConsensusError::Decode(CodecError::Truncated))
        ));
    }
}
