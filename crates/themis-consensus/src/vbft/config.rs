// VBFT chain configuration snapshot.
//
// SAFETY INVARIANTS:
// 1. A ChainConfig never changes once built; rotation replaces it whole
// 2. Every entry of `pos_table` indexes into `peers`
// 3. The encoding is canonical so `hash()` agrees on every node

use std::time::Duration;
use themis_core::{CodecError, CodecResult, Decode, Encode, Sink, Source};
use themis_crypto::{sha256d, Hash256, PublicKey};

/// A committee member: its governance index and public identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub index: u32,
    pub id: PublicKey,
}

impl PeerConfig {
    pub fn from_hex(index: u32, id: &str) -> Result<Self, themis_crypto::CryptoError> {
        Ok(PeerConfig {
            index,
            id: PublicKey::from_hex(id)?,
        })
    }
}

impl Encode for PeerConfig {
    fn encode(&self, sink: &mut Sink) {
        sink.write_u32(self.index);
        sink.write_public_key(&self.id);
    }
}

impl Decode for PeerConfig {
    fn decode(source: &mut Source<'_>) -> CodecResult<Self> {
        Ok(PeerConfig {
            index: source.read_u32()?,
            id: source.read_public_key()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainConfig {
    pub version: u32,
    /// Governance view this snapshot belongs to.
    pub view: u32,
    pub n: u32,
    pub c: u32,
    pub block_msg_delay: Duration,
    pub hash_msg_delay: Duration,
    pub peer_handshake_timeout: Duration,
    /// Top-K peers, sorted by stake.
    pub peers: Vec<PeerConfig>,
    /// Stake-weighted roulette over positions in `peers`.
    pub pos_table: Vec<u32>,
    pub max_block_change_view: u32,
}

impl ChainConfig {
    pub fn hash(&self) -> Hash256 {
        sha256d(&self.to_bytes())
    }

    /// Endorse and commit quorum, `2C + 1`.
    pub fn quorum(&self) -> usize {
        2 * self.c as usize + 1
    }

    pub fn peer(&self, index: u32) -> Option<&PeerConfig> {
        self.peers.iter().find(|p| p.index == index)
    }

    pub fn index_of(&self, id: &PublicKey) -> Option<u32> {
        self.peers.iter().find(|p| p.id == *id).map(|p| p.index)
    }

    pub fn public_keys(&self) -> Vec<PublicKey> {
        self.peers.iter().map(|p| p.id.clone()).collect()
    }
}

fn write_duration(sink: &mut Sink, d: Duration) {
    sink.write_u64(d.as_millis() as u64);
}

fn read_duration(source: &mut Source<'_>) -> CodecResult<Duration> {
    Ok(Duration::from_millis(source.read_u64()?))
}

impl Encode for ChainConfig {
    fn encode(&self, sink: &mut Sink) {
        sink.write_u32(self.version);
        sink.write_u32(self.view);
        sink.write_u32(self.n);
        sink.write_u32(self.c);
        write_duration(sink, self.block_msg_delay);
        write_duration(sink, self.hash_msg_delay);
        write_duration(sink, self.peer_handshake_timeout);
        self.peers.encode(sink);
        sink.write_var_uint(self.pos_table.len() as u64);
        for pos in &self.pos_table {
            sink.write_u32(*pos);
        }
        sink.write_u32(self.max_block_change_view);
    }
}

impl Decode for ChainConfig {
    fn decode(source: &mut Source<'_>) -> CodecResult<Self> {
        let version = source.read_u32()?;
        let view = source.read_u32()?;
        let n = source.read_u32()?;
        let c = source.read_u32()?;
        let block_msg_delay = read_duration(source)?;
        let hash_msg_delay = read_duration(source)?;
        let peer_handshake_timeout = read_duration(source)?;
        let peers = Vec::<PeerConfig>::decode(source)?;
        let count = source.read_count(4)?;
        let mut pos_table = Vec::with_capacity(count);
        for _ in 0..count {
            let pos = source.read_u32()?;
            if pos as usize >= peers.len() {
                return Err(CodecError::Irregular(format!(
                    "position {} outside {} peers",
                    pos,
                    peers.len()
                )));
            }
            pos_table.push(pos);
        }
        Ok(ChainConfig {
            version,
            view,
            n,
            c,
            block_msg_delay,
            hash_msg_delay,
            peer_handshake_timeout,
            peers,
            pos_table,
            max_block_change_view: source.read_u32()?,
        })
    }
}
