use serde::{Deserialize, Serialize};
use std::fmt;
use themis_crypto::PublicKey;
use thiserror::Error;

/// Transport-level peer identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// What the transport knows about an authenticated neighbor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: PeerId,
    pub public_key: PublicKey,
    pub address: String,
    /// Last height the peer announced via `set_height`.
    pub height: u32,
}

/// Inbound events. Payloads are raw bytes already authenticated by the transport.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    Connected(PeerInfo),
    Disconnected(PeerId),
    Message { from: PeerId, payload: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum P2pError {
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),

    #[error("address {0} is not reachable")]
    Unreachable(String),

    #[error("transport closed")]
    Closed,
}

/// P2P collaborator used by the consensus engines.
///
/// All operations are non-blocking: sends are queued on the transport and
/// delivery failures are reported only where the caller can act on them.
pub trait P2pService: Send + Sync {
    fn local_id(&self) -> PeerId;

    /// Address other nodes can `connect` to.
    fn local_address(&self) -> String;

    /// Deliver to every connected neighbor.
    fn broadcast(&self, payload: Vec<u8>);

    fn send(&self, peer: PeerId, payload: Vec<u8>) -> Result<(), P2pError>;

    fn connect(&self, address: &str) -> Result<PeerId, P2pError>;

    fn get_neighbors(&self) -> Vec<PeerInfo>;

    fn is_own_address(&self, address: &str) -> bool;

    /// Announce the local committed height to neighbors.
    fn set_height(&self, height: u32);
}
