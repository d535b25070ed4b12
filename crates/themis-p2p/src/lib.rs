pub mod memory;
pub mod network;
pub mod peer_score;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use network::{NetworkEvent, P2pError, P2pService, PeerId, PeerInfo};
pub use peer_score::PeerScoreBook;
