//! Verifiable-random BFT. Each governance view fixes a committee and a
//! stake-weighted position table; each height draws its proposers,
//! endorsers and committers from that table using the parent block's VRF.

pub mod block_info;
pub mod block_pool;
pub mod chain_config;
pub mod config;
pub mod governance;
pub mod message;
pub mod peer_pool;
pub mod server;
pub mod state_mgr;
pub mod syncer;

pub use block_info::{compute_vrf, verify_vrf, vrf_input, VbftBlockInfo};
pub use chain_config::{build_chain_config, participants, position_table, Participants, PeerStake, WinnerInfo};
pub use config::{ChainConfig, PeerConfig};
pub use message::{VbftBody, VbftMessage};
pub use peer_pool::{PeerPool, PeerPoolNotifier, PeerSnapshot};
pub use server::VbftServer;
pub use state_mgr::{ServerState, StateMgr};
