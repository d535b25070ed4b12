// === Shared plumbing ===
pub mod config;
pub mod engine;
pub mod payload;
pub mod timer;

// === Engines ===
pub mod dbft;
pub mod solo;
pub mod vbft;

// === Façade ===
pub mod service;

pub use config::{ConsensusConfig, VbftParams};
pub use engine::{
    ConsensusDeps, ConsensusEngine, ConsensusError, ConsensusResult, EngineStatus, SealedBlock,
};
pub use payload::ConsensusPayload;
pub use service::{new_consensus_service, ConsensusService, ConsensusType, Pid};
