//! Classical three-phase DBFT: a single committee of bookkeepers, a
//! rotating primary per view and `M = N - (N-1)/3` signature quorum.

pub mod context;
pub mod message;
pub mod service;

pub use context::{primary_index, quorum, ConsensusContext, ConsensusState};
pub use message::{DbftBody, DbftMessage};
pub use service::DbftService;
