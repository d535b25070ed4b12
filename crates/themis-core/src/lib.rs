// === Encoding ===
pub mod codec;

// === Block model ===
pub mod block;
pub mod merkle_tree;
pub mod transaction;

// === Collaborators ===
pub mod ledger;
pub mod transaction_pool;

pub use block::{Block, Header};
pub use codec::{CodecError, CodecResult, Decode, Encode, Sink, Source};
pub use ledger::{CrossChainMsg, ExecuteResult, GenesisConfig, Ledger, LedgerError, LedgerResult, MemLedger};
pub use merkle_tree::compute_merkle_root;
pub use transaction::{Address, Transaction};
pub use transaction_pool::{MemTxPool, TxPool};
