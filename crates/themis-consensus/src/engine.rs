// CONSENSUS ENGINE TRAIT
// Shared error kinds, status reporting and the event-loop plumbing every
// engine (DBFT, VBFT, Solo) is built on.
//
// SAFETY INVARIANTS:
// 1. Recoverable errors never leave an engine's event loop; only `Config`
//    (and `Halted` after shutdown) are returned from `run`
// 2. Each engine owns its state exclusively and mutates it from one task
// 3. Inbound traffic reaches the loop through one bounded channel; overflow
//    is counted, never blocks the transport

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use themis_core::{CodecError, Ledger, LedgerError, TxPool};
use themis_crypto::{Hash256, KeyPair};
use themis_p2p::{NetworkEvent, P2pService};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Capacity of every engine's inbound channel.
pub const INBOUND_CAPACITY: usize = 1024;

/// Accepted clock skew for a proposed header timestamp, in seconds.
pub const MAX_TIMESTAMP_SKEW: u32 = 10 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsensusError {
    /// Truncated or irregular encoding.
    #[error("decode error: {0}")]
    Decode(#[from] CodecError),

    /// Bad signature, wrong bookkeeper or failed VRF.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Height or view already past.
    #[error("stale message: {0}")]
    Stale(String),

    /// Height ahead of the local chain.
    #[error("future message at height {height} (local {local})")]
    Future { height: u32, local: u32 },

    /// Inbound channel full.
    #[error("inbound channel full")]
    Busy,

    #[error("ledger error: {0}")]
    Ledger(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("consensus service halted")]
    Halted,
}

impl ConsensusError {
    /// Fatal errors stop the engine; everything else is handled inside the loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConsensusError::Config(_))
    }

    /// Whether the sending peer's score should be decremented.
    pub fn penalizes_peer(&self) -> bool {
        matches!(self, ConsensusError::Decode(_) | ConsensusError::Auth(_))
    }
}

impl From<LedgerError> for ConsensusError {
    fn from(e: LedgerError) -> Self {
        ConsensusError::Ledger(e.to_string())
    }
}

pub type ConsensusResult<T> = Result<T, ConsensusError>;

/// Collaborators injected into an engine by the service façade.
pub struct ConsensusDeps {
    pub account: Arc<KeyPair>,
    pub ledger: Arc<dyn Ledger>,
    pub txpool: Arc<dyn TxPool>,
    pub p2p: Arc<dyn P2pService>,
    /// Authenticated inbound stream from the transport.
    pub network: mpsc::UnboundedReceiver<NetworkEvent>,
}

/// A block this node sealed through consensus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SealedBlock {
    pub height: u32,
    pub hash: Hash256,
    /// DBFT view or VBFT change-view count at the time of sealing.
    pub view: u32,
    /// DBFT primary index or VBFT proposer index.
    pub proposer: u32,
}

/// Snapshot published by an engine after every state change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStatus {
    pub committed_height: u32,
    pub view: u32,
    /// Engine-specific phase name (DBFT state bits, VBFT server state).
    pub phase: String,
    pub last_sealed: Option<SealedBlock>,
    /// Inbound messages dropped because the channel was full.
    pub busy_drops: u64,
}

#[async_trait]
pub trait ConsensusEngine: Send {
    fn name(&self) -> &'static str;

    /// Load configuration and ledger state. Errors here are fatal.
    fn initialize(&mut self) -> ConsensusResult<()>;

    fn status(&self) -> watch::Receiver<EngineStatus>;

    /// Drive the event loop until `shutdown` is cancelled.
    async fn run(self: Box<Self>, shutdown: CancellationToken) -> ConsensusResult<()>;
}

/// Forward transport events into an engine's bounded inbound channel.
///
/// Consensus messages are offered with `try_send`; when the channel is full
/// they are dropped and counted in `busy`. Connection events always wait for
/// room so the peer view never diverges from the transport.
pub fn spawn_network_relay<E>(
    mut transport: mpsc::UnboundedReceiver<NetworkEvent>,
    inbound: mpsc::Sender<E>,
    busy: Arc<AtomicU64>,
    shutdown: CancellationToken,
) -> JoinHandle<()>
where
    E: From<NetworkEvent> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                ev = transport.recv() => match ev {
                    Some(ev) => ev,
                    None => break,
                },
            };
            match event {
                NetworkEvent::Message { .. } => {
                    if let Err(mpsc::error::TrySendError::Full(_)) = inbound.try_send(E::from(event)) {
                        busy.fetch_add(1, Ordering::Relaxed);
                        log::debug!("{}", ConsensusError::Busy);
                    }
                }
                other => {
                    if inbound.send(E::from(other)).await.is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// Current wall-clock time in whole seconds.
pub fn unix_now() -> u32 {
    chrono::Utc::now().timestamp().max(0) as u32
}
