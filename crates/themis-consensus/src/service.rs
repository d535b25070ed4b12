//! Consensus service façade.
//!
//! Picks DBFT, VBFT or Solo from the configured `consensus_type`, injects
//! the collaborators and owns the lifecycle of the spawned event loop. The
//! façade holds no consensus state itself.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{error, info};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ConsensusConfig;
use crate::dbft::DbftService;
use crate::engine::{ConsensusDeps, ConsensusEngine, ConsensusError, ConsensusResult, EngineStatus};
use crate::solo::SoloService;
use crate::vbft::VbftServer;

static NEXT_PID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsensusType {
    Dbft,
    Vbft,
    Solo,
}

impl FromStr for ConsensusType {
    type Err = ConsensusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dbft" => Ok(ConsensusType::Dbft),
            "vbft" => Ok(ConsensusType::Vbft),
            "solo" => Ok(ConsensusType::Solo),
            other => Err(ConsensusError::Config(format!("unknown consensus type {:?}", other))),
        }
    }
}

impl fmt::Display for ConsensusType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConsensusType::Dbft => "dbft",
            ConsensusType::Vbft => "vbft",
            ConsensusType::Solo => "solo",
        })
    }
}

/// Opaque handle to a running engine: an id plus its shutdown token.
#[derive(Debug, Clone)]
pub struct Pid {
    id: u64,
    shutdown: CancellationToken,
}

impl Pid {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_halted(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

pub struct ConsensusService {
    kind: ConsensusType,
    engine: Option<Box<dyn ConsensusEngine>>,
    status: watch::Receiver<EngineStatus>,
    pid: Pid,
    handle: Option<JoinHandle<ConsensusResult<()>>>,
}

/// Build the engine selected by `config.consensus_type`.
pub fn new_consensus_service(config: ConsensusConfig, deps: ConsensusDeps) -> ConsensusResult<ConsensusService> {
    let kind: ConsensusType = config.consensus_type.parse()?;
    config.validate()?;
    let engine: Box<dyn ConsensusEngine> = match kind {
        ConsensusType::Dbft => Box::new(DbftService::new(config, deps)),
        ConsensusType::Vbft => Box::new(VbftServer::new(config, deps)),
        ConsensusType::Solo => Box::new(SoloService::new(config, deps)),
    };
    Ok(ConsensusService {
        kind,
        status: engine.status(),
        engine: Some(engine),
        pid: Pid {
            id: NEXT_PID.fetch_add(1, Ordering::Relaxed),
            shutdown: CancellationToken::new(),
        },
        handle: None,
    })
}

impl ConsensusService {
    pub fn kind(&self) -> ConsensusType {
        self.kind
    }

    pub fn pid(&self) -> &Pid {
        &self.pid
    }

    pub fn status(&self) -> watch::Receiver<EngineStatus> {
        self.status.clone()
    }

    /// Initialize synchronously, then spawn the event loop. Configuration
    /// errors surface here; a second call returns `Halted`.
    pub fn start(&mut self) -> ConsensusResult<()> {
        let mut engine = self.engine.take().ok_or(ConsensusError::Halted)?;
        engine.initialize()?;
        info!("consensus {} started (pid {})", engine.name(), self.pid.id);
        let shutdown = self.pid.shutdown.clone();
        let pid = self.pid.id;
        self.handle = Some(tokio::spawn(async move {
            let result = engine.run(shutdown.clone()).await;
            if let Err(e) = &result {
                error!("consensus (pid {}) stopped: {}", pid, e);
                shutdown.cancel();
            }
            result
        }));
        Ok(())
    }

    /// Stop the event loop and wait for it to drain.
    pub async fn halt(&mut self) -> ConsensusResult<()> {
        self.pid.shutdown.cancel();
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        match handle.await {
            Ok(result) => result,
            Err(e) => {
                error!("consensus (pid {}) task failed: {}", self.pid.id, e);
                Err(ConsensusError::Halted)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use themis_core::{GenesisConfig, MemLedger, MemTxPool};
    use themis_crypto::KeyPair;
    use themis_p2p::MemoryNetwork;

    fn deps() -> ConsensusDeps {
        let account = Arc::new(KeyPair::from_seed(&[9u8; 32]).unwrap());
        let (transport, network) = MemoryNetwork::new().join(account.public().clone());
        ConsensusDeps {
            ledger: Arc::new(MemLedger::new(GenesisConfig {
                bookkeepers: vec![account.public().clone()],
                timestamp: 1_000,
                storage: Vec::new(),
            })),
            account,
            txpool: Arc::new(MemTxPool::new(16)),
            p2p: Arc::new(transport),
            network,
        }
    }

    #[test]
    fn test_consensus_type_parsing() {
        assert_eq!("DBFT".parse::<ConsensusType>().unwrap(), ConsensusType::Dbft);
        assert_eq!("vbft".parse::<ConsensusType>().unwrap(), ConsensusType::Vbft);
        assert_eq!(ConsensusType::Solo.to_string(), "solo");
        assert!(matches!("raft".parse::<ConsensusType>(), Err(ConsensusError::Config(_))));
    }

    #[test]
    fn test_unknown_type_rejected_at_construction() {
        let config = ConsensusConfig {
            consensus_type: "pow".into(),
            ..ConsensusConfig::default()
        };
        assert!(new_consensus_service(config, deps()).is_err());
    }

    #[tokio::test]
    async fn test_start_halt_lifecycle() {
        let config = ConsensusConfig {
            consensus_type: "solo".into(),
            ..ConsensusConfig::default()
        };
        let mut service = new_consensus_service(config, deps()).unwrap();
        assert_eq!(service.kind(), ConsensusType::Solo);
        service.start().unwrap();
        assert!(matches!(service.start(), Err(ConsensusError::Halted)));
        assert!(!service.pid().is_halted());
        service.halt().await.unwrap();
        assert!(service.pid().is_halted());
        service.halt().await.unwrap();
    }
}
