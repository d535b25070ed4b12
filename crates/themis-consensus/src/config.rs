use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::engine::{ConsensusError, ConsensusResult};

/// VBFT committee parameters as stored in configuration and governance.
///
/// Timing fields stay integers here and become durations in the chain config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VbftParams {
    /// Committee size.
    pub n: u32,
    /// Tolerated Byzantine nodes.
    pub c: u32,
    /// Peers taken into the position table.
    pub k: u32,
    /// Target position-table length.
    pub l: u32,
    pub block_msg_delay_ms: u64,
    pub hash_msg_delay_ms: u64,
    pub peer_handshake_timeout_secs: u64,
    pub max_block_change_view: u32,
}

impl Default for VbftParams {
    fn default() -> Self {
        VbftParams {
            n: 4,
            c: 1,
            k: 4,
            l: 64,
            block_msg_delay_ms: 500,
            hash_msg_delay_ms: 500,
            peer_handshake_timeout_secs: 10,
            max_block_change_view: 3,
        }
    }
}

impl VbftParams {
    pub fn validate(&self) -> ConsensusResult<()> {
        if self.l <= self.k {
            return Err(ConsensusError::Config(format!(
                "position table length L={} must exceed K={}",
                self.l, self.k
            )));
        }
        if 2 * self.c + 1 > self.n {
            return Err(ConsensusError::Config(format!(
                "2C+1={} exceeds committee size N={}",
                2 * self.c + 1,
                self.n
            )));
        }
        if self.n > self.k {
            return Err(ConsensusError::Config(format!(
                "committee size N={} exceeds K={}",
                self.n, self.k
            )));
        }
        if self.block_msg_delay_ms == 0 || self.peer_handshake_timeout_secs == 0 {
            return Err(ConsensusError::Config("VBFT delays must be non-zero".into()));
        }
        Ok(())
    }

    pub fn block_msg_delay(&self) -> Duration {
        Duration::from_millis(self.block_msg_delay_ms)
    }

    pub fn hash_msg_delay(&self) -> Duration {
        Duration::from_millis(self.hash_msg_delay_ms)
    }

    pub fn peer_handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_handshake_timeout_secs)
    }
}

/// Typed, validated consensus settings handed to the service façade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub consensus_type: String,
    pub block_interval_ms: u64,
    pub max_tx_in_block: usize,
    pub vbft: VbftParams,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            consensus_type: "dbft".to_string(),
            block_interval_ms: 1000,
            max_tx_in_block: 500,
            vbft: VbftParams::default(),
        }
    }
}

impl ConsensusConfig {
    pub fn block_interval(&self) -> Duration {
        Duration::from_millis(self.block_interval_ms)
    }

    pub fn validate(&self) -> ConsensusResult<()> {
        if self.block_interval_ms == 0 {
            return Err(ConsensusError::Config("block interval must be non-zero".into()));
        }
        if self.max_tx_in_block == 0 {
            return Err(ConsensusError::Config("max_tx_in_block must be non-zero".into()));
        }
        if self.consensus_type.eq_ignore_ascii_case("vbft") {
            self.vbft.validate()?;
        }
        Ok(())
    }
}
