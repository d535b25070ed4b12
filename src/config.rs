// NODE CONFIGURATION
// Optional file layered under THEMIS_ environment overrides.
//
// SAFETY INVARIANTS:
// 1. Environment keys use `__` between sections: THEMIS_CONSENSUS__BLOCK_INTERVAL_MS
// 2. A loaded config has passed validate(); consensus errors surface before
//    any engine is built

use serde::{Deserialize, Serialize};
use std::path::Path;
use themis_consensus::{ConsensusConfig, ConsensusError, ConsensusType};
use thiserror::Error;

pub const ENV_PREFIX: &str = "THEMIS";

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("configuration: {0}")]
    Config(#[from] config::ConfigError),

    #[error("consensus: {0}")]
    Consensus(#[from] ConsensusError),

    #[error("invalid devnet settings: {0}")]
    Invalid(String),

    #[error("devnet stalled: {0}")]
    Stalled(String),

    #[error("nodes disagree at height {height}: {detail}")]
    Diverged { height: u32, detail: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevnetConfig {
    /// Validators started on the in-memory network.
    pub validators: usize,
    /// Stop once every node has committed this many blocks.
    pub blocks: u32,
    /// Synthetic transactions offered per block interval.
    pub tx_per_block: usize,
}

impl Default for DevnetConfig {
    fn default() -> Self {
        DevnetConfig {
            validators: 4,
            blocks: 10,
            tx_per_block: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub consensus: ConsensusConfig,
    pub devnet: DevnetConfig,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            consensus: ConsensusConfig::default(),
            devnet: DevnetConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl NodeConfig {
    /// Read `path` (format picked from the extension) and apply `THEMIS_*` overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, NodeError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let loaded: NodeConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<(), NodeError> {
        let kind: ConsensusType = self.consensus.consensus_type.parse()?;
        self.consensus.validate()?;
        if self.devnet.validators == 0 {
            return Err(NodeError::Invalid("at least one validator is required".into()));
        }
        if kind == ConsensusType::Vbft && self.devnet.validators < 4 {
            return Err(NodeError::Invalid(format!(
                "vbft needs at least 4 validators, got {}",
                self.devnet.validators
            )));
        }
        if self.devnet.validators > usize::from(u16::MAX) {
            return Err(NodeError::Invalid(format!(
                "{} validators exceed the bookkeeper index range",
                self.devnet.validators
            )));
        }
        if self.devnet.blocks == 0 {
            return Err(NodeError::Invalid("blocks must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        assert!(NodeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_settings() {
        let mut cfg = NodeConfig::default();
        cfg.consensus.consensus_type = "raft".into();
        assert!(matches!(cfg.validate(), Err(NodeError::Consensus(_))));

        let mut cfg = NodeConfig::default();
        cfg.consensus.consensus_type = "vbft".into();
        cfg.devnet.validators = 3;
        assert!(matches!(cfg.validate(), Err(NodeError::Invalid(_))));

        let mut cfg = NodeConfig::default();
        cfg.devnet.blocks = 0;
        assert!(cfg.validate().is_err());
    }

    // the only test touching THEMIS_* variables
    #[test]
    fn test_file_then_env_layering() {
        let path = std::env::temp_dir().join(format!("themis-config-{}.toml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "log_level = \"debug\"\n\n[consensus]\nconsensus_type = \"solo\"\nblock_interval_ms = 250\n\n[devnet]\nvalidators = 1\nblocks = 3"
        )
        .unwrap();
        drop(file);

        std::env::set_var("THEMIS_DEVNET__BLOCKS", "7");
        let cfg = NodeConfig::load(Some(&path));
        std::env::remove_var("THEMIS_DEVNET__BLOCKS");
        std::fs::remove_file(&path).unwrap();

        let cfg = cfg.unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.consensus.consensus_type, "solo");
        assert_eq!(cfg.consensus.block_interval_ms, 250);
        assert_eq!(cfg.consensus.max_tx_in_block, ConsensusConfig::default().max_tx_in_block);
        assert_eq!(cfg.devnet.validators, 1);
        assert_eq!(cfg.devnet.blocks, 7);
        assert_eq!(cfg.devnet.tx_per_block, DevnetConfig::default().tx_per_block);
    }
}
