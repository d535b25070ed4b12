//! Themis devnet runner.
//!
//! ```bash
//! # four DBFT validators, ten blocks
//! themis --consensus dbft --validators 4 --blocks 10
//!
//! # settings from a file, overridden by THEMIS_* variables and flags
//! THEMIS_CONSENSUS__BLOCK_INTERVAL_MS=500 themis --config devnet.toml
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use themis::{Devnet, NodeConfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "themis")]
#[command(version, about = "Run a themis validator set on the in-memory network", long_about = None)]
struct Cli {
    /// Configuration file (toml, yaml or json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Consensus engine: dbft, vbft or solo
    #[arg(long)]
    consensus: Option<String>,

    /// Number of validators
    #[arg(long)]
    validators: Option<usize>,

    /// Stop after this many blocks
    #[arg(long)]
    blocks: Option<u32>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn apply(&self, config: &mut NodeConfig) {
        if let Some(kind) = &self.consensus {
            config.consensus.consensus_type = kind.clone();
        }
        if let Some(validators) = self.validators {
            config.devnet.validators = validators;
        }
        if let Some(blocks) = self.blocks {
            config.devnet.blocks = blocks;
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = NodeConfig::load(cli.config.as_deref()).context("loading configuration")?;
    cli.apply(&mut config);
    config.validate().context("validating configuration")?;
    init_tracing(&config.log_level);

    let devnet = Devnet::new(&config).context("building devnet")?;
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("ctrl-c received, halting validators");
                shutdown.cancel();
            }
        }
    });

    match devnet.run(shutdown).await {
        Ok(report) => {
            for node in &report.nodes {
                info!(
                    "node {} ({}): height {} tip {} pending {}",
                    node.index, node.public_key, node.height, node.tip, node.pending_txs
                );
            }
            info!("{}", report.summary());
            Ok(())
        }
        Err(e) => {
            error!("devnet failed: {}", e);
            Err(e).context("running devnet")
        }
    }
}
