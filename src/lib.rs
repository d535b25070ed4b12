//! Themis node: configuration loading and the in-memory devnet that
//! drives the consensus engines end to end.

pub mod config;
pub mod node;

pub use config::{DevnetConfig, NodeConfig, NodeError};
pub use node::{Devnet, DevnetReport, NodeReport};
