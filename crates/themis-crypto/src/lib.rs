pub mod hash;
pub mod keys;
pub mod vrf;

pub use hash::{fnv64a, sha256, sha256d, Hash256};
pub use keys::{KeyPair, PublicKey, Signature, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
pub use vrf::{vrf_prove, vrf_verify};

use thiserror::Error;

/// Error type for cryptographic operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("invalid {what} length: expected {expected}, got {got}")]
    InvalidLength {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("invalid hex: {0}")]
    InvalidHex(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid secret key: {0}")]
    InvalidSecretKey(String),
}

pub type CryptoResult<T> = Result<T, CryptoError>;
