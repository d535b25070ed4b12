// Validator signing keys (Schnorr signatures over Ristretto25519).
//
// SAFETY INVARIANTS:
// 1. Every signature is made under one fixed signing context, so a
//    signature over a consensus digest can never be replayed elsewhere
// 2. Public keys are validated on construction; a PublicKey value is
//    always a decodable curve point
// 3. Secret material never leaves KeyPair (no Serialize on KeyPair)

use schnorrkel::{signing_context, ExpansionMode, MiniSecretKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::CryptoError;

/// Signing context for all consensus signatures.
const SIGNING_CONTEXT: &[u8] = b"themis-consensus";

pub const PUBLIC_KEY_LENGTH: usize = 32;
pub const SIGNATURE_LENGTH: usize = 64;

/// A validator key pair.
pub struct KeyPair {
    inner: schnorrkel::Keypair,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh key pair from the OS RNG.
    pub fn generate() -> Self {
        let inner = schnorrkel::Keypair::generate();
        Self::from_inner(inner)
    }

    /// Deterministically derive a key pair from a 32-byte seed.
    pub fn from_seed(seed: &[u8]) -> Result<Self, CryptoError> {
        let mini = MiniSecretKey::from_bytes(seed)
            .map_err(|e| CryptoError::InvalidSecretKey(e.to_string()))?;
        Ok(Self::from_inner(mini.expand_to_keypair(ExpansionMode::Ed25519)))
    }

    fn from_inner(inner: schnorrkel::Keypair) -> Self {
        let public = PublicKey {
            bytes: inner.public.to_bytes(),
            inner: inner.public,
        };
        KeyPair { inner, public }
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// Sign `message` under the consensus signing context.
    pub fn sign(&self, message: &[u8]) -> Signature {
        let sig = self.inner.sign(signing_context(SIGNING_CONTEXT).bytes(message));
        Signature(sig.to_bytes())
    }

    pub(crate) fn schnorrkel(&self) -> &schnorrkel::Keypair {
        &self.inner
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyPair({})", self.public)
    }
}

/// A validated 32-byte public key.
#[derive(Clone)]
pub struct PublicKey {
    bytes: [u8; PUBLIC_KEY_LENGTH],
    inner: schnorrkel::PublicKey,
}

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != PUBLIC_KEY_LENGTH {
            return Err(CryptoError::InvalidLength {
                what: "public key",
                expected: PUBLIC_KEY_LENGTH,
                got: bytes.len(),
            });
        }
        let inner = schnorrkel::PublicKey::from_bytes(bytes)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        let mut raw = [0u8; PUBLIC_KEY_LENGTH];
        raw.copy_from_slice(bytes);
        Ok(PublicKey { bytes: raw, inner })
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s).map_err(|e| CryptoError::InvalidHex(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Verify a signature made by [`KeyPair::sign`].
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let sig = match schnorrkel::Signature::from_bytes(&signature.0) {
            Ok(sig) => sig,
            Err(_) => return false,
        };
        self.inner
            .verify(signing_context(SIGNING_CONTEXT).bytes(message), &sig)
            .is_ok()
    }

    pub(crate) fn schnorrkel(&self) -> &schnorrkel::PublicKey {
        &self.inner
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for PublicKey {}

impl std::hash::Hash for PublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.bytes.hash(state);
    }
}

impl PartialOrd for PublicKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PublicKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.bytes.cmp(&other.bytes)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", &self.to_hex()[..12])
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PublicKey::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// A 64-byte Schnorr signature.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature(pub [u8; SIGNATURE_LENGTH]);

impl Signature {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != SIGNATURE_LENGTH {
            return Err(CryptoError::InvalidLength {
                what: "signature",
                expected: SIGNATURE_LENGTH,
                got: bytes.len(),
            });
        }
        let mut raw = [0u8; SIGNATURE_LENGTH];
        raw.copy_from_slice(bytes);
        Ok(Signature(raw))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        Signature::from_slice(&bytes).map_err(serde::de::Error::custom)
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}..)", hex::encode(&self.0[..8]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(byte: u8) -> KeyPair {
        KeyPair::from_seed(&[byte; 32]).unwrap()
    }

    #[test]
    fn test_sign_and_verify() {
        let kp = seeded(1);
        let sig = kp.sign(b"header-hash");
        assert!(kp.public().verify(b"header-hash", &sig));
        assert!(!kp.public().verify(b"other-hash", &sig));
        assert!(!seeded(2).public().verify(b"header-hash", &sig));
    }

    #[test]
    fn test_seed_derivation_is_deterministic() {
        assert_eq!(seeded(7).public(), seeded(7).public());
        assert_ne!(seeded(7).public(), seeded(8).public());
    }

    #[test]
    fn test_public_key_hex_roundtrip() {
        let kp = seeded(3);
        let hex = kp.public().to_hex();
        assert_eq!(&PublicKey::from_hex(&hex).unwrap(), kp.public());
        assert!(PublicKey::from_hex("abcd").is_err());
        assert!(PublicKey::from_hex("zz").is_err());
    }

    #[test]
    fn test_public_key_serde_is_hex_string() {
        let kp = seeded(4);
        let json = serde_json::to_string(kp.public()).unwrap();
        assert_eq!(json, format!("\"{}\"", kp.public().to_hex()));
        let back: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(&back, kp.public());
    }

    #[test]
    fn test_signature_serde_is_hex_string() {
        let sig = seeded(5).sign(b"block");
        let json = serde_json::to_string(&sig).unwrap();
        assert_eq!(json, format!("\"{}\"", hex::encode(sig.as_bytes())));
        let back: Signature = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sig);
        assert!(serde_json::from_str::<Signature>("\"abcd\"").is_err());
    }
}
