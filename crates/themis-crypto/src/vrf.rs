// Verifiable random function over Ristretto25519 (schnorrkel VRF).
//
// The VRF value is the 32-byte VRF pre-output; the proof is the 64-byte
// DLEQ proof. Anyone holding the public key can check that `value` was
// produced by the key holder for exactly `message`.

use schnorrkel::vrf::{VRFPreOut, VRFProof};
use schnorrkel::signing_context;

use crate::keys::{KeyPair, PublicKey};

const VRF_CONTEXT: &[u8] = b"themis-vrf";

pub const VRF_VALUE_LENGTH: usize = 32;
pub const VRF_PROOF_LENGTH: usize = 64;

/// Evaluate the VRF on `message`, returning `(value, proof)`.
pub fn vrf_prove(keypair: &KeyPair, message: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let (inout, proof, _) = keypair
        .schnorrkel()
        .vrf_sign(signing_context(VRF_CONTEXT).bytes(message));
    (
        inout.to_preout().to_bytes().to_vec(),
        proof.to_bytes().to_vec(),
    )
}

/// Verify a VRF `(value, proof)` pair for `message` under `public_key`.
pub fn vrf_verify(public_key: &PublicKey, message: &[u8], value: &[u8], proof: &[u8]) -> bool {
    let preout = match VRFPreOut::from_bytes(value) {
        Ok(p) => p,
        Err(_) => return false,
    };
    let proof = match VRFProof::from_bytes(proof) {
        Ok(p) => p,
        Err(_) => return false,
    };
    public_key
        .schnorrkel()
        .vrf_verify(signing_context(VRF_CONTEXT).bytes(message), &preout, &proof)
        .is_ok()
}
