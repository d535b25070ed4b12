// Binary Merkle root over transaction hashes.
//
// Leaves are paired left to right; an odd node at any level is paired with
// itself. Interior nodes are `sha256d(left || right)`. An empty list has the
// zero root.

use themis_crypto::{sha256d, Hash256};

pub fn compute_merkle_root(hashes: &[Hash256]) -> Hash256 {
    if hashes.is_empty() {
        return Hash256::ZERO;
    }
    let mut level: Vec<Hash256> = hashes.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let left = pair[0];
                let right = pair.get(1).copied().unwrap_or(left);
                let mut buf = [0u8; 64];
                buf[..32].copy_from_slice(left.as_bytes());
                buf[32..].copy_from_slice(right.as_bytes());
                sha256d(&buf)
            })
            .collect();
    }
    level[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(b: u8) -> Hash256 {
        sha256d(&[b])
    }

    #[test]
    fn test_single_leaf_is_root() {
        assert_eq!(compute_merkle_root(&[leaf(1)]), leaf(1));
        assert_eq!(compute_merkle_root(&[]), Hash256::ZERO);
    }

    #[test]
    fn test_odd_leaf_is_duplicated() {
        let three = compute_merkle_root(&[leaf(1), leaf(2), leaf(3)]);
        let four = compute_merkle_root(&[leaf(1), leaf(2), leaf(3), leaf(3)]);
        assert_eq!(three, four);
    }

    #[test]
    fn test_order_matters() {
        assert_ne!(
            compute_merkle_root(&[leaf(1), leaf(2)]),
            compute_merkle_root(&[leaf(2), leaf(1)])
        );
    }
}
