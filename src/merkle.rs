// Merkle tree over transaction hashes with the coinbase slot kept open.
use crate::error::{PoolError, PoolResult};
use crate::util::sha256d;

fn merkle_join(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut joined = [0u8; 64];
    joined[..32].copy_from_slice(left);
    joined[32..].copy_from_slice(right);
    sha256d(&joined)
}

/// Tree whose leaf 0 (the coinbase) is unknown at build time. `steps` holds,
/// per level, the right-hand sibling of the leftmost node, which is all that
/// is needed to recompute the root once the coinbase hash is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    steps: Vec<[u8; 32]>,
}

impl MerkleTree {
    /// `tx_hashes` are the non-coinbase transaction hashes in internal byte
    /// order, leaf 1 onwards.
    pub fn new(tx_hashes: &[[u8; 32]]) -> Self {
        let mut steps = Vec::new();
        // Index 0 of every level is the (unknown) path from the coinbase.
        let mut level: Vec<Option<[u8; 32]>> =
            std::iter::once(None).chain(tx_hashes.iter().copied().map(Some)).collect();

        while level.len() > 1 {
            // Only index 0 is ever None, so level[1] is always a real hash.
            if let Some(sibling) = level[1] {
                steps.push(sibling);
            }
            if level.len() % 2 == 1 {
                let last = level[level.len() - 1];
                level.push(last);
            }
            let mut next = vec![None];
            for pair in level[2..].chunks_exact(2) {
                if let (Some(l), Some(r)) = (pair[0], pair[1]) {
                    next.push(Some(merkle_join(&l, &r)));
                }
            }
            level = next;
        }

        Self { steps }
    }

    pub fn steps(&self) -> &[[u8; 32]] {
        &self.steps
    }

    /// Root with `first` as leaf 0. The accumulator is always the left operand,
    /// since leaf 0's path runs down the left edge of the tree.
    pub fn with_first(&self, first: [u8; 32]) -> [u8; 32] {
        self.steps
            .iter()
            .fold(first, |acc, step| merkle_join(&acc, step))
    }
}

/// Full from-scratch root over every leaf, duplicating the last node of odd
/// levels.
pub fn merkle_root(leaves: &[[u8; 32]]) -> PoolResult<[u8; 32]> {
    if leaves.is_empty() {
        return Err(PoolError::Merkle("cannot build a tree without leaves".into()));
    }
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            level.push(level[level.len() - 1]);
        }
        level = level
            .chunks_exact(2)
            .map(|pair| merkle_join(&pair[0], &pair[1]))
            .collect();
    }
    Ok(level[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::sha256;

    fn leaf(i: u32) -> [u8; 32] {
        sha256(&i.to_le_bytes())
    }

    #[test]
    fn with_first_matches_full_build_for_every_size() {
        let coinbase = sha256(b"coinbase");
        for n in 0..=17u32 {
            let txs: Vec<[u8; 32]> = (1..=n).map(leaf).collect();
            let tree = MerkleTree::new(&txs);

            let mut leaves = vec![coinbase];
            leaves.extend_from_slice(&txs);
            assert_eq!(
                tree.with_first(coinbase),
                merkle_root(&leaves).unwrap(),
                "mismatch with {} transactions",
                n
            );
        }
    }

    #[test]
    fn coinbase_only_root_is_the_coinbase_hash() {
        let tree = MerkleTree::new(&[]);
        assert!(tree.steps().is_empty());
        assert_eq!(tree.with_first([7u8; 32]), [7u8; 32]);
    }

    #[test]
    fn steps_for_three_leaves() {
        let (a, b) = (leaf(1), leaf(2));
        let tree = MerkleTree::new(&[a, b]);
        assert_eq!(tree.steps(), &[a, merkle_join(&b, &b)]);
    }

    #[test]
    fn substituting_the_coinbase_changes_the_root() {
        let tree = MerkleTree::new(&[leaf(1), leaf(2), leaf(3)]);
        assert_ne!(tree.with_first([1u8; 32]), tree.with_first([2u8; 32]));
    }

    #[test]
    fn empty_leaf_set_is_rejected() {
        assert!(merkle_root(&[]).is_err());
    }
}
