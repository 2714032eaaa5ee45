//! Canonical hashing for hashlocks, swap ids and partial-fill Merkle trees
//!
//! Every digest in the coordinator is keccak-256, the function both escrow
//! contracts verify on-chain. Hashes are rendered as `0x`-prefixed lowercase hex.

use sha3::{Digest, Keccak256};

/// Hash size in bytes
pub const HASH_SIZE: usize = 32;

/// 32-byte digest
pub type Hash = [u8; HASH_SIZE];

/// keccak-256 of arbitrary bytes
pub fn keccak256(data: &[u8]) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    let mut hash = [0u8; HASH_SIZE];
    hash.copy_from_slice(&hasher.finalize());
    hash
}

/// Hashlock for a secret pre-image
pub fn hashlock(secret: &str) -> Hash {
    keccak256(secret.as_bytes())
}

/// Render a hash as `0x`-prefixed hex
pub fn to_hex(hash: &Hash) -> String {
    format!("0x{}", hex::encode(hash))
}

/// Parse a 32-byte hash from hex, with or without `0x` prefix
pub fn parse_hash(input: &str) -> Option<Hash> {
    let stripped = input.strip_prefix("0x").unwrap_or(input);
    if stripped.len() != HASH_SIZE * 2 {
        return None;
    }

    let bytes = hex::decode(stripped).ok()?;
    let mut hash = [0u8; HASH_SIZE];
    hash.copy_from_slice(&bytes);
    Some(hash)
}

/// Hash two child nodes together
pub fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut combined = [0u8; HASH_SIZE * 2];
    combined[..HASH_SIZE].copy_from_slice(left);
    combined[HASH_SIZE..].copy_from_slice(right);
    keccak256(&combined)
}

/// Fold a leaf up its sibling path. The index bit at each level decides
/// whether the running hash is the left or right child.
pub fn root_from_proof(leaf: &Hash, index: u32, siblings: &[Hash]) -> Hash {
    let mut current = *leaf;
    let mut position = index;

    for sibling in siblings {
        current = if position % 2 == 0 {
            hash_pair(&current, sibling)
        } else {
            hash_pair(sibling, &current)
        };
        position /= 2;
    }

    current
}

/// Merkle tree over per-part secret hashes, one leaf per fill index.
///
/// Odd levels pair their last node with itself.
#[derive(Debug, Clone)]
pub struct SecretTree {
    levels: Vec<Vec<Hash>>,
}

impl SecretTree {
    /// Build from the secrets of each part, in fill order
    pub fn from_secrets<S: AsRef<str>>(secrets: &[S]) -> Self {
        let leaves = secrets.iter().map(|s| hashlock(s.as_ref())).collect();
        Self::from_leaves(leaves)
    }

    /// Build from precomputed leaf hashes
    pub fn from_leaves(leaves: Vec<Hash>) -> Self {
        let mut levels = vec![leaves];

        while levels.last().map(|l| l.len() > 1).unwrap_or(false) {
            let current = &levels[levels.len() - 1];
            let next = current
                .chunks(2)
                .map(|chunk| {
                    let right = chunk.get(1).unwrap_or(&chunk[0]);
                    hash_pair(&chunk[0], right)
                })
                .collect();
            levels.push(next);
        }

        Self { levels }
    }

    /// Merkle root (all zeros for an empty tree)
    pub fn root(&self) -> Hash {
        self.levels
            .last()
            .and_then(|l| l.first().copied())
            .unwrap_or([0u8; HASH_SIZE])
    }

    /// Number of leaves
    pub fn len(&self) -> usize {
        self.levels.first().map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Leaf hash at an index
    pub fn leaf(&self, index: usize) -> Option<Hash> {
        self.levels.first().and_then(|l| l.get(index).copied())
    }

    /// Sibling path for the leaf at `index`
    pub fn proof(&self, index: usize) -> Option<Vec<Hash>> {
        if index >= self.len() {
            return None;
        }

        let mut siblings = Vec::new();
        let mut position = index;

        for level in &self.levels[..self.levels.len() - 1] {
            let sibling = position ^ 1;
            siblings.push(*level.get(sibling).unwrap_or(&level[position]));
            position /= 2;
        }

        Some(siblings)
    }
}

/// Serde helpers storing a [`Hash`] as `0x`-prefixed hex
pub mod serde_hex {
    use super::{parse_hash, to_hex, Hash};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(hash: &Hash, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&to_hex(hash))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Hash, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_hash(&raw).ok_or_else(|| D::Error::custom(format!("invalid 32-byte hash: {}", raw)))
    }
}
