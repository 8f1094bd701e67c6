//! Merkle commitment over a session's authorized policies.
//!
//! The root is the session's `allowedPoliciesRoot`. Leaves are hashed
//! identities in normalized order; inner nodes hash their children as a
//! sorted pair, so proofs carry no left/right flags. A node without a
//! sibling is promoted to the next level unchanged.

use blake3::Hash;

use crate::error::PolicyError;
use crate::policy::{Policy, PolicyId, PolicySet};

const LEAF_DOMAIN: &[u8] = b"cartridge.policy.leaf";
const NODE_DOMAIN: &[u8] = b"cartridge.policy.node";

/// Root of an empty policy set.
pub const EMPTY_ROOT: &str = "0x0";

fn leaf_hash(id: &PolicyId) -> Result<Hash, PolicyError> {
    let encoded = serde_json::to_vec(id)?;
    let mut hasher = blake3::Hasher::new();
    hasher.update(LEAF_DOMAIN);
    hasher.update(&encoded);
    Ok(hasher.finalize())
}

fn node_hash(a: &Hash, b: &Hash) -> Hash {
    let (lo, hi) = if a.as_bytes() <= b.as_bytes() {
        (a, b)
    } else {
        (b, a)
    };
    let mut hasher = blake3::Hasher::new();
    hasher.update(NODE_DOMAIN);
    hasher.update(lo.as_bytes());
    hasher.update(hi.as_bytes());
    hasher.finalize()
}

fn encode(hash: &Hash) -> String {
    format!("0x{}", hash.to_hex())
}

fn decode(value: &str) -> Result<Hash, PolicyError> {
    let hex = value
        .strip_prefix("0x")
        .ok_or_else(|| PolicyError::InvalidHash(value.to_string()))?;
    Hash::from_hex(hex).map_err(|_| PolicyError::InvalidHash(value.to_string()))
}

fn leaves(policies: &[Policy]) -> Result<(Vec<PolicyId>, Vec<Hash>), PolicyError> {
    let ids = PolicySet::new(policies.to_vec()).authorized_only().ids();
    let hashes = ids.iter().map(leaf_hash).collect::<Result<Vec<_>, _>>()?;
    Ok((ids, hashes))
}

fn next_level(level: &[Hash]) -> Vec<Hash> {
    level
        .chunks(2)
        .map(|pair| match pair {
            [a, b] => node_hash(a, b),
            [single] => *single,
            _ => unreachable!("chunks(2) yields one or two items"),
        })
        .collect()
}

/// Root over the authorized subset of `policies`.
pub fn merkle_root(policies: &[Policy]) -> Result<String, PolicyError> {
    let (_, mut level) = leaves(policies)?;
    if level.is_empty() {
        return Ok(EMPTY_ROOT.to_string());
    }
    while level.len() > 1 {
        level = next_level(&level);
    }
    Ok(encode(&level[0]))
}

/// Sibling path proving `target` is part of the root, or `None` when the
/// policy is not an authorized member of the set.
pub fn merkle_proof(
    policies: &[Policy],
    target: &PolicyId,
) -> Result<Option<Vec<String>>, PolicyError> {
    let (ids, mut level) = leaves(policies)?;
    let Some(mut index) = ids.iter().position(|id| id == target) else {
        return Ok(None);
    };

    let mut proof = Vec::new();
    while level.len() > 1 {
        let sibling = index ^ 1;
        if let Some(hash) = level.get(sibling) {
            proof.push(encode(hash));
        }
        level = next_level(&level);
        index /= 2;
    }
    Ok(Some(proof))
}

pub fn verify_proof(root: &str, target: &PolicyId, proof: &[String]) -> Result<bool, PolicyError> {
    let expected = decode(root)?;
    let mut current = leaf_hash(target)?;
    for sibling in proof {
        current = node_hash(&current, &decode(sibling)?);
    }
    Ok(current == expected)
}
