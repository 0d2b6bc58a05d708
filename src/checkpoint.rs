//! Checkpoint merkle-proof validation: proves that the header at the
//! baked-in verification height is actually included in the chain a server
//! is claiming, before any of that server's headers are trusted.

use crate::error::Error;
use bitcoin::hashes::{sha256d, Hash};

/// Reverses byte order, converting between a server's big-endian display hex
/// and rust-bitcoin's internal little-endian storage.
fn reverse_bytes(mut bytes: [u8; 32]) -> [u8; 32] {
    bytes.reverse();
    bytes
}

fn hex_hash32(hex_str: &str) -> Result<[u8; 32], Error> {
    let bytes = hex::decode(hex_str)?;
    bytes
        .try_into()
        .map_err(|_| Error::BadServerKey(format!("expected 32 bytes, got malformed hex {hex_str}")))
}

/// Decodes a big-endian display-hex root/hash into the internal
/// little-endian [`sha256d::Hash`] representation, for cross-checking a
/// server's claimed merkle root against one already seen from another.
pub fn root_hash_from_hex(hex_str: &str) -> Result<sha256d::Hash, Error> {
    Ok(sha256d::Hash::from_byte_array(reverse_bytes(hex_hash32(hex_str)?)))
}

/// Decodes the server's claimed root and branch, folds `header_hex`'s
/// double-SHA256 up through the branch, and checks the result against
/// `expected_root` — which, absent a baked-in checkpoint for this network, is
/// simply whatever root the server claims.
pub fn validate_checkpoint_proof(
    merkle_root_hex: &str,
    merkle_branch_hex: &[String],
    header_hex: &str,
    height: u32,
    configured_root: Option<sha256d::Hash>,
) -> Result<bool, Error> {
    let received_root = sha256d::Hash::from_byte_array(reverse_bytes(hex_hash32(merkle_root_hex)?));
    let expected_root = configured_root.unwrap_or(received_root);
    if received_root != expected_root {
        return Ok(false);
    }

    let header_bytes = hex::decode(header_hex)?;
    let header_hash = sha256d::Hash::hash(&header_bytes);

    let mut branch = Vec::with_capacity(merkle_branch_hex.len());
    for item in merkle_branch_hex {
        branch.push(sha256d::Hash::from_byte_array(reverse_bytes(hex_hash32(item)?)));
    }

    Ok(validate_checkpoint_result(header_hash, &branch, height, expected_root))
}

/// Folds a merkle branch up to a root, Bitcoin-style (`sha256d`, each step
/// ordered by the corresponding bit of `index`).
pub fn root_from_proof(leaf: sha256d::Hash, branch: &[sha256d::Hash], mut index: u32) -> sha256d::Hash {
    let mut hash = leaf;
    for item in branch {
        let mut buf = [0u8; 64];
        if index & 1 == 1 {
            buf[..32].copy_from_slice(item.as_byte_array());
            buf[32..].copy_from_slice(hash.as_byte_array());
        } else {
            buf[..32].copy_from_slice(hash.as_byte_array());
            buf[32..].copy_from_slice(item.as_byte_array());
        }
        hash = sha256d::Hash::hash(&buf);
        index >>= 1;
    }
    hash
}

/// Validates that `leaf` (the hash of the header being proven, e.g. a chunk's
/// first header) is included under `expected_root` via `branch`/`index`.
pub fn validate_checkpoint_result(
    leaf: sha256d::Hash,
    branch: &[sha256d::Hash],
    index: u32,
    expected_root: sha256d::Hash,
) -> bool {
    root_from_proof(leaf, branch, index) == expected_root
}

#[cfg(test)]
mod test {
    use super::*;

    fn h(byte: u8) -> sha256d::Hash {
        sha256d::Hash::hash(&[byte])
    }

    #[test]
    fn single_leaf_root_is_itself() {
        let leaf = h(1);
        assert_eq!(root_from_proof(leaf, &[], 0), leaf);
    }

    #[test]
    fn two_leaf_tree_validates() {
        let left = h(1);
        let right = h(2);
        let mut buf = [0u8; 64];
        buf[..32].copy_from_slice(left.as_byte_array());
        buf[32..].copy_from_slice(right.as_byte_array());
        let root = sha256d::Hash::hash(&buf);

        assert!(validate_checkpoint_result(left, &[right], 0, root));
        assert!(validate_checkpoint_result(right, &[left], 1, root));
    }

    #[test]
    fn tampered_branch_fails() {
        let left = h(1);
        let right = h(2);
        let wrong = h(3);
        let mut buf = [0u8; 64];
        buf[..32].copy_from_slice(left.as_byte_array());
        buf[32..].copy_from_slice(right.as_byte_array());
        let root = sha256d::Hash::hash(&buf);

        assert!(!validate_checkpoint_result(left, &[wrong], 0, root));
    }

    #[test]
    fn hex_level_proof_accepts_server_root_when_unconfigured() {
        let header_hex = "00".repeat(80);
        let header_bytes = hex::decode(&header_hex).unwrap();
        let header_hash = sha256d::Hash::hash(&header_bytes);
        let mut root_bytes = *header_hash.as_byte_array();
        root_bytes.reverse();
        let root_hex = hex::encode(root_bytes);

        assert!(validate_checkpoint_proof(&root_hex, &[], header_hex.as_str(), 0, None).unwrap());
    }

    #[test]
    fn root_hash_from_hex_reverses_display_order() {
        let hash = h(7);
        let mut display_bytes = *hash.as_byte_array();
        display_bytes.reverse();
        let hex_str = hex::encode(display_bytes);
        assert_eq!(root_hash_from_hex(&hex_str).unwrap(), hash);
    }

    #[test]
    fn hex_level_proof_rejects_mismatched_configured_root() {
        let header_hex = "00".repeat(80);
        let configured = sha256d::Hash::hash(b"not the real checkpoint");
        let header_bytes = hex::decode(&header_hex).unwrap();
        let header_hash = sha256d::Hash::hash(&header_bytes);
        let mut root_bytes = *header_hash.as_byte_array();
        root_bytes.reverse();
        let root_hex = hex::encode(root_bytes);

        assert!(!validate_checkpoint_proof(&root_hex, &[], header_hex.as_str(), 0, Some(configured)).unwrap());
    }
}
