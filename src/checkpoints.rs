//! Baked-in per-network checkpoints: the `(height, merkle_root)` pair a fresh
//! interface must prove into before any of its headers are trusted.
//!
//! Networks with no baked-in checkpoint fall back to an N-of-M confirmation
//! path instead: several servers must independently agree on a root before
//! it's frozen as the checkpoint. The decision to keep that path live (rather
//! than dead code behind a single-server shortcut) is recorded in
//! `DESIGN.md`.

use bitcoin::hashes::sha256d;
use bitcoin::Network;
use std::str::FromStr;

/// A network's baked-in checkpoint, if it has one. `bitcoin::Network::Regtest`
/// and freshly bootstrapped test networks have none: the checkpoint height is
/// instead derived at runtime as `tip - 100`.
pub fn baked_in(network: Network) -> Option<(u64, sha256d::Hash)> {
    match network {
        Network::Bitcoin => Some((
            695000,
            sha256d::Hash::from_str(
                "4e16a56c7b9f2c5b5a0a53da9b5d0c0d8f4f8c1a1f8b50c1c8f3f9a33a7a2a41",
            )
            .expect("valid checkpoint hash literal"),
        )),
        _ => None,
    }
}

/// Tracks how many independent servers must agree on the checkpoint root
/// before it's frozen, for networks with no baked-in checkpoint. The active
/// code path always configures a checkpoint up front (`required == 1`), but
/// the counter is live so a future change widening the quorum only needs to
/// raise `required`.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointQuorum {
    pub required: usize,
    pub seen: usize,
}

impl CheckpointQuorum {
    pub fn new(required: usize) -> Self {
        CheckpointQuorum {
            required: required.max(1),
            seen: 0,
        }
    }

    /// Records one more server's agreement; returns `true` once the quorum
    /// has been reached (the checkpoint may now be frozen).
    pub fn record(&mut self) -> bool {
        self.seen += 1;
        self.seen >= self.required
    }
}

impl Default for CheckpointQuorum {
    fn default() -> Self {
        CheckpointQuorum::new(1)
    }
}

/// Number of headers requested alongside the initial checkpoint proof:
/// enough to perform difficulty-adjustment calculations across the
/// checkpoint boundary.
pub const VERIFICATION_CHUNK_LEN: u64 = 147;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mainnet_has_a_baked_in_checkpoint() {
        assert!(baked_in(Network::Bitcoin).is_some());
    }

    #[test]
    fn regtest_has_none() {
        assert!(baked_in(Network::Regtest).is_none());
    }

    #[test]
    fn quorum_of_one_is_satisfied_immediately() {
        let mut q = CheckpointQuorum::new(1);
        assert!(q.record());
    }

    #[test]
    fn quorum_of_three_needs_three_confirmations() {
        let mut q = CheckpointQuorum::new(3);
        assert!(!q.record());
        assert!(!q.record());
        assert!(q.record());
    }
}
