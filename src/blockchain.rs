//! The `Blockchain` collaborator: a concrete dense-file header chain
//! plus its forks. Wallet-side persistent storage is an
//! opaque external component, but a runnable core still needs a concrete
//! implementation behind that contract — this one is built directly from the
//! documented interface and the call sites visible in the sync state machine,
//! not ported from an unseen file.

use crate::error::Error;
use bitcoin::block::Header;
use bitcoin::consensus::{deserialize, serialize};
use bitcoin::hashes::Hash;
use bitcoin::pow::Target;
use bitcoin::BlockHash;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const HEADER_SIZE: u64 = 80;

/// Outcome of connecting a chunk of headers to a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// The whole chunk extended this chain in place.
    Accepted,
    /// The chunk diverges from this chain at the returned height; a new
    /// sibling chain should be created (or an existing one extended).
    Forked(u64),
    /// The chunk doesn't connect to anything this chain knows about.
    Invalid,
}

/// One chain: either the canonical chain (`base_height == 0`) or a fork that
/// branches off its parent at `base_height`.
pub struct Blockchain {
    path: PathBuf,
    pub base_height: u64,
    pub parent_base_height: Option<u64>,
    /// Interface currently catching this chain up from its fork point, if any.
    pub catch_up: Option<crate::server_key::ServerKey>,
    file: File,
}

impl Blockchain {
    /// Opens (creating if absent) the dense headers file for a chain rooted
    /// at `base_height`, pre-extending the canonical chain's file up to the
    /// checkpoint height.
    pub fn open(dir: &Path, base_height: u64, checkpoint_height: u64) -> Result<Self, Error> {
        std::fs::create_dir_all(dir)?;
        let path = Self::file_path(dir, base_height);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let mut chain = Blockchain {
            path,
            base_height,
            parent_base_height: if base_height == 0 { None } else { Some(0) },
            catch_up: None,
            file,
        };
        if base_height == 0 {
            chain.init_headers_file(checkpoint_height)?;
        }
        Ok(chain)
    }

    fn file_path(dir: &Path, base_height: u64) -> PathBuf {
        if base_height == 0 {
            dir.join("blockchain_headers")
        } else {
            dir.join(format!("blockchain_headers.{base_height}"))
        }
    }

    /// Pre-extends the canonical chain's file to `80 * (checkpoint_height +
    /// 1)` bytes so random-access writes at the checkpoint never need a
    /// separate grow step.
    fn init_headers_file(&mut self, checkpoint_height: u64) -> Result<(), Error> {
        let target_len = HEADER_SIZE * (checkpoint_height + 1);
        let current_len = self.file.metadata()?.len();
        if current_len < target_len {
            self.file.set_len(target_len)?;
        }
        Ok(())
    }

    /// Number of headers stored (one past the highest height known).
    pub fn height(&self) -> Result<u64, Error> {
        Ok(self.file.metadata()?.len() / HEADER_SIZE)
    }

    pub fn read_header(&mut self, height: u64) -> Result<Option<Header>, Error> {
        let offset = height * HEADER_SIZE;
        if self.file.metadata()?.len() < offset + HEADER_SIZE {
            return Ok(None);
        }
        let mut buf = [0u8; HEADER_SIZE as usize];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;
        if buf.iter().all(|b| *b == 0) {
            return Ok(None);
        }
        let header: Header = deserialize(&buf)?;
        Ok(Some(header))
    }

    pub fn save_header(&mut self, height: u64, header: &Header) -> Result<(), Error> {
        let offset = height * HEADER_SIZE;
        let bytes = serialize(header);
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&bytes)?;
        self.file.flush()?;
        Ok(())
    }

    /// Checks proof-of-work and the `prev_blockhash` link to `height - 1`'s
    /// header, without touching difficulty retargeting (out of scope here,
    /// no retarget/difficulty validation is performed).
    pub fn check_header(&mut self, height: u64, header: &Header) -> Result<bool, Error> {
        if !header_meets_target(header) {
            return Ok(false);
        }
        if height == 0 {
            return Ok(true);
        }
        match self.read_header(height - 1)? {
            Some(parent) => Ok(parent.block_hash() == header.prev_blockhash),
            None => Ok(false),
        }
    }

    /// Whether `header` could be appended immediately after `height - 1`'s
    /// header on this chain (PoW valid, `prev_blockhash` matches).
    pub fn can_connect(&mut self, height: u64, header: &Header) -> Result<bool, Error> {
        self.check_header(height, header)
    }

    /// Attempts to connect a contiguous run of headers starting at
    /// `start_height`. Stops and reports the divergence point at the first
    /// header that doesn't extend this chain.
    pub fn connect_chunk(&mut self, start_height: u64, headers: &[Header]) -> Result<ConnectOutcome, Error> {
        for (i, header) in headers.iter().enumerate() {
            let height = start_height + i as u64;
            if !header_meets_target(header) {
                return Ok(ConnectOutcome::Invalid);
            }
            let links = if height == 0 {
                true
            } else {
                match self.read_header(height - 1)? {
                    Some(parent) => parent.block_hash() == header.prev_blockhash,
                    None => {
                        if i == 0 {
                            return Ok(ConnectOutcome::Invalid);
                        }
                        false
                    }
                }
            };
            if !links {
                return Ok(ConnectOutcome::Forked(height));
            }
            match self.read_header(height)? {
                Some(existing) if existing.block_hash() != header.block_hash() => {
                    return Ok(ConnectOutcome::Forked(height));
                }
                _ => self.save_header(height, header)?,
            }
        }
        Ok(ConnectOutcome::Accepted)
    }

    /// Creates a new chain forking off `self` at `fork_height`, copying the
    /// parent's headers below the fork point into the new file.
    pub fn fork(&mut self, dir: &Path, fork_height: u64) -> Result<Blockchain, Error> {
        let mut new_chain = Blockchain::open(dir, fork_height, fork_height)?;
        for height in 0..fork_height {
            if let Some(header) = self.read_header(height)? {
                new_chain.save_header(height, &header)?;
            }
        }
        new_chain.parent_base_height = Some(self.base_height);
        Ok(new_chain)
    }

    /// Whether this chain already has `header` recorded at `height`, used to
    /// tell an existing fork apart from a conflicting view of the same
    /// height during binary-search resolution.
    pub fn contains_header(&mut self, height: u64, header: &Header) -> Result<bool, Error> {
        Ok(self.read_header(height)?.map(|h| h.block_hash()) == Some(header.block_hash()))
    }

    /// Discards every header this chain has stored, for overwriting a fork
    /// whose recorded view conflicts with a server's checkpoint-backed one.
    pub fn reset(&mut self) -> Result<(), Error> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    /// Ancestor chain base-heights from this chain up to (and including) the
    /// canonical chain's root, i.e. the fork-point path back to genesis.
    pub fn path(&self) -> Vec<u64> {
        let mut path = vec![self.base_height];
        let mut current = self.parent_base_height;
        while let Some(base) = current {
            path.push(base);
            current = if base == 0 { None } else { Some(0) };
        }
        path
    }

    /// Highest height with an actually-written header, distinct from
    /// [`Blockchain::height`] which reports the pre-extended file length for
    /// the canonical chain (padded out to the checkpoint up front). Assumes
    /// headers are filled in contiguously from height 0, which holds for
    /// every path that writes through `save_header`/`connect_chunk`.
    pub fn tip_height(&mut self) -> Result<u64, Error> {
        let capacity = self.height()?;
        if capacity == 0 || self.read_header(0)?.is_none() {
            return Ok(0);
        }
        let (mut lo, mut hi) = (0u64, capacity - 1);
        while lo < hi {
            let mid = lo + (hi - lo + 1) / 2;
            if self.read_header(mid)?.is_some() {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        Ok(lo + 1)
    }

    pub fn tip_hash(&mut self) -> Result<Option<BlockHash>, Error> {
        let height = self.height()?;
        if height == 0 {
            return Ok(None);
        }
        Ok(self.read_header(height - 1)?.map(|h| h.block_hash()))
    }

    pub fn path_buf(&self) -> &Path {
        &self.path
    }
}

/// Whether `header` satisfies its own declared proof-of-work target,
/// independent of where (or whether) it connects to any known chain.
pub(crate) fn header_meets_target(header: &Header) -> bool {
    let target = Target::from_compact(header.bits);
    let hash = header.block_hash();
    let work = bitcoin::hashes::sha256d::Hash::from_byte_array(hash.to_byte_array());
    Target::from_le_bytes(work.to_byte_array()) <= target
}

/// Index within `chains` of the chain rooted at `base_height`, if any. Chains
/// are keyed by the height they forked at, matching the interface's
/// `base_height` cursor for "which chain am I currently following".
pub fn find_chain_index(chains: &[Blockchain], base_height: u64) -> Option<usize> {
    chains.iter().position(|c| c.base_height == base_height)
}

#[cfg(test)]
mod test {
    use super::*;
    use bitcoin::block::Version;
    use bitcoin::CompactTarget;

    fn sample_header(prev: BlockHash) -> Header {
        Header {
            version: Version::ONE,
            prev_blockhash: prev,
            merkle_root: bitcoin::TxMerkleNode::all_zeros(),
            time: 0,
            bits: CompactTarget::from_consensus(0x207fffff),
            nonce: 0,
        }
    }

    #[test]
    fn save_and_read_header_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut chain = Blockchain::open(dir.path(), 0, 10).unwrap();
        let header = sample_header(BlockHash::all_zeros());
        chain.save_header(0, &header).unwrap();
        let back = chain.read_header(0).unwrap().unwrap();
        assert_eq!(back.block_hash(), header.block_hash());
    }

    #[test]
    fn height_tracks_file_length() {
        let dir = tempfile::tempdir().unwrap();
        let mut chain = Blockchain::open(dir.path(), 0, 0).unwrap();
        assert_eq!(chain.height().unwrap(), 1);
        chain
            .save_header(5, &sample_header(BlockHash::all_zeros()))
            .unwrap();
        assert_eq!(chain.height().unwrap(), 6);
    }

    #[test]
    fn tip_height_tracks_written_headers_not_file_padding() {
        let dir = tempfile::tempdir().unwrap();
        let mut chain = Blockchain::open(dir.path(), 0, 100).unwrap();
        assert_eq!(chain.tip_height().unwrap(), 0);
        let genesis = sample_header(BlockHash::all_zeros());
        chain.save_header(0, &genesis).unwrap();
        chain
            .save_header(1, &sample_header(genesis.block_hash()))
            .unwrap();
        assert_eq!(chain.tip_height().unwrap(), 2);
        assert_eq!(chain.height().unwrap(), 101);
    }

    #[test]
    fn connect_chunk_detects_fork() {
        let dir = tempfile::tempdir().unwrap();
        let mut chain = Blockchain::open(dir.path(), 0, 0).unwrap();
        let genesis = sample_header(BlockHash::all_zeros());
        chain.save_header(0, &genesis).unwrap();
        let diverging = Header {
            time: 1,
            ..sample_header(BlockHash::all_zeros())
        };
        let outcome = chain.connect_chunk(0, &[diverging]).unwrap();
        assert_eq!(outcome, ConnectOutcome::Forked(0));
    }

    #[test]
    fn fork_copies_parent_prefix_and_keys_by_fork_height() {
        let dir = tempfile::tempdir().unwrap();
        let mut parent = Blockchain::open(dir.path(), 0, 10).unwrap();
        let genesis = sample_header(BlockHash::all_zeros());
        parent.save_header(0, &genesis).unwrap();
        let second = sample_header(genesis.block_hash());
        parent.save_header(1, &second).unwrap();

        let mut fork = parent.fork(dir.path(), 2).unwrap();
        assert_eq!(fork.base_height, 2);
        assert_eq!(fork.parent_base_height, Some(0));
        assert_eq!(fork.read_header(0).unwrap().unwrap().block_hash(), genesis.block_hash());
        assert_eq!(fork.read_header(1).unwrap().unwrap().block_hash(), second.block_hash());
    }

    #[test]
    fn contains_header_matches_by_hash_at_height() {
        let dir = tempfile::tempdir().unwrap();
        let mut chain = Blockchain::open(dir.path(), 0, 0).unwrap();
        let genesis = sample_header(BlockHash::all_zeros());
        chain.save_header(0, &genesis).unwrap();
        assert!(chain.contains_header(0, &genesis).unwrap());
        let other = Header { time: 99, ..sample_header(BlockHash::all_zeros()) };
        assert!(!chain.contains_header(0, &other).unwrap());
    }

    #[test]
    fn reset_discards_stored_headers() {
        let dir = tempfile::tempdir().unwrap();
        let mut chain = Blockchain::open(dir.path(), 0, 0).unwrap();
        let genesis = sample_header(BlockHash::all_zeros());
        chain.save_header(0, &genesis).unwrap();
        chain.reset().unwrap();
        assert_eq!(chain.height().unwrap(), 0);
    }

    #[test]
    fn find_chain_index_locates_by_base_height() {
        let dir = tempfile::tempdir().unwrap();
        let canonical = Blockchain::open(dir.path(), 0, 0).unwrap();
        let fork = Blockchain::open(dir.path(), 5, 5).unwrap();
        let chains = vec![canonical, fork];
        assert_eq!(find_chain_index(&chains, 5), Some(1));
        assert_eq!(find_chain_index(&chains, 0), Some(0));
        assert_eq!(find_chain_index(&chains, 99), None);
    }
}
