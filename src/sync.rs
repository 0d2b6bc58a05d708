//! Header sync state machine: drives one interface through
//! `Verification -> Backward -> Binary -> CatchUp -> Default`, finding the
//! exact height its reported chain diverges from ours (if at all) before
//! trusting any of its headers.

use crate::blockchain::{find_chain_index, header_meets_target, Blockchain, ConnectOutcome};
use crate::interface::{Interface, Mode};
use crate::wire::{self, BlockHeaderTip};
use bitcoin::block::Header;
use std::path::Path;

/// What the supervisor should do next as a result of feeding the state
/// machine one header or chunk.
#[derive(Debug, PartialEq, Eq)]
pub enum SyncAction {
    /// Request a single header at the given height (backward step or binary
    /// probe).
    RequestHeader(u64),
    /// Request a chunk of headers starting at the given height.
    RequestChunk(u64),
    /// The interface is caught up; no further sync requests needed right now.
    Idle,
    /// The interface lied about its chain or sent something unusable;
    /// disconnect (and, if `blacklist` is set, don't retry it).
    Disconnect { blacklist: bool },
}

/// Maximum headers requested in one `blockchain.block.headers` call.
pub const MAX_CHUNK_SIZE: u64 = 2016;

/// `max(checkpoint, tip - 2 * delta)`: geometric backward-step formula, where
/// `delta` grows as `tip - height` each failed step so a badly-forked server
/// is probed in widening jumps rather than one height at a time.
pub fn next_backward_height(checkpoint: u64, tip: u64, delta: u64) -> u64 {
    let stepped_back = tip.saturating_sub(2 * delta);
    std::cmp::max(checkpoint, stepped_back)
}

/// Clips a chunk request of `count` headers starting at `base` so it never
/// reads past the baked-in checkpoint, and decides whether the request needs
/// a checkpoint proof attached: a range straddling or ending at the
/// checkpoint is asked with proof (the server must show its last header is
/// the checkpoint header), a range entirely above it is asked without one.
pub fn clip_chunk_request(base: u64, count: u64, checkpoint_height: u64) -> (u64, bool) {
    if base > checkpoint_height {
        return (count, false);
    }
    let last = base + count.saturating_sub(1);
    let clipped_last = std::cmp::min(last, checkpoint_height);
    let clipped_count = clipped_last - base + 1;
    (clipped_count, true)
}

/// Whether a catch-up step this far from the interface's reported tip should
/// pull a whole 2016-header chunk instead of a single header.
fn catch_up_step(interface: &Interface, next: u64) -> SyncAction {
    let tip = interface.tip.as_ref().map(|t| t.height).unwrap_or(next);
    if tip.saturating_sub(next) >= MAX_CHUNK_SIZE {
        SyncAction::RequestChunk(next)
    } else {
        SyncAction::RequestHeader(next)
    }
}

/// Searches every known chain (canonical plus forks) for one this header
/// would extend, mirroring the fork-point search looking across every
/// blockchain the core is tracking, not only the one `interface` currently
/// follows.
fn find_connecting_chain(blockchains: &mut [Blockchain], height: u64, header: &Header) -> Result<Option<usize>, crate::error::Error> {
    for (i, chain) in blockchains.iter_mut().enumerate() {
        if chain.can_connect(height, header)? {
            return Ok(Some(i));
        }
    }
    Ok(None)
}

/// Handles a single-header response/notification while `interface` is in
/// `Backward` mode: does this height's header chain into a chain we already
/// know about?
pub fn on_header_backward(
    interface: &mut Interface,
    blockchains: &mut Vec<Blockchain>,
    dir: &Path,
    height: u64,
    header: &Header,
    checkpoint: u64,
) -> Result<SyncAction, crate::error::Error> {
    let known = find_connecting_chain(blockchains, height, header)?;
    if known.is_some() || height == 0 {
        if let Some(idx) = known {
            interface.base_height = blockchains[idx].base_height;
        }
        interface.good = height;
        interface.mode = Mode::Binary;
        let bad = interface.bad.unwrap_or(height + 1);
        if bad <= interface.good + 1 {
            return resolve_binary(interface, blockchains, dir, checkpoint);
        }
        let probe = (interface.good + bad) / 2;
        return Ok(SyncAction::RequestHeader(probe));
    }
    interface.bad = Some(height);
    interface.bad_header = Some(BlockHeaderTip {
        height,
        hex: hex::encode(bitcoin::consensus::serialize(header)),
    });
    let tip = interface.tip.as_ref().map(|t| t.height).unwrap_or(height);
    let delta = tip.saturating_sub(height).max(1);
    let next = next_backward_height(checkpoint, height, delta);
    if height <= checkpoint || next == height {
        return Ok(SyncAction::Disconnect { blacklist: true });
    }
    Ok(SyncAction::RequestHeader(next))
}

/// Handles a single-header response while `interface` is in `Binary` mode,
/// narrowing the `[good, bad)` interval until they're adjacent, at which
/// point the fork point is `good` and `resolve_binary` decides what to do
/// with it.
pub fn on_header_binary(
    interface: &mut Interface,
    blockchains: &mut Vec<Blockchain>,
    dir: &Path,
    height: u64,
    header: &Header,
    checkpoint: u64,
) -> Result<SyncAction, crate::error::Error> {
    match find_connecting_chain(blockchains, height, header)? {
        Some(idx) => {
            interface.good = height;
            interface.base_height = blockchains[idx].base_height;
        }
        None => {
            interface.bad = Some(height);
            interface.bad_header = Some(BlockHeaderTip {
                height,
                hex: hex::encode(bitcoin::consensus::serialize(header)),
            });
        }
    }
    let bad = interface.bad.unwrap();
    if bad <= interface.good + 1 {
        return resolve_binary(interface, blockchains, dir, checkpoint);
    }
    let probe = (interface.good + bad) / 2;
    Ok(SyncAction::RequestHeader(probe))
}

/// The binary search has converged (`bad == good + 1`): decide whether this
/// is a join onto an existing fork, a reorg back onto that fork's parent, an
/// overwrite of a fork whose recorded view conflicts with this server's, the
/// start of a brand new fork, or simply catching the current chain up,
/// before moving the interface into `CatchUp` (or leaving it in `Default` if
/// nothing further is needed).
fn resolve_binary(
    interface: &mut Interface,
    blockchains: &mut Vec<Blockchain>,
    dir: &Path,
    checkpoint: u64,
) -> Result<SyncAction, crate::error::Error> {
    let bad = match interface.bad {
        Some(bad) => bad,
        None => return Ok(SyncAction::Disconnect { blacklist: true }),
    };
    let good = interface.good;
    if bad < checkpoint {
        return Ok(SyncAction::Disconnect { blacklist: true });
    }
    let Some(bad_tip) = interface.bad_header.clone() else {
        return Ok(SyncAction::Disconnect { blacklist: true });
    };
    let bad_header = wire::parse_header_hex(&bad_tip.hex)?;
    if !header_meets_target(&bad_header) {
        return Ok(SyncAction::Disconnect { blacklist: true });
    }

    if let Some(branch_idx) = find_chain_index(blockchains, bad) {
        if blockchains[branch_idx].contains_header(bad, &bad_header)? {
            interface.base_height = blockchains[branch_idx].base_height;
            interface.mode = Mode::Default;
            interface.clear_binary_cursors();
            return Ok(SyncAction::Idle);
        }
        if let Some(parent_base) = blockchains[branch_idx].parent_base_height {
            if let Some(parent_idx) = find_chain_index(blockchains, parent_base) {
                if blockchains[parent_idx].contains_header(bad, &bad_header)? {
                    interface.base_height = blockchains[parent_idx].base_height;
                    interface.mode = Mode::Default;
                    interface.clear_binary_cursors();
                    return Ok(SyncAction::Idle);
                }
            }
        }
        blockchains[branch_idx].reset()?;
        blockchains[branch_idx].save_header(bad, &bad_header)?;
        blockchains[branch_idx].catch_up = Some(interface.server_key.clone());
        interface.base_height = blockchains[branch_idx].base_height;
        interface.mode = Mode::CatchUp;
        interface.clear_binary_cursors();
        return Ok(catch_up_step(interface, bad + 1));
    }

    let Some(current_idx) = find_chain_index(blockchains, interface.base_height) else {
        return Ok(SyncAction::Disconnect { blacklist: true });
    };
    let current_height = blockchains[current_idx].tip_height()?;
    if current_height > good {
        if !blockchains[current_idx].contains_header(bad, &bad_header)? {
            let mut new_chain = blockchains[current_idx].fork(dir, bad)?;
            new_chain.save_header(bad, &bad_header)?;
            new_chain.catch_up = Some(interface.server_key.clone());
            blockchains.push(new_chain);
            interface.base_height = bad;
            interface.mode = Mode::CatchUp;
            interface.clear_binary_cursors();
            return Ok(catch_up_step(interface, bad + 1));
        }
        interface.mode = Mode::Default;
        interface.clear_binary_cursors();
        return Ok(SyncAction::Idle);
    }

    let tip = interface.tip.as_ref().map(|t| t.height);
    let should_catch_up = blockchains[current_idx].catch_up.is_none() && tip.map(|t| current_height < t).unwrap_or(false);
    interface.clear_binary_cursors();
    if should_catch_up {
        blockchains[current_idx].catch_up = Some(interface.server_key.clone());
        interface.mode = Mode::CatchUp;
        Ok(catch_up_step(interface, current_height + 1))
    } else {
        interface.mode = Mode::Default;
        Ok(SyncAction::Idle)
    }
}

/// Handles a single-header response while `interface` is in `CatchUp` mode:
/// the normal catch-up path is one header at a time, escalating to a
/// `RequestChunk` only once the remaining distance to the interface's
/// reported tip is at least [`MAX_CHUNK_SIZE`].
pub fn on_header_catch_up(interface: &mut Interface, our_chain: &mut Blockchain, height: u64, header: &Header) -> Result<SyncAction, crate::error::Error> {
    if our_chain.can_connect(height, header)? {
        our_chain.save_header(height, header)?;
        let tip = interface.tip.as_ref().map(|t| t.height);
        if tip.map(|t| height < t).unwrap_or(false) {
            Ok(catch_up_step(interface, height + 1))
        } else {
            interface.mode = Mode::Default;
            interface.clear_binary_cursors();
            our_chain.catch_up = None;
            Ok(SyncAction::Idle)
        }
    } else {
        interface.mode = Mode::Backward;
        interface.bad = Some(height);
        interface.bad_header = Some(BlockHeaderTip {
            height,
            hex: hex::encode(bitcoin::consensus::serialize(header)),
        });
        Ok(SyncAction::RequestHeader(height.saturating_sub(1)))
    }
}

/// Handles a chunk response while `interface` is in `CatchUp` mode: connect
/// as much of the chunk as links up, then either keep requesting forward
/// (as a chunk or a single header, depending on remaining distance) or fall
/// back to `Backward` if the chunk didn't connect at all (the server's chain
/// moved under us mid-sync).
pub fn on_block_headers_catch_up(interface: &mut Interface, our_chain: &mut Blockchain, start_height: u64, headers: &[Header]) -> Result<SyncAction, crate::error::Error> {
    if headers.len() as u64 > MAX_CHUNK_SIZE {
        return Ok(SyncAction::Disconnect { blacklist: true });
    }
    match our_chain.connect_chunk(start_height, headers)? {
        ConnectOutcome::Accepted => {
            let new_height = start_height + headers.len() as u64;
            let caught_up = interface.tip.as_ref().map(|t| new_height > t.height).unwrap_or(true);
            if caught_up {
                interface.mode = Mode::Default;
                interface.clear_binary_cursors();
                our_chain.catch_up = None;
                Ok(SyncAction::Idle)
            } else {
                Ok(catch_up_step(interface, new_height))
            }
        }
        ConnectOutcome::Forked(height) => {
            interface.mode = Mode::Backward;
            interface.good = height.saturating_sub(1);
            interface.bad = Some(height);
            let idx = (height - start_height) as usize;
            if let Some(bad_header) = headers.get(idx) {
                interface.bad_header = Some(BlockHeaderTip {
                    height,
                    hex: hex::encode(bitcoin::consensus::serialize(bad_header)),
                });
            }
            Ok(SyncAction::RequestHeader(height.saturating_sub(1)))
        }
        ConnectOutcome::Invalid => Ok(SyncAction::Disconnect { blacklist: true }),
    }
}

/// In `Default` mode a single `blockchain.headers.subscribe` notification
/// either extends the tip directly or, if it doesn't connect, drops the
/// interface back to `Backward` to re-locate the fork point.
pub fn on_notify_header(interface: &mut Interface, our_chain: &mut Blockchain, height: u64, header: &Header) -> Result<SyncAction, crate::error::Error> {
    if our_chain.can_connect(height, header)? {
        our_chain.save_header(height, header)?;
        Ok(SyncAction::Idle)
    } else {
        interface.mode = Mode::Backward;
        interface.bad = Some(height);
        interface.bad_header = Some(BlockHeaderTip {
            height,
            hex: hex::encode(bitcoin::consensus::serialize(header)),
        });
        Ok(SyncAction::RequestHeader(height.saturating_sub(1)))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::server_key::{Protocol, ServerKey};
    use bitcoin::block::Version;
    use bitcoin::hashes::Hash;
    use bitcoin::{BlockHash, CompactTarget};
    use tokio::net::{TcpListener, TcpStream};

    fn sample_header(prev: BlockHash, time: u32) -> Header {
        Header {
            version: Version::ONE,
            prev_blockhash: prev,
            merkle_root: bitcoin::TxMerkleNode::all_zeros(),
            time,
            bits: CompactTarget::from_consensus(0x207fffff),
            nonce: 0,
        }
    }

    async fn test_interface(base_height: u64) -> Interface {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connect_res, accept_res) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let stream = connect_res.unwrap();
        let _accepted = accept_res.unwrap();
        let (_read, write) = tokio::io::split(stream);
        Interface::new(ServerKey::new("h", 1, Protocol::Tcp), write, base_height)
    }

    #[test]
    fn backward_formula_floors_at_checkpoint() {
        assert_eq!(next_backward_height(100, 1000, 500), 100);
        assert_eq!(next_backward_height(0, 1000, 100), 800);
    }

    #[test]
    fn backward_formula_never_goes_negative() {
        assert_eq!(next_backward_height(0, 10, 1000), 0);
    }

    #[test]
    fn clip_chunk_request_leaves_range_above_checkpoint_unproved() {
        assert_eq!(clip_chunk_request(700_000, 2016, 695_000), (2016, false));
    }

    #[test]
    fn clip_chunk_request_clips_straddling_range_with_proof() {
        assert_eq!(clip_chunk_request(694_000, 2016, 695_000), (1001, true));
    }

    #[test]
    fn clip_chunk_request_keeps_range_at_or_below_checkpoint_with_proof() {
        assert_eq!(clip_chunk_request(0, 2016, 695_000), (2016, true));
    }

    #[tokio::test]
    async fn backward_carries_the_accumulated_bad_cursor_into_binary() {
        let dir = tempfile::tempdir().unwrap();
        let mut chain = Blockchain::open(dir.path(), 0, 0).unwrap();
        let genesis = sample_header(BlockHash::all_zeros(), 0);
        chain.save_header(0, &genesis).unwrap();
        let h1 = sample_header(genesis.block_hash(), 1);
        chain.save_header(1, &h1).unwrap();
        let mut blockchains = vec![chain];
        let mut iface = test_interface(0).await;
        iface.mode = Mode::Backward;
        iface.tip = Some(BlockHeaderTip { height: 10, hex: String::new() });
        // Two widening backward probes land on an unknown height first...
        iface.bad = Some(5);
        // ...then the third probe (height 1) connects into our known chain.
        let action = on_header_backward(&mut iface, &mut blockchains, dir.path(), 1, &h1, 0).unwrap();
        assert_eq!(iface.mode, Mode::Binary);
        assert_eq!(iface.good, 1);
        // The binary interval must be [good=1, bad=5], not [good=1, bad=tip=10]:
        // bad came from the prior backward step, not a reset to the interface's tip.
        assert_eq!(action, SyncAction::RequestHeader(3));
    }

    #[tokio::test]
    async fn resolve_binary_joins_existing_fork() {
        let dir = tempfile::tempdir().unwrap();
        let mut canonical = Blockchain::open(dir.path(), 0, 0).unwrap();
        let genesis = sample_header(BlockHash::all_zeros(), 0);
        canonical.save_header(0, &genesis).unwrap();
        let mut fork = canonical.fork(dir.path(), 5).unwrap();
        let fork_header = sample_header(genesis.block_hash(), 99);
        fork.save_header(5, &fork_header).unwrap();
        let mut blockchains = vec![canonical, fork];

        let mut iface = test_interface(0).await;
        iface.mode = Mode::Binary;
        iface.good = 4;
        iface.bad = Some(5);
        iface.bad_header = Some(BlockHeaderTip {
            height: 5,
            hex: hex::encode(bitcoin::consensus::serialize(&fork_header)),
        });

        let action = resolve_binary(&mut iface, &mut blockchains, dir.path(), 0).unwrap();
        assert_eq!(action, SyncAction::Idle);
        assert_eq!(iface.mode, Mode::Default);
        assert_eq!(iface.base_height, 5);
        assert_eq!(blockchains.len(), 2);
    }

    #[tokio::test]
    async fn resolve_binary_reorgs_onto_forks_parent() {
        let dir = tempfile::tempdir().unwrap();
        let mut canonical = Blockchain::open(dir.path(), 0, 0).unwrap();
        let genesis = sample_header(BlockHash::all_zeros(), 0);
        canonical.save_header(0, &genesis).unwrap();
        let canonical_h5 = sample_header(genesis.block_hash(), 5);
        canonical.save_header(5, &canonical_h5).unwrap();
        // An unrelated fork exists at height 5 but does NOT contain the header
        // this server proved; its parent (canonical) does.
        let mut fork = canonical.fork(dir.path(), 5).unwrap();
        let unrelated = sample_header(genesis.block_hash(), 42);
        fork.save_header(5, &unrelated).unwrap();
        let mut blockchains = vec![canonical, fork];

        let mut iface = test_interface(0).await;
        iface.mode = Mode::Binary;
        iface.good = 4;
        iface.bad = Some(5);
        iface.bad_header = Some(BlockHeaderTip {
            height: 5,
            hex: hex::encode(bitcoin::consensus::serialize(&canonical_h5)),
        });

        let action = resolve_binary(&mut iface, &mut blockchains, dir.path(), 0).unwrap();
        assert_eq!(action, SyncAction::Idle);
        assert_eq!(iface.mode, Mode::Default);
        assert_eq!(iface.base_height, 0);
    }

    #[tokio::test]
    async fn resolve_binary_overwrites_conflicting_fork() {
        let dir = tempfile::tempdir().unwrap();
        let mut canonical = Blockchain::open(dir.path(), 0, 0).unwrap();
        let genesis = sample_header(BlockHash::all_zeros(), 0);
        canonical.save_header(0, &genesis).unwrap();
        let mut fork = canonical.fork(dir.path(), 5).unwrap();
        let stale = sample_header(genesis.block_hash(), 7);
        fork.save_header(5, &stale).unwrap();
        let mut blockchains = vec![canonical, fork];

        let mut iface = test_interface(0).await;
        iface.mode = Mode::Binary;
        iface.good = 4;
        iface.bad = Some(5);
        let fresh = sample_header(genesis.block_hash(), 123);
        iface.bad_header = Some(BlockHeaderTip {
            height: 5,
            hex: hex::encode(bitcoin::consensus::serialize(&fresh)),
        });

        let action = resolve_binary(&mut iface, &mut blockchains, dir.path(), 0).unwrap();
        assert_eq!(action, SyncAction::RequestHeader(6));
        assert_eq!(iface.mode, Mode::CatchUp);
        assert_eq!(iface.base_height, 5);
        assert_eq!(blockchains[1].catch_up, Some(iface.server_key.clone()));
        assert_eq!(blockchains[1].read_header(5).unwrap().unwrap().block_hash(), fresh.block_hash());
    }

    #[tokio::test]
    async fn resolve_binary_creates_new_fork_when_none_exists() {
        let dir = tempfile::tempdir().unwrap();
        let mut canonical = Blockchain::open(dir.path(), 0, 0).unwrap();
        let genesis = sample_header(BlockHash::all_zeros(), 0);
        canonical.save_header(0, &genesis).unwrap();
        for (h, t) in [(1u64, 1u32), (2, 2), (3, 3), (4, 4), (5, 5)] {
            let prev = canonical.read_header(h - 1).unwrap().unwrap().block_hash();
            canonical.save_header(h, &sample_header(prev, t)).unwrap();
        }
        let mut blockchains = vec![canonical];

        let mut iface = test_interface(0).await;
        iface.mode = Mode::Binary;
        iface.good = 4;
        iface.bad = Some(5);
        let divergent = sample_header(blockchains[0].read_header(4).unwrap().unwrap().block_hash(), 500);
        iface.bad_header = Some(BlockHeaderTip {
            height: 5,
            hex: hex::encode(bitcoin::consensus::serialize(&divergent)),
        });

        let action = resolve_binary(&mut iface, &mut blockchains, dir.path(), 0).unwrap();
        assert_eq!(action, SyncAction::RequestHeader(6));
        assert_eq!(iface.mode, Mode::CatchUp);
        assert_eq!(iface.base_height, 5);
        assert_eq!(blockchains.len(), 2);
        assert_eq!(blockchains[1].base_height, 5);
        assert_eq!(blockchains[1].parent_base_height, Some(0));
    }

    #[tokio::test]
    async fn catch_up_single_header_requests_until_far_behind_then_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let mut chain = Blockchain::open(dir.path(), 0, 0).unwrap();
        let genesis = sample_header(BlockHash::all_zeros(), 0);
        chain.save_header(0, &genesis).unwrap();
        let h1 = sample_header(genesis.block_hash(), 1);

        let mut iface = test_interface(0).await;
        iface.mode = Mode::CatchUp;
        iface.tip = Some(BlockHeaderTip { height: 3000, hex: String::new() });

        let action = on_header_catch_up(&mut iface, &mut chain, 1, &h1).unwrap();
        assert_eq!(action, SyncAction::RequestChunk(2));

        iface.tip = Some(BlockHeaderTip { height: 2, hex: String::new() });
        let action = on_header_catch_up(&mut iface, &mut chain, 1, &h1).unwrap();
        assert_eq!(action, SyncAction::RequestHeader(2));
    }

    #[tokio::test]
    async fn catch_up_completes_and_clears_chain_catch_up_marker() {
        let dir = tempfile::tempdir().unwrap();
        let mut chain = Blockchain::open(dir.path(), 0, 0).unwrap();
        let genesis = sample_header(BlockHash::all_zeros(), 0);
        chain.save_header(0, &genesis).unwrap();
        let h1 = sample_header(genesis.block_hash(), 1);

        let mut iface = test_interface(0).await;
        iface.mode = Mode::CatchUp;
        iface.tip = Some(BlockHeaderTip { height: 1, hex: String::new() });
        chain.catch_up = Some(iface.server_key.clone());

        let action = on_header_catch_up(&mut iface, &mut chain, 1, &h1).unwrap();
        assert_eq!(action, SyncAction::Idle);
        assert_eq!(iface.mode, Mode::Default);
        assert_eq!(chain.catch_up, None);
    }

    #[tokio::test]
    async fn catch_up_header_that_cannot_connect_falls_back_to_backward() {
        let dir = tempfile::tempdir().unwrap();
        let mut chain = Blockchain::open(dir.path(), 0, 0).unwrap();
        let genesis = sample_header(BlockHash::all_zeros(), 0);
        chain.save_header(0, &genesis).unwrap();
        let unrelated = sample_header(BlockHash::all_zeros(), 9);

        let mut iface = test_interface(0).await;
        iface.mode = Mode::CatchUp;
        iface.tip = Some(BlockHeaderTip { height: 10, hex: String::new() });

        let action = on_header_catch_up(&mut iface, &mut chain, 3, &unrelated).unwrap();
        assert_eq!(action, SyncAction::RequestHeader(2));
        assert_eq!(iface.mode, Mode::Backward);
        assert_eq!(iface.bad, Some(3));
    }
}
