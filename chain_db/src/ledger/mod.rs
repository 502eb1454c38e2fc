//! The ledger store: per-block ledger states within the rewind window,
//! plus disk snapshots for fast restarts.
//!
//! The transition rules themselves are external; the store only
//! sequences them. It keeps one state per block from the immutable tip
//! to the current tip, so any point within the last k blocks can be
//! rewound to without replay.

pub mod snapshot;

pub use snapshot::{SnapshotId, SnapshotStore};

use crate::component::BlockComponent;
use crate::error::ChainDbError;
use crate::immutable::{ImmutableDb, ImmutableIterator, IterStart};
use naos_common::block::hash_bytes;
use naos_common::{Block, BlockHash, Point};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{info, warn};

/// A ledger transition failure: the block is invalid on this chain.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("block {point} rejected: {reason}")]
pub struct LedgerError {
    pub point: Point,
    pub reason: String,
}

/// A rewind target older than the anchor: no state for it exists any
/// more, and none ever will again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("point {0} is older than the rewind window")]
pub struct PointTooOld(pub Point);

/// One ledger state, reachable from its predecessor by applying
/// exactly one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerState {
    /// The block this state sits at.
    pub tip: Point,
    pub block_number: Option<u64>,
    pub tip_is_ebb: bool,
    /// Rolling digest over the applied chain.
    pub chain_digest: BlockHash,
    /// Opaque application state carried by the concrete ledger.
    pub payload: serde_json::Value,
}

impl LedgerState {
    pub fn genesis() -> Self {
        LedgerState {
            tip: Point::Origin,
            block_number: None,
            tip_is_ebb: false,
            chain_digest: BlockHash::default(),
            payload: serde_json::Value::Null,
        }
    }
}

/// External ledger transition rules.
pub trait Ledger: Send + Sync {
    fn apply(&self, state: &LedgerState, block: &Block) -> Result<LedgerState, LedgerError>;
}

/// Check the envelope every transition shares: parent linkage, number
/// density and slot monotonicity, then fold the block into the digest.
/// Concrete ledgers call this before applying their own rules.
pub fn apply_envelope(state: &LedgerState, block: &Block) -> Result<LedgerState, LedgerError> {
    let header = &block.header;
    let reject = |reason: String| LedgerError {
        point: block.point(),
        reason,
    };

    if header.prev_hash != state.tip.hash() {
        return Err(reject(format!("does not extend {}", state.tip)));
    }
    let expected_number = state.block_number.map_or(0, |n| n + 1);
    if header.number != expected_number {
        return Err(reject(format!(
            "block number {} where {expected_number} expected",
            header.number
        )));
    }
    if let Some(tip_slot) = state.tip.slot() {
        let slot_ok = if state.tip_is_ebb {
            header.slot >= tip_slot
        } else {
            header.slot > tip_slot
        };
        if !slot_ok {
            return Err(reject(format!("slot {} not after {tip_slot}", header.slot)));
        }
    }

    let mut digest_input = state.chain_digest.to_vec();
    digest_input.extend_from_slice(header.hash.as_ref());
    Ok(LedgerState {
        tip: block.point(),
        block_number: Some(header.number),
        tip_is_ebb: header.is_ebb,
        chain_digest: hash_bytes(&digest_input),
        payload: state.payload.clone(),
    })
}

/// A ledger that applies the shared envelope checks and nothing more.
pub struct HeaderLedger;

impl Ledger for HeaderLedger {
    fn apply(&self, state: &LedgerState, block: &Block) -> Result<LedgerState, LedgerError> {
        apply_envelope(state, block)
    }
}

/// The in-memory chain of ledger states, anchored at the immutable
/// tip.
#[derive(Clone)]
pub struct LedgerDb {
    ledger: Arc<dyn Ledger>,
    /// Front is the anchor state; back is the current tip state.
    states: VecDeque<LedgerState>,
}

impl LedgerDb {
    pub fn new(ledger: Arc<dyn Ledger>, anchor: LedgerState) -> Self {
        let mut states = VecDeque::new();
        states.push_back(anchor);
        LedgerDb { ledger, states }
    }

    /// The state at the current tip.
    pub fn current(&self) -> &LedgerState {
        self.states.back().expect("at least the anchor state")
    }

    /// The state at the immutable tip.
    pub fn anchor(&self) -> &LedgerState {
        self.states.front().expect("at least the anchor state")
    }

    /// States held, the anchor included; always at least 1.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Apply a block on top of the current tip. On failure the store is
    /// unchanged.
    pub fn push(&mut self, block: &Block) -> Result<(), LedgerError> {
        let next = self.ledger.apply(self.current(), block)?;
        self.states.push_back(next);
        Ok(())
    }

    /// A view whose tip is `point`. Fails when the point is older than
    /// the anchor: rewinding past it is impossible.
    pub fn rewind(&self, point: &Point) -> Result<LedgerDb, PointTooOld> {
        let index = self
            .states
            .iter()
            .rposition(|state| state.tip == *point)
            .ok_or(PointTooOld(*point))?;
        let states = self.states.iter().take(index + 1).cloned().collect();
        Ok(LedgerDb {
            ledger: Arc::clone(&self.ledger),
            states,
        })
    }

    pub fn state_at(&self, point: &Point) -> Option<&LedgerState> {
        self.states.iter().rev().find(|state| state.tip == *point)
    }

    /// Drop states preceding the new immutable tip after a
    /// copy-to-immutable cycle.
    pub fn advance_anchor(&mut self, point: &Point) {
        if !self.states.iter().any(|state| state.tip == *point) {
            warn!("anchor {point} not in ledger history");
            return;
        }
        while self.states.front().map(|state| &state.tip != point).unwrap_or(false) {
            self.states.pop_front();
        }
    }
}

/// Restore the ledger at the immutable tip: newest valid snapshot plus
/// a replay of the immutable blocks past it. Damaged snapshots are
/// deleted and the next older one is tried; with none left the whole
/// immutable chain is replayed from genesis.
pub fn restore(
    ledger: Arc<dyn Ledger>,
    snapshots: &SnapshotStore,
    immutable: &Arc<ImmutableDb>,
) -> Result<LedgerDb, ChainDbError> {
    let mut candidates = snapshots.list().map_err(from_anyhow)?;

    while let Some(id) = candidates.pop() {
        if !immutable.contains(&id.point()) {
            // Snapshot of a block we no longer store (e.g. truncated
            // during recovery); useless, drop it
            warn!(slot = id.slot, "snapshot is not on the immutable chain, deleting");
            snapshots.delete(&id).map_err(from_anyhow)?;
            continue;
        }
        match snapshots.load(&id) {
            Ok(state) => match replay(&ledger, state, immutable) {
                Ok(anchor) => {
                    info!(slot = id.slot, "ledger restored from snapshot");
                    return Ok(LedgerDb::new(ledger, anchor));
                }
                Err(err) => {
                    warn!(slot = id.slot, "snapshot replay failed: {err}, deleting");
                    snapshots.delete(&id).map_err(from_anyhow)?;
                }
            },
            Err(err) => {
                warn!(slot = id.slot, "snapshot unusable: {err:#}, deleting");
                snapshots.delete(&id).map_err(from_anyhow)?;
            }
        }
    }

    info!("no usable snapshot, replaying from genesis");
    let anchor = replay(&ledger, LedgerState::genesis(), immutable)?;
    Ok(LedgerDb::new(ledger, anchor))
}

fn replay(
    ledger: &Arc<dyn Ledger>,
    mut state: LedgerState,
    immutable: &Arc<ImmutableDb>,
) -> Result<LedgerState, ChainDbError> {
    let start = match state.tip {
        Point::Origin => IterStart::Beginning,
        point => IterStart::After(point),
    };
    let mut stream =
        ImmutableIterator::open(Arc::clone(immutable), start, None, BlockComponent::Block)?;
    let mut replayed = 0u64;
    while let Some(item) = stream.next_item() {
        let (_, value) = item?;
        let block = value.into_block().expect("requested block component");
        state = ledger
            .apply(&state, &block)
            .map_err(|err| ChainDbError::Corruption(format!("immutable replay: {err}")))?;
        replayed += 1;
    }
    if replayed > 0 {
        info!(replayed, tip = %state.tip, "immutable blocks replayed");
    }
    Ok(state)
}

fn from_anyhow(err: anyhow::Error) -> ChainDbError {
    ChainDbError::Corruption(format!("{err:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValidationPolicy;
    use crate::immutable::ChunkInfo;

    fn chain(count: u64) -> Vec<Block> {
        let mut blocks = Vec::new();
        let mut prev = None;
        for number in 0..count {
            let block = Block::new(number + 1, number, prev, false, vec![number as u8]);
            prev = Some(block.hash());
            blocks.push(block);
        }
        blocks
    }

    fn ledger() -> Arc<dyn Ledger> {
        Arc::new(HeaderLedger)
    }

    #[test]
    fn push_and_rewind() {
        let blocks = chain(4);
        let mut db = LedgerDb::new(ledger(), LedgerState::genesis());
        for block in &blocks {
            db.push(block).unwrap();
        }
        assert_eq!(db.current().tip, blocks[3].point());
        assert_eq!(db.len(), 5);

        let rewound = db.rewind(&blocks[1].point()).unwrap();
        assert_eq!(rewound.current().tip, blocks[1].point());
        assert_eq!(rewound.len(), 3);

        // Past the anchor
        assert!(db.rewind(&Point::Specific(99, BlockHash::new([9; 32]))).is_err());

        // The original is untouched
        assert_eq!(db.current().tip, blocks[3].point());
    }

    #[test]
    fn push_rejects_non_linking_block() {
        let blocks = chain(2);
        let mut db = LedgerDb::new(ledger(), LedgerState::genesis());
        db.push(&blocks[0]).unwrap();

        let stranger = Block::new(5, 1, Some(BlockHash::new([7; 32])), false, vec![]);
        let err = db.push(&stranger).unwrap_err();
        assert_eq!(err.point, stranger.point());
        // State unchanged
        assert_eq!(db.current().tip, blocks[0].point());
    }

    #[test]
    fn digest_distinguishes_chains() {
        let blocks = chain(2);
        let fork = Block::new(2, 1, Some(blocks[0].hash()), false, vec![0xff]);

        let mut a = LedgerDb::new(ledger(), LedgerState::genesis());
        a.push(&blocks[0]).unwrap();
        a.push(&blocks[1]).unwrap();

        let mut b = LedgerDb::new(ledger(), LedgerState::genesis());
        b.push(&blocks[0]).unwrap();
        b.push(&fork).unwrap();

        assert_ne!(a.current().chain_digest, b.current().chain_digest);
    }

    #[test]
    fn advance_anchor_prunes_history() {
        let blocks = chain(5);
        let mut db = LedgerDb::new(ledger(), LedgerState::genesis());
        for block in &blocks {
            db.push(block).unwrap();
        }
        db.advance_anchor(&blocks[2].point());
        assert_eq!(db.anchor().tip, blocks[2].point());
        assert_eq!(db.len(), 3);
        assert!(db.rewind(&blocks[0].point()).is_err());
    }

    fn immutable_with(blocks: &[Block], dir: &std::path::Path) -> Arc<ImmutableDb> {
        let db = Arc::new(
            ImmutableDb::open(dir, ChunkInfo::new(100), ValidationPolicy::ValidateAll).unwrap(),
        );
        for block in blocks {
            db.append(block).unwrap();
        }
        db
    }

    #[test]
    fn restore_replays_from_genesis_without_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let blocks = chain(6);
        let immutable = immutable_with(&blocks, &dir.path().join("immutable"));
        let snapshots = SnapshotStore::open(dir.path().join("ledger"), 2).unwrap();

        let db = restore(ledger(), &snapshots, &immutable).unwrap();
        assert_eq!(db.current().tip, blocks[5].point());
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn restore_uses_snapshot_and_replays_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let blocks = chain(6);
        let immutable = immutable_with(&blocks, &dir.path().join("immutable"));
        let snapshots = SnapshotStore::open(dir.path().join("ledger"), 2).unwrap();

        // Snapshot at block 2 by replaying the prefix
        let mut reference = LedgerDb::new(ledger(), LedgerState::genesis());
        for block in &blocks[..3] {
            reference.push(block).unwrap();
        }
        snapshots.write(reference.current()).unwrap();

        let db = restore(ledger(), &snapshots, &immutable).unwrap();
        assert_eq!(db.current().tip, blocks[5].point());

        // The digest matches a full replay
        let mut full = LedgerDb::new(ledger(), LedgerState::genesis());
        for block in &blocks {
            full.push(block).unwrap();
        }
        assert_eq!(db.current().chain_digest, full.current().chain_digest);
    }

    #[test]
    fn restore_falls_back_past_damaged_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let blocks = chain(6);
        let immutable = immutable_with(&blocks, &dir.path().join("immutable"));
        let ledger_dir = dir.path().join("ledger");
        let snapshots = SnapshotStore::open(&ledger_dir, 2).unwrap();

        let mut reference = LedgerDb::new(ledger(), LedgerState::genesis());
        for block in &blocks[..2] {
            reference.push(block).unwrap();
        }
        snapshots.write(reference.current()).unwrap();
        for block in &blocks[2..4] {
            reference.push(block).unwrap();
        }
        snapshots.write(reference.current()).unwrap();

        // Damage the newest snapshot
        let newest = snapshots.list().unwrap().pop().unwrap();
        std::fs::write(
            snapshot::snapshot_path(&ledger_dir, &newest),
            b"garbage",
        )
        .unwrap();

        let db = restore(ledger(), &snapshots, &immutable).unwrap();
        assert_eq!(db.current().tip, blocks[5].point());
        // The damaged snapshot is gone
        assert_eq!(snapshots.list().unwrap().len(), 1);
    }
}
