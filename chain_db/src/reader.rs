//! Readers: streaming followers of the current chain.
//!
//! A reader tracks its own position and serves roll-forward and
//! roll-back instructions as the chain evolves. Positions on the
//! immutable prefix are served through an immutable-store iterator;
//! positions within the in-memory fragment straight from it. The
//! state machine follows the handoff both ways: an immutable iterator
//! that catches up with the immutable tip hands over to the in-memory
//! fragment, and a position that drops below the fragment anchor hands
//! back to the immutable store.

use crate::component::{BlockComponent, ComponentValue};
use crate::db::ChainDbInner;
use crate::error::ChainDbError;
use crate::immutable::{ImmutableDb, ImmutableIterator, IterStart};
use naos_common::{AnchoredFragment, Header, Point};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::debug;

/// One instruction for a chain follower.
#[derive(Debug)]
pub enum ChainUpdate {
    RollForward(ComponentValue),
    RollBack(Point),
}

/// The next message this reader owes its consumer.
#[derive(Debug, Clone, Copy)]
pub(crate) enum RollState {
    RollBackTo(Point),
    RollForwardFrom(Point),
}

impl RollState {
    fn point(&self) -> Point {
        match self {
            RollState::RollBackTo(point) | RollState::RollForwardFrom(point) => *point,
        }
    }
}

pub(crate) enum ReaderPosition {
    /// Logical position at genesis; no resources held.
    Init,
    /// Position within the in-memory fragment.
    InMem(RollState),
    /// Position on the immutable prefix, with an open iterator.
    InImmDb(RollState, ImmutableIterator),
    Closed,
}

/// The part of a reader the database mutates on chain switches.
pub(crate) struct ReaderShared {
    position: Mutex<ReaderPosition>,
}

impl ReaderShared {
    pub(crate) fn new() -> Self {
        ReaderShared {
            position: Mutex::new(ReaderPosition::Init),
        }
    }

    /// Re-anchor after a chain switch. If the reader's point is still
    /// on the new chain (or the immutable prefix under it) nothing
    /// changes; otherwise the reader owes a rollback instruction.
    pub(crate) fn on_switch_fork(
        &self,
        rollback_point: &Point,
        new_chain: &AnchoredFragment,
        immutable: &ImmutableDb,
    ) {
        let mut position = self.position.lock().unwrap();
        let point = match &*position {
            ReaderPosition::Init | ReaderPosition::Closed => return,
            ReaderPosition::InMem(roll) | ReaderPosition::InImmDb(roll, _) => roll.point(),
        };
        if point == Point::Origin || new_chain.contains(&point) || immutable.contains(&point) {
            return;
        }
        debug!(reader_at = %point, rollback = %rollback_point, "reader left behind by chain switch");
        *position = ReaderPosition::InMem(RollState::RollBackTo(*rollback_point));
    }

    pub(crate) fn close(&self) {
        *self.position.lock().unwrap() = ReaderPosition::Closed;
    }
}

/// A handle following the current chain.
pub struct Reader {
    inner: Arc<ChainDbInner>,
    key: u64,
    component: BlockComponent,
    shared: Arc<ReaderShared>,
    version: watch::Receiver<u64>,
}

impl Reader {
    pub(crate) fn new(
        inner: Arc<ChainDbInner>,
        key: u64,
        component: BlockComponent,
        shared: Arc<ReaderShared>,
        version: watch::Receiver<u64>,
    ) -> Self {
        Reader {
            inner,
            key,
            component,
            shared,
            version,
        }
    }

    /// The next instruction, or `None` when the reader has caught up
    /// with the tip.
    pub fn instruction(&self) -> Result<Option<ChainUpdate>, ChainDbError> {
        if self.inner.is_closed() {
            return Err(ChainDbError::ClosedDb);
        }
        let chain = self.inner.chain_snapshot();
        let mut position = self.shared.position.lock().unwrap();

        loop {
            let current = std::mem::replace(&mut *position, ReaderPosition::Closed);
            match current {
                ReaderPosition::Closed => {
                    return Err(ChainDbError::ClosedDb);
                }
                ReaderPosition::Init => {
                    *position = ReaderPosition::InMem(RollState::RollForwardFrom(Point::Origin));
                }
                ReaderPosition::InImmDb(RollState::RollBackTo(point), iter) => {
                    *position = ReaderPosition::InImmDb(RollState::RollForwardFrom(point), iter);
                    return Ok(Some(ChainUpdate::RollBack(point)));
                }
                ReaderPosition::InImmDb(RollState::RollForwardFrom(point), mut iter) => {
                    match iter.next_item() {
                        Some(Ok((next_point, value))) => {
                            *position =
                                ReaderPosition::InImmDb(RollState::RollForwardFrom(next_point), iter);
                            return Ok(Some(ChainUpdate::RollForward(value)));
                        }
                        Some(Err(err)) => {
                            *position =
                                ReaderPosition::InImmDb(RollState::RollForwardFrom(point), iter);
                            return Err(err.into());
                        }
                        None => {
                            // Caught up with the immutable tip
                            *position = ReaderPosition::InMem(RollState::RollForwardFrom(point));
                        }
                    }
                }
                ReaderPosition::InMem(RollState::RollBackTo(point)) => {
                    *position = ReaderPosition::InMem(RollState::RollForwardFrom(point));
                    return Ok(Some(ChainUpdate::RollBack(point)));
                }
                ReaderPosition::InMem(RollState::RollForwardFrom(point)) => {
                    if chain.contains(&point) {
                        let next = chain
                            .suffix_after(&point)
                            .and_then(|suffix| suffix.into_iter().next());
                        match next {
                            Some(header) => {
                                let value = self.materialize(&header)?;
                                *position =
                                    ReaderPosition::InMem(RollState::RollForwardFrom(header.point()));
                                return Ok(Some(ChainUpdate::RollForward(value)));
                            }
                            None => {
                                *position = ReaderPosition::InMem(RollState::RollForwardFrom(point));
                                return Ok(None);
                            }
                        }
                    } else if point == Point::Origin || self.inner.immutable.contains(&point) {
                        // Below the fragment anchor: hand over to the
                        // immutable store
                        let start = if point == Point::Origin {
                            IterStart::Beginning
                        } else {
                            IterStart::After(point)
                        };
                        match ImmutableIterator::open(
                            Arc::clone(&self.inner.immutable),
                            start,
                            None,
                            self.component,
                        ) {
                            Ok(iter) => {
                                *position =
                                    ReaderPosition::InImmDb(RollState::RollForwardFrom(point), iter);
                            }
                            Err(err) => {
                                *position =
                                    ReaderPosition::InMem(RollState::RollForwardFrom(point));
                                return Err(err.into());
                            }
                        }
                    } else {
                        // The reader's fork vanished before it was
                        // notified; fall back to the deepest safe point
                        let anchor = chain.anchor().point;
                        debug!(reader_at = %point, "reader position no longer on any chain");
                        *position = ReaderPosition::InMem(RollState::RollBackTo(anchor));
                    }
                }
            }
        }
    }

    /// Await the next instruction across chain updates.
    pub async fn instruction_blocking(&mut self) -> Result<ChainUpdate, ChainDbError> {
        loop {
            if let Some(update) = self.instruction()? {
                return Ok(update);
            }
            self.version.changed().await.map_err(|_| ChainDbError::ClosedDb)?;
        }
    }

    /// Move the read pointer to the most recent of `points` that is on
    /// our chain. The next instruction will be a rollback to it.
    pub fn forward(&self, points: &[Point]) -> Result<Option<Point>, ChainDbError> {
        if self.inner.is_closed() {
            return Err(ChainDbError::ClosedDb);
        }
        let chain = self.inner.chain_snapshot();

        let found = chain.intersect(points).or_else(|| {
            points
                .iter()
                .filter(|point| {
                    **point == Point::Origin || self.inner.immutable.contains(point)
                })
                .max()
                .copied()
        });

        if let Some(point) = found {
            *self.shared.position.lock().unwrap() =
                ReaderPosition::InMem(RollState::RollBackTo(point));
        }
        Ok(found)
    }

    fn materialize(&self, header: &Header) -> Result<ComponentValue, ChainDbError> {
        if self.component == BlockComponent::Header {
            return Ok(ComponentValue::Header(header.clone()));
        }
        self.inner
            .get_component_any(&header.point(), self.component)?
            .ok_or_else(|| {
                ChainDbError::Corruption(format!(
                    "chain block {} missing from both stores",
                    header.point()
                ))
            })
    }

    pub fn close(&self) {
        self.shared.close();
        self.inner.readers.remove(&self.key);
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.close();
    }
}
