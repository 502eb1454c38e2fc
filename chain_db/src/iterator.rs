//! Range iterators across both stores.
//!
//! A requested range `[from, to]` is classified at creation: entirely
//! in the immutable store, entirely in the volatile store, or spanning
//! both (immutable part first). The volatile part is planned as a
//! header path resolved backwards from `to`; bodies are fetched lazily
//! so a stream survives the blocks being copied to the immutable store
//! and garbage-collected underneath it.

use crate::component::{self, BlockComponent, ComponentValue};
use crate::db::ChainDbInner;
use crate::error::ChainDbError;
use crate::immutable::{ImmutableDbError, ImmutableIterator, IterStart};
use naos_common::{Header, Point};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// A stream over a fixed block range, independent of chain evolution.
pub struct ChainIterator {
    inner: Arc<ChainDbInner>,
    key: u64,
    closed: Arc<AtomicBool>,
    component: BlockComponent,
    immutable_leg: Option<ImmutableIterator>,
    volatile_leg: VecDeque<Header>,
    done: bool,
}

impl ChainIterator {
    pub(crate) fn plan(
        inner: &Arc<ChainDbInner>,
        from: Point,
        to: Point,
        component: BlockComponent,
    ) -> Result<ChainIterator, ChainDbError> {
        if let (Some(from_slot), Some(to_slot)) = (from.slot(), to.slot()) {
            if from_slot > to_slot {
                return Err(ChainDbError::InvalidIteratorRange { from, to });
            }
        }

        if to == Point::Origin {
            return if from == Point::Origin {
                Ok(Self::register(inner, component, None, VecDeque::new()))
            } else {
                Err(ChainDbError::InvalidIteratorRange { from, to })
            };
        }

        if inner.immutable.contains(&to) {
            let leg = Self::immutable_leg(inner, from, to, component)?;
            return Ok(Self::register(inner, component, Some(leg), VecDeque::new()));
        }

        let Some(to_header) = to.hash().and_then(|hash| inner.volatile.block_info(&hash))
        else {
            return Err(ChainDbError::UnknownRange(to));
        };
        if Some(to_header.slot) != to.slot() {
            return Err(ChainDbError::UnknownRange(to));
        }

        // Resolve the volatile path backwards from `to`
        let mut path = VecDeque::new();
        let mut cursor = to_header;
        loop {
            let cursor_point = cursor.point();
            let prev_hash = cursor.prev_hash;
            path.push_front(cursor);

            if cursor_point == from {
                return Ok(Self::register(inner, component, None, path));
            }

            match prev_hash {
                None => {
                    // Reached genesis without meeting `from`
                    return if from == Point::Origin {
                        Ok(Self::register(inner, component, None, path))
                    } else {
                        Err(ChainDbError::UnknownRange(from))
                    };
                }
                Some(prev) => {
                    if let Some(prev_header) = inner.volatile.block_info(&prev) {
                        cursor = prev_header;
                        continue;
                    }
                    // The path crosses into the immutable store
                    let Some(boundary) = inner.immutable.point_of_hash(&prev) else {
                        return Err(ChainDbError::UnknownRange(to));
                    };
                    let leg = Self::immutable_leg(inner, from, boundary, component)?;
                    return Ok(Self::register(inner, component, Some(leg), path));
                }
            }
        }
    }

    fn immutable_leg(
        inner: &Arc<ChainDbInner>,
        from: Point,
        to: Point,
        component: BlockComponent,
    ) -> Result<ImmutableIterator, ChainDbError> {
        let start = if from == Point::Origin {
            IterStart::Beginning
        } else {
            IterStart::At(from)
        };
        ImmutableIterator::open(Arc::clone(&inner.immutable), start, Some(to), component).map_err(|err| match err {
            ImmutableDbError::MissingBlock(point) | ImmutableDbError::ForkTooOld(point) => {
                ChainDbError::UnknownRange(point)
            }
            ImmutableDbError::InvalidRange { from, to } => {
                ChainDbError::InvalidIteratorRange { from, to }
            }
            other => other.into(),
        })
    }

    fn register(
        inner: &Arc<ChainDbInner>,
        component: BlockComponent,
        immutable_leg: Option<ImmutableIterator>,
        volatile_leg: VecDeque<Header>,
    ) -> ChainIterator {
        let (key, closed) = inner.register_iterator();
        ChainIterator {
            inner: Arc::clone(inner),
            key,
            closed,
            component,
            done: immutable_leg.is_none() && volatile_leg.is_empty(),
            immutable_leg,
            volatile_leg,
        }
    }

    /// Stop the stream and release its registration.
    pub fn close(&mut self) {
        self.done = true;
        self.inner.iterators.remove(&self.key);
    }
}

impl Iterator for ChainIterator {
    type Item = Result<(Point, ComponentValue), ChainDbError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.closed.load(Ordering::SeqCst) {
            self.done = true;
            return Some(Err(ChainDbError::ClosedDb));
        }

        if let Some(leg) = &mut self.immutable_leg {
            match leg.next_item() {
                Some(Ok(item)) => return Some(Ok(item)),
                Some(Err(err)) => {
                    self.done = true;
                    return Some(Err(err.into()));
                }
                None => self.immutable_leg = None,
            }
        }

        let Some(header) = self.volatile_leg.pop_front() else {
            self.close();
            return None;
        };
        let point = header.point();

        if self.component == BlockComponent::Header {
            return Some(Ok((point, ComponentValue::Header(header))));
        }

        match self.inner.volatile.get(&header.hash) {
            Ok(Some(block)) => Some(Ok((point, component::from_block(block, self.component)))),
            Ok(None) => {
                // Either copied to the immutable store in the meantime
                // or collected as garbage
                match self.inner.immutable.get_component(&point, self.component) {
                    Ok(Some(value)) => {
                        debug!(block = %point, "stream switched to the immutable store");
                        Some(Ok((point, value)))
                    }
                    Ok(None) => {
                        self.done = true;
                        Some(Err(ChainDbError::BlockGcedFromVolatile(header.hash)))
                    }
                    Err(err) => {
                        self.done = true;
                        Some(Err(err.into()))
                    }
                }
            }
            Err(err) => {
                self.done = true;
                Some(Err(err.into()))
            }
        }
    }
}

impl Drop for ChainIterator {
    fn drop(&mut self) {
        self.inner.iterators.remove(&self.key);
    }
}
