//! Streaming reads over the immutable store.
//!
//! The iterator is a pull-based cursor over index positions. An
//! unbounded iterator that has caught up with the store yields `None`
//! but stays usable: appends made afterwards become visible to later
//! `next` calls, which is what lets readers follow the immutable tip.

use super::{ImmutableDb, ImmutableDbError};
use crate::component::{BlockComponent, ComponentValue};
use naos_common::Point;
use std::sync::Arc;

/// Where a stream starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterStart {
    /// From the oldest stored block.
    Beginning,
    /// From this point, inclusive.
    At(Point),
    /// From the successor of this point.
    After(Point),
}

enum Cursor {
    /// Yield the first stored position next.
    Start,
    /// Yield this exact position next.
    At(u64, u32),
    /// Yield the successor of this position next.
    After(u64, u32),
}

pub struct ImmutableIterator {
    db: Arc<ImmutableDb>,
    component: BlockComponent,
    cursor: Cursor,
    end: Option<Point>,
    done: bool,
}

impl ImmutableIterator {
    /// Open a stream over `[start, end]`; `end = None` follows the
    /// store as it grows.
    pub fn open(
        db: Arc<ImmutableDb>,
        start: IterStart,
        end: Option<Point>,
        component: BlockComponent,
    ) -> Result<ImmutableIterator, ImmutableDbError> {
        let (cursor, start_slot) = match start {
            IterStart::Beginning | IterStart::At(Point::Origin) | IterStart::After(Point::Origin) => {
                (Cursor::Start, 0)
            }
            IterStart::At(point) => match db.lookup(&point) {
                Some((chunk, pos, _)) => (Cursor::At(chunk, pos), point.slot().unwrap_or(0)),
                None => return Err(classify_missing(&db, point)),
            },
            IterStart::After(point) => match db.lookup(&point) {
                Some((chunk, pos, _)) => (Cursor::After(chunk, pos), point.slot().unwrap_or(0)),
                None => return Err(classify_missing(&db, point)),
            },
        };

        if let Some(end_point) = &end {
            if !db.contains(end_point) {
                return Err(ImmutableDbError::MissingBlock(*end_point));
            }
            if end_point.slot().unwrap_or(0) < start_slot {
                return Err(ImmutableDbError::InvalidRange {
                    from: match start {
                        IterStart::Beginning => Point::Origin,
                        IterStart::At(p) | IterStart::After(p) => p,
                    },
                    to: *end_point,
                });
            }
        }

        Ok(ImmutableIterator {
            db,
            component,
            cursor,
            end,
            done: false,
        })
    }

    /// Pull the next item. `None` either means the bounded range is
    /// exhausted or an unbounded stream has caught up with the tip.
    pub fn next_item(&mut self) -> Option<Result<(Point, ComponentValue), ImmutableDbError>> {
        if self.done {
            return None;
        }

        let (chunk, pos) = match self.cursor {
            Cursor::Start => self.db.first_position()?,
            Cursor::At(chunk, pos) => (chunk, pos),
            Cursor::After(chunk, pos) => self.db.position_after(chunk, pos)?,
        };
        let indexed = self.db.indexed_entry(chunk, pos)?;

        let value = match self.db.read_component(chunk, &indexed, self.component) {
            Ok(value) => value,
            Err(err) => {
                self.done = true;
                return Some(Err(err));
            }
        };

        let point = Point::Specific(indexed.slot, indexed.entry.hash);
        self.cursor = Cursor::After(chunk, pos);
        if self.end == Some(point) {
            self.done = true;
        }
        Some(Ok((point, value)))
    }

    /// True once a bounded range has been fully streamed.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Stop the stream early.
    pub fn close(&mut self) {
        self.done = true;
    }
}

impl Iterator for ImmutableIterator {
    type Item = Result<(Point, ComponentValue), ImmutableDbError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_item()
    }
}

fn classify_missing(db: &ImmutableDb, point: Point) -> ImmutableDbError {
    let first_slot = db.first_point().and_then(|p| p.slot());
    match (point.slot(), first_slot) {
        (Some(slot), Some(first)) if slot < first => ImmutableDbError::ForkTooOld(point),
        _ => ImmutableDbError::MissingBlock(point),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValidationPolicy;
    use crate::immutable::ChunkInfo;
    use naos_common::{Block, BlockHash};

    fn setup(count: u64) -> (tempfile::TempDir, Arc<ImmutableDb>, Vec<Block>) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(
            ImmutableDb::open(dir.path(), ChunkInfo::new(10), ValidationPolicy::ValidateAll)
                .unwrap(),
        );
        let mut blocks = Vec::new();
        let mut prev = None;
        for number in 0..count {
            let block = Block::new(number * 4, number, prev, false, vec![number as u8]);
            prev = Some(block.hash());
            db.append(&block).unwrap();
            blocks.push(block);
        }
        (dir, db, blocks)
    }

    #[test]
    fn streams_full_range_in_order() {
        let (_dir, db, blocks) = setup(12);
        let iter =
            ImmutableIterator::open(db, IterStart::Beginning, None, BlockComponent::Block).unwrap();
        let streamed: Vec<Block> = iter
            .map(|item| item.unwrap().1.into_block().unwrap())
            .collect();
        assert_eq!(streamed, blocks);
    }

    #[test]
    fn streams_bounded_subrange() {
        let (_dir, db, blocks) = setup(12);
        let iter = ImmutableIterator::open(
            db,
            IterStart::At(blocks[3].point()),
            Some(blocks[7].point()),
            BlockComponent::Header,
        )
        .unwrap();
        let headers: Vec<_> = iter.map(|item| item.unwrap().1.into_header().unwrap()).collect();
        assert_eq!(headers.len(), 5);
        assert_eq!(headers[0], blocks[3].header);
        assert_eq!(headers[4], blocks[7].header);
    }

    #[test]
    fn unbounded_stream_follows_appends() {
        let (_dir, db, blocks) = setup(3);
        let mut iter = ImmutableIterator::open(
            Arc::clone(&db),
            IterStart::After(blocks[2].point()),
            None,
            BlockComponent::Block,
        )
        .unwrap();
        assert!(iter.next_item().is_none());

        let next = Block::new(100, 3, Some(blocks[2].hash()), false, vec![9]);
        db.append(&next).unwrap();

        let (point, value) = iter.next_item().unwrap().unwrap();
        assert_eq!(point, next.point());
        assert_eq!(value.into_block().unwrap(), next);
        assert!(iter.next_item().is_none());
    }

    #[test]
    fn missing_start_is_an_error() {
        let (_dir, db, _) = setup(3);
        let ghost = Point::Specific(1000, BlockHash::new([9; 32]));
        assert!(matches!(
            ImmutableIterator::open(db, IterStart::At(ghost), None, BlockComponent::Block),
            Err(ImmutableDbError::MissingBlock(_))
        ));
    }

    #[test]
    fn start_before_first_block_is_fork_too_old() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(
            ImmutableDb::open(dir.path(), ChunkInfo::new(10), ValidationPolicy::ValidateAll)
                .unwrap(),
        );
        // Chain starting at slot 50
        let mut prev = None;
        for number in 0..3u64 {
            let block = Block::new(50 + number, number, prev, false, vec![]);
            prev = Some(block.hash());
            db.append(&block).unwrap();
        }
        let old = Point::Specific(10, BlockHash::new([1; 32]));
        assert!(matches!(
            ImmutableIterator::open(db, IterStart::At(old), None, BlockComponent::Block),
            Err(ImmutableDbError::ForkTooOld(_))
        ));
    }

    #[test]
    fn inverted_range_is_rejected() {
        let (_dir, db, blocks) = setup(5);
        assert!(matches!(
            ImmutableIterator::open(
                db,
                IterStart::At(blocks[4].point()),
                Some(blocks[1].point()),
                BlockComponent::Block
            ),
            Err(ImmutableDbError::InvalidRange { .. })
        ));
    }
}
