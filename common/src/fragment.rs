//! Anchored header fragments.
//!
//! A fragment is a contiguous run of headers whose first element links
//! to a designated anchor point. The current chain, every candidate
//! produced by chain selection, and every reader notification are all
//! fragments, so the linkage checks live here and nowhere else.

use crate::block::Header;
use crate::hash::BlockHash;
use crate::point::Point;
use std::collections::VecDeque;

/// Errors raised by fragment construction.
#[derive(Debug, thiserror::Error)]
pub enum FragmentError {
    /// The pushed header's parent is not the fragment head.
    #[error("header does not link to fragment head {expected}")]
    WrongParent { expected: Point },

    /// The pushed header's number is not head number + 1.
    #[error("non-contiguous block number: expected {expected}, got {got}")]
    NonContiguousNumber { expected: u64, got: u64 },

    /// The pushed header's slot does not advance past the head's.
    ///
    /// An epoch boundary block's successor shares the boundary slot;
    /// every other succession is strictly increasing.
    #[error("non-monotonic slot: head at {head_slot}, got {got}")]
    NonMonotonicSlot { head_slot: u64, got: u64 },
}

/// The point preceding the first element of a fragment, together with
/// the block number at that point (`None` at origin).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Anchor {
    pub point: Point,
    pub block_number: Option<u64>,
}

impl Anchor {
    pub fn genesis() -> Self {
        Anchor {
            point: Point::Origin,
            block_number: None,
        }
    }

    pub fn at(point: Point, block_number: u64) -> Self {
        Anchor {
            point,
            block_number: Some(block_number),
        }
    }

    pub fn from_header(header: &Header) -> Self {
        Anchor {
            point: header.point(),
            block_number: Some(header.number),
        }
    }

    /// The block number the next header after the anchor must carry.
    pub fn successor_number(&self) -> u64 {
        self.block_number.map_or(0, |n| n + 1)
    }
}

/// Where a point sits within a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Anchor,
    Header(usize),
}

/// An ordered run of headers anchored at a point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchoredFragment {
    anchor: Anchor,
    headers: VecDeque<Header>,
}

impl AnchoredFragment {
    pub fn new(anchor: Anchor) -> Self {
        AnchoredFragment {
            anchor,
            headers: VecDeque::new(),
        }
    }

    pub fn from_headers(
        anchor: Anchor,
        headers: impl IntoIterator<Item = Header>,
    ) -> Result<Self, FragmentError> {
        let mut fragment = Self::new(anchor);
        for header in headers {
            fragment.push(header)?;
        }
        Ok(fragment)
    }

    pub fn anchor(&self) -> &Anchor {
        &self.anchor
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn head(&self) -> Option<&Header> {
        self.headers.back()
    }

    pub fn first(&self) -> Option<&Header> {
        self.headers.front()
    }

    /// The tip of the fragment: its newest header, or the anchor.
    pub fn head_point(&self) -> Point {
        self.head().map(|h| h.point()).unwrap_or(self.anchor.point)
    }

    /// The block number at the tip, `None` before genesis.
    pub fn head_block_number(&self) -> Option<u64> {
        self.head().map(|h| h.number).or(self.anchor.block_number)
    }

    pub fn head_slot(&self) -> Option<u64> {
        self.head().map(|h| h.slot).or(self.anchor.point.slot())
    }

    pub fn get(&self, index: usize) -> Option<&Header> {
        self.headers.get(index)
    }

    pub fn headers(&self) -> impl DoubleEndedIterator<Item = &Header> {
        self.headers.iter()
    }

    /// The last `n` headers, oldest first.
    pub fn tail(&self, n: usize) -> impl Iterator<Item = &Header> {
        let skip = self.headers.len().saturating_sub(n);
        self.headers.iter().skip(skip)
    }

    /// Append a header, checking linkage against the current head.
    pub fn push(&mut self, header: Header) -> Result<(), FragmentError> {
        let expected_number = self.head().map(|h| h.number + 1).unwrap_or_else(|| self.anchor.successor_number());
        if header.number != expected_number {
            return Err(FragmentError::NonContiguousNumber {
                expected: expected_number,
                got: header.number,
            });
        }

        let expected_parent: Option<BlockHash> =
            self.head().map(|h| Some(h.hash)).unwrap_or_else(|| self.anchor.point.hash());
        if header.prev_hash != expected_parent {
            return Err(FragmentError::WrongParent {
                expected: self.head_point(),
            });
        }

        if let Some(head) = self.head() {
            // An EBB and its successor share a slot; otherwise strict
            let ok = if head.is_ebb {
                header.slot >= head.slot
            } else {
                header.slot > head.slot
            };
            if !ok {
                return Err(FragmentError::NonMonotonicSlot {
                    head_slot: head.slot,
                    got: header.slot,
                });
            }
        } else if let Some(anchor_slot) = self.anchor.point.slot() {
            if header.slot < anchor_slot {
                return Err(FragmentError::NonMonotonicSlot {
                    head_slot: anchor_slot,
                    got: header.slot,
                });
            }
        }

        self.headers.push_back(header);
        Ok(())
    }

    /// Locate a point on the fragment (anchor included).
    pub fn locate(&self, point: &Point) -> Option<Location> {
        if *point == self.anchor.point {
            return Some(Location::Anchor);
        }
        let slot = point.slot()?;
        let hash = point.hash()?;
        self.headers
            .iter()
            .position(|h| h.slot == slot && h.hash == hash)
            .map(Location::Header)
    }

    pub fn contains(&self, point: &Point) -> bool {
        self.locate(point).is_some()
    }

    /// A copy of the fragment truncated so that `point` is its head.
    ///
    /// `None` if the point is not on the fragment (including its
    /// anchor, which yields an empty fragment).
    pub fn rollback_to(&self, point: &Point) -> Option<AnchoredFragment> {
        match self.locate(point)? {
            Location::Anchor => Some(Self::new(self.anchor)),
            Location::Header(index) => {
                let headers = self.headers.iter().take(index + 1).cloned().collect();
                Some(AnchoredFragment {
                    anchor: self.anchor,
                    headers,
                })
            }
        }
    }

    /// The headers strictly after `point`, oldest first.
    pub fn suffix_after(&self, point: &Point) -> Option<Vec<Header>> {
        let start = match self.locate(point)? {
            Location::Anchor => 0,
            Location::Header(index) => index + 1,
        };
        Some(self.headers.iter().skip(start).cloned().collect())
    }

    /// Remove the `n` oldest headers and re-anchor at the last removed
    /// one. Returns the removed headers, oldest first.
    pub fn drop_oldest(&mut self, n: usize) -> Vec<Header> {
        let n = n.min(self.headers.len());
        let removed: Vec<Header> = self.headers.drain(..n).collect();
        if let Some(last) = removed.last() {
            self.anchor = Anchor::from_header(last);
        }
        removed
    }

    /// The best intersection with the given points: the latest one that
    /// lies on this fragment.
    pub fn intersect(&self, points: &[Point]) -> Option<Point> {
        let mut best: Option<(Location, Point)> = None;
        for point in points {
            if let Some(location) = self.locate(point) {
                let better = match (&best, &location) {
                    (None, _) => true,
                    (Some((Location::Anchor, _)), Location::Header(_)) => true,
                    (Some((Location::Header(i), _)), Location::Header(j)) => j > i,
                    _ => false,
                };
                if better {
                    best = Some((location, *point));
                }
            }
        }
        best.map(|(_, point)| point)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Block;

    fn chain(anchor: Anchor, slots: &[u64]) -> (AnchoredFragment, Vec<Header>) {
        let mut fragment = AnchoredFragment::new(anchor);
        let mut prev = anchor.point.hash();
        let mut number = anchor.successor_number();
        let mut headers = Vec::new();
        for &slot in slots {
            let block = Block::new(slot, number, prev, false, vec![slot as u8]);
            prev = Some(block.hash());
            number += 1;
            headers.push(block.header.clone());
            fragment.push(block.header).unwrap();
        }
        (fragment, headers)
    }

    #[test]
    fn push_checks_linkage() {
        let (mut fragment, headers) = chain(Anchor::genesis(), &[1, 2, 3]);
        assert_eq!(fragment.len(), 3);
        assert_eq!(fragment.head_block_number(), Some(2));

        // Wrong parent
        let stranger = Block::new(4, 3, Some(BlockHash::new([9; 32])), false, vec![]);
        assert!(matches!(
            fragment.push(stranger.header),
            Err(FragmentError::WrongParent { .. })
        ));

        // Wrong number
        let bad_number = Block::new(4, 9, Some(headers[2].hash), false, vec![]);
        assert!(matches!(
            fragment.push(bad_number.header),
            Err(FragmentError::NonContiguousNumber { expected: 3, got: 9 })
        ));

        // Stale slot
        let stale = Block::new(3, 3, Some(headers[2].hash), false, vec![]);
        assert!(matches!(
            fragment.push(stale.header),
            Err(FragmentError::NonMonotonicSlot { head_slot: 3, got: 3 })
        ));
    }

    #[test]
    fn ebb_successor_shares_slot() {
        let mut fragment = AnchoredFragment::new(Anchor::genesis());
        let ebb = Block::new(10, 0, None, true, vec![]);
        let hash = ebb.hash();
        fragment.push(ebb.header).unwrap();
        let ordinary = Block::new(10, 1, Some(hash), false, vec![1]);
        fragment.push(ordinary.header).unwrap();
        assert_eq!(fragment.len(), 2);
    }

    #[test]
    fn rollback_and_suffix() {
        let (fragment, headers) = chain(Anchor::genesis(), &[1, 2, 3, 4]);
        let mid = headers[1].point();

        let rolled = fragment.rollback_to(&mid).unwrap();
        assert_eq!(rolled.len(), 2);
        assert_eq!(rolled.head_point(), mid);

        let suffix = fragment.suffix_after(&mid).unwrap();
        assert_eq!(suffix.len(), 2);
        assert_eq!(suffix[0], headers[2]);

        assert!(fragment.rollback_to(&Point::Specific(9, BlockHash::new([9; 32]))).is_none());
    }

    #[test]
    fn rollback_to_anchor_is_empty() {
        let anchor = Anchor::genesis();
        let (fragment, _) = chain(anchor, &[1, 2]);
        let rolled = fragment.rollback_to(&Point::Origin).unwrap();
        assert!(rolled.is_empty());
        assert_eq!(rolled.head_point(), Point::Origin);
    }

    #[test]
    fn drop_oldest_reanchors() {
        let (mut fragment, headers) = chain(Anchor::genesis(), &[1, 2, 3, 4]);
        let removed = fragment.drop_oldest(2);
        assert_eq!(removed.len(), 2);
        assert_eq!(fragment.anchor().point, headers[1].point());
        assert_eq!(fragment.anchor().block_number, Some(1));
        assert_eq!(fragment.len(), 2);
        assert_eq!(fragment.head_point(), headers[3].point());
        // Remaining headers still link to the new anchor
        assert_eq!(fragment.first().unwrap().prev_hash, Some(headers[1].hash));
    }

    #[test]
    fn intersect_prefers_latest_point() {
        let (fragment, headers) = chain(Anchor::genesis(), &[1, 2, 3]);
        let unknown = Point::Specific(9, BlockHash::new([9; 32]));
        let found = fragment
            .intersect(&[unknown, headers[0].point(), headers[2].point()])
            .unwrap();
        assert_eq!(found, headers[2].point());
    }

    #[test]
    fn tail_returns_last_n() {
        let (fragment, headers) = chain(Anchor::genesis(), &[1, 2, 3, 4, 5]);
        let tail: Vec<_> = fragment.tail(2).collect();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0], &headers[3]);
        assert_eq!(tail[1], &headers[4]);
    }
}
