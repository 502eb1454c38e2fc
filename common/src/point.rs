//! Chain positions: genesis origin or a (slot, hash) pair.

use crate::hash::BlockHash;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A position on the chain: either the origin (before any block) or a
/// specific block identified by slot and hash.
///
/// The derived order sorts `Origin` before everything else, then by
/// slot, then by hash, which matches chain order everywhere a point is
/// used as a key.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Point {
    Origin,
    Specific(u64, BlockHash),
}

impl Point {
    /// The slot of the point, `None` for origin.
    pub fn slot(&self) -> Option<u64> {
        match self {
            Point::Origin => None,
            Point::Specific(slot, _) => Some(*slot),
        }
    }

    /// The block hash of the point, `None` for origin.
    pub fn hash(&self) -> Option<BlockHash> {
        match self {
            Point::Origin => None,
            Point::Specific(_, hash) => Some(*hash),
        }
    }

    pub fn is_origin(&self) -> bool {
        matches!(self, Point::Origin)
    }
}

impl Default for Point {
    fn default() -> Self {
        Point::Origin
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Point::Origin => write!(f, "origin"),
            Point::Specific(slot, hash) => {
                write!(f, "{slot}@{}", &hex::encode(&hash[..4]))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(n: u8) -> BlockHash {
        BlockHash::new([n; 32])
    }

    #[test]
    fn origin_sorts_first() {
        let mut points = vec![
            Point::Specific(5, hash(1)),
            Point::Origin,
            Point::Specific(2, hash(9)),
            Point::Specific(2, hash(1)),
        ];
        points.sort();
        assert_eq!(points[0], Point::Origin);
        assert_eq!(points[1], Point::Specific(2, hash(1)));
        assert_eq!(points[2], Point::Specific(2, hash(9)));
        assert_eq!(points[3], Point::Specific(5, hash(1)));
    }

    #[test]
    fn display_is_compact() {
        assert_eq!(Point::Origin.to_string(), "origin");
        assert_eq!(Point::Specific(42, hash(0xab)).to_string(), "42@abababab");
    }
}
