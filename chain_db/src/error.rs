//! Error taxonomy for the chain database.
//!
//! Four kinds with different blast radii:
//!
//! 1. user errors (bad arguments) — returned as values, the database
//!    stays open;
//! 2. block/chain errors — traced and recorded in the invalid-block
//!    set, never escalated;
//! 3. corruption of known-present data — closes the database, the next
//!    open runs full validation and truncates to a consistent state;
//! 4. fatal errors (closed handle, unexpected I/O, wrong network
//!    marker) — the caller must restart the node.

use naos_common::{BlockHash, Point};

/// Why a block was recorded as invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidBlockReason {
    /// The ledger transition rejected it.
    Ledger(String),
    /// Its slot was further in the future than the tolerated clock skew.
    ExceedsClockSkew { slot: u64, current_slot: u64 },
}

impl std::fmt::Display for InvalidBlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidBlockReason::Ledger(reason) => write!(f, "ledger: {reason}"),
            InvalidBlockReason::ExceedsClockSkew { slot, current_slot } => {
                write!(f, "slot {slot} exceeds clock skew at slot {current_slot}")
            }
        }
    }
}

/// Entry in the invalid-block set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidBlockInfo {
    pub reason: InvalidBlockReason,
    pub slot: u64,
}

/// Errors surfaced on the `ChainDb` handle.
#[derive(Debug, thiserror::Error)]
pub enum ChainDbError {
    // -- user errors -------------------------------------------------
    #[error("invalid iterator range: {from} after {to}")]
    InvalidIteratorRange { from: Point, to: Point },

    #[error("unknown range requested: {0} is not a stored block")]
    UnknownRange(Point),

    // -- streaming terminations --------------------------------------
    #[error("block {0} was garbage-collected from the volatile store")]
    BlockGcedFromVolatile(BlockHash),

    // -- corruption --------------------------------------------------
    #[error("database corruption: {0}")]
    Corruption(String),

    // -- fatal -------------------------------------------------------
    #[error("the database is closed")]
    ClosedDb,

    #[error("unexpected i/o error: {0}")]
    UnexpectedIo(#[from] std::io::Error),

    #[error("database marker mismatch: found network magic {found}, expected {expected}")]
    DbMarkerMismatch { found: u32, expected: u32 },

    #[error("database root is locked by another process")]
    Locked,
}

impl ChainDbError {
    /// True for errors that must close the database (kinds 3 and 4).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ChainDbError::Corruption(_)
                | ChainDbError::ClosedDb
                | ChainDbError::UnexpectedIo(_)
                | ChainDbError::DbMarkerMismatch { .. }
                | ChainDbError::Locked
        )
    }
}

impl From<crate::immutable::ImmutableDbError> for ChainDbError {
    fn from(err: crate::immutable::ImmutableDbError) -> Self {
        use crate::immutable::ImmutableDbError;
        match err {
            ImmutableDbError::Io(e) => ChainDbError::UnexpectedIo(e),
            ImmutableDbError::Corruption(what) => ChainDbError::Corruption(what),
            other => ChainDbError::Corruption(other.to_string()),
        }
    }
}

impl From<crate::volatile::VolatileDbError> for ChainDbError {
    fn from(err: crate::volatile::VolatileDbError) -> Self {
        use crate::volatile::VolatileDbError;
        match err {
            VolatileDbError::Io(e) => ChainDbError::UnexpectedIo(e),
            VolatileDbError::Corruption(what) => ChainDbError::Corruption(what),
        }
    }
}
