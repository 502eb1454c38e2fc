//! Protocol-level constants and defaults.

/// Default security parameter: the depth past which a block is
/// considered immutable.
pub const SECURITY_PARAMETER_K: u64 = 2160;

/// Default number of slots covered by one immutable chunk (one epoch).
pub const SLOTS_PER_CHUNK: u64 = 432_000;

/// Default number of blocks per volatile segment file.
pub const BLOCKS_PER_SEGMENT: u32 = 1000;

/// Default tolerated clock skew, in slots, when judging blocks from the
/// future.
pub const CLOCK_SKEW_SLOTS: u64 = 2;
