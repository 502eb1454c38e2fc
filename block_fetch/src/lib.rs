//! Block-fetch decision engine.
//!
//! Given the current chain, the candidate chains offered by upstream
//! peers and their in-flight accounting, decide which block ranges to
//! request from which peers. Two modes: bulk sync optimizes for
//! throughput, deadline mode for meeting the next block-production
//! deadline.

pub mod decision;
pub mod peer;

// Flattened re-exports
pub use self::decision::{
    decide, FetchConfig, FetchDecision, FetchDecline, FetchMode, FetchRequest,
};
pub use self::peer::{PeerFetchStatus, PeerGsv, PeerId, PeerState, ProbabilityBand};
