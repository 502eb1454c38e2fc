//! Chain storage and chain selection for a Naos consensus node.
//!
//! The database keeps the authoritative view of the chain in three
//! layers: an append-only immutable store holding everything deeper
//! than the security parameter k, a volatile pool of recent blocks and
//! competing forks, and a ledger store with per-block states inside
//! the rollback window plus disk snapshots. A single pipeline accepts
//! candidate blocks, persists them, and runs chain selection; readers
//! and iterators stream blocks and headers across the layer boundary
//! while the chain evolves underneath.

pub mod component;
pub mod config;
pub mod db;
pub mod error;
pub mod immutable;
pub mod iterator;
pub mod ledger;
pub mod queue;
pub mod reader;
pub mod selection;
pub mod volatile;

mod files;
mod marker;
mod registry;
mod worker;

// Flattened re-exports
pub use self::component::{BlockComponent, ComponentValue};
pub use self::config::{ChainDbConfig, ValidationPolicy};
pub use self::db::ChainDb;
pub use self::error::{ChainDbError, InvalidBlockInfo, InvalidBlockReason};
pub use self::immutable::{ChunkInfo, ImmutableDb, ImmutableDbError};
pub use self::iterator::ChainIterator;
pub use self::ledger::{HeaderLedger, Ledger, LedgerDb, LedgerError, LedgerState, PointTooOld};
pub use self::queue::AddBlockPromise;
pub use self::reader::{ChainUpdate, Reader};
pub use self::volatile::{VolatileDb, VolatileDbError};
pub use naos_common::{ChainOrder, LongestChain};
