//! Chain database configuration.

use naos_common::params;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_ROOT_PATH: &str = "chain-db";
const DEFAULT_GC_DELAY_MS: u64 = 1000;
const DEFAULT_COPY_INTERVAL_MS: u64 = 500;
const DEFAULT_SNAPSHOT_INTERVAL: u64 = 1000;
const DEFAULT_SNAPSHOTS_RETAINED: usize = 2;
const DEFAULT_QUEUE_CAPACITY: usize = 64;
const DEFAULT_PROTOCOL_MAGIC: u32 = 764_824_073;

/// How much of a store to validate when opening it.
///
/// When the clean-shutdown marker was absent the caller's choice is
/// overridden to `ValidateAll` for both stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationPolicy {
    /// Re-parse and re-hash everything.
    ValidateAll,
    /// Trust all but the most recently written file.
    ValidateMostRecent,
}

impl ValidationPolicy {
    fn parse(value: &str) -> ValidationPolicy {
        match value {
            "all" => ValidationPolicy::ValidateAll,
            _ => ValidationPolicy::ValidateMostRecent,
        }
    }
}

/// Tunables for the chain database.
#[derive(Debug, Clone)]
pub struct ChainDbConfig {
    /// Database root directory.
    pub root_path: PathBuf,
    /// Security parameter: rollback depth limit.
    pub security_parameter_k: u64,
    /// Slots covered by one immutable chunk.
    pub slots_per_chunk: u64,
    /// Blocks per volatile segment file.
    pub blocks_per_segment: u32,
    /// Wait between copying blocks to the immutable store and
    /// collecting them from the volatile store.
    pub gc_delay: Duration,
    /// How often the copy task looks for a > k suffix.
    pub copy_interval: Duration,
    /// Tolerated clock skew, in slots.
    pub clock_skew_slots: u64,
    /// Blocks copied to the immutable store between ledger snapshots.
    pub snapshot_interval: u64,
    /// On-disk snapshots retained (at least 2).
    pub snapshots_retained: usize,
    /// Add-block queue capacity.
    pub queue_capacity: usize,
    /// Network magic stored in the database marker.
    pub protocol_magic: u32,
    pub immutable_validation: ValidationPolicy,
    pub volatile_validation: ValidationPolicy,
}

impl ChainDbConfig {
    pub fn new(root_path: impl Into<PathBuf>) -> Self {
        Self {
            root_path: root_path.into(),
            security_parameter_k: params::SECURITY_PARAMETER_K,
            slots_per_chunk: params::SLOTS_PER_CHUNK,
            blocks_per_segment: params::BLOCKS_PER_SEGMENT,
            gc_delay: Duration::from_millis(DEFAULT_GC_DELAY_MS),
            copy_interval: Duration::from_millis(DEFAULT_COPY_INTERVAL_MS),
            clock_skew_slots: params::CLOCK_SKEW_SLOTS,
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
            snapshots_retained: DEFAULT_SNAPSHOTS_RETAINED,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            protocol_magic: DEFAULT_PROTOCOL_MAGIC,
            immutable_validation: ValidationPolicy::ValidateMostRecent,
            volatile_validation: ValidationPolicy::ValidateMostRecent,
        }
    }

    /// Read the configuration from a `config` section, falling back to
    /// defaults for missing keys.
    pub fn from_config(config: &config::Config) -> Self {
        let root_path =
            config.get_string("root-path").unwrap_or(DEFAULT_ROOT_PATH.to_string());
        let mut cfg = Self::new(root_path);

        if let Ok(k) = config.get_int("security-parameter-k") {
            cfg.security_parameter_k = k as u64;
        }
        if let Ok(slots) = config.get_int("slots-per-chunk") {
            cfg.slots_per_chunk = slots as u64;
        }
        if let Ok(blocks) = config.get_int("blocks-per-segment") {
            cfg.blocks_per_segment = blocks as u32;
        }
        if let Ok(ms) = config.get_int("gc-delay-ms") {
            cfg.gc_delay = Duration::from_millis(ms as u64);
        }
        if let Ok(ms) = config.get_int("copy-interval-ms") {
            cfg.copy_interval = Duration::from_millis(ms as u64);
        }
        if let Ok(slots) = config.get_int("clock-skew-slots") {
            cfg.clock_skew_slots = slots as u64;
        }
        if let Ok(blocks) = config.get_int("snapshot-interval") {
            cfg.snapshot_interval = blocks as u64;
        }
        if let Ok(n) = config.get_int("snapshots-retained") {
            cfg.snapshots_retained = (n as usize).max(2);
        }
        if let Ok(n) = config.get_int("queue-capacity") {
            cfg.queue_capacity = n as usize;
        }
        if let Ok(magic) = config.get_int("protocol-magic") {
            cfg.protocol_magic = magic as u32;
        }
        if let Ok(policy) = config.get_string("immutable-validation") {
            cfg.immutable_validation = ValidationPolicy::parse(&policy);
        }
        if let Ok(policy) = config.get_string("volatile-validation") {
            cfg.volatile_validation = ValidationPolicy::parse(&policy);
        }
        cfg
    }

    pub(crate) fn immutable_path(&self) -> PathBuf {
        self.root_path.join("immutable")
    }

    pub(crate) fn volatile_path(&self) -> PathBuf {
        self.root_path.join("volatile")
    }

    pub(crate) fn ledger_path(&self) -> PathBuf {
        self.root_path.join("ledger")
    }
}
