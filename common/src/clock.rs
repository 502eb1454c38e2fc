//! Wall-clock slot arithmetic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

/// Source of the current wall-clock slot.
pub trait Clock: Send + Sync {
    fn current_slot(&self) -> u64;
}

/// Real clock: slots of fixed duration counted from the network's
/// system start.
pub struct SystemClock {
    system_start: SystemTime,
    slot_duration: Duration,
}

impl SystemClock {
    pub fn new(system_start: SystemTime, slot_duration: Duration) -> Self {
        SystemClock {
            system_start,
            slot_duration,
        }
    }
}

impl Clock for SystemClock {
    fn current_slot(&self) -> u64 {
        let elapsed = SystemTime::now()
            .duration_since(self.system_start)
            .unwrap_or(Duration::ZERO);
        elapsed.as_nanos().checked_div(self.slot_duration.as_nanos()).unwrap_or(0) as u64
    }
}

/// Manually advanced clock for tests and simulations.
#[derive(Default)]
pub struct ManualClock {
    slot: AtomicU64,
}

impl ManualClock {
    pub fn at(slot: u64) -> Self {
        ManualClock {
            slot: AtomicU64::new(slot),
        }
    }

    pub fn set(&self, slot: u64) {
        self.slot.store(slot, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn current_slot(&self) -> u64 {
        self.slot.load(Ordering::SeqCst)
    }
}
