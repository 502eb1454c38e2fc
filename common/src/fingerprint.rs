//! Fingerprinted values.
//!
//! A fingerprint is a monotonic version counter bumped on every
//! insertion into a set, so consumers can cache a decision made against
//! the set and revisit it only when the fingerprint moves. Garbage
//! collection does not bump it: removals can never turn a cached
//! negative answer stale.

use serde::{Deserialize, Serialize};

/// Monotonic version counter.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Fingerprint(u64);

impl Fingerprint {
    pub fn bump(&mut self) {
        self.0 += 1;
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

/// A snapshot of a value together with the fingerprint it was taken at.
#[derive(Debug, Clone)]
pub struct WithFingerprint<T> {
    pub value: T,
    pub fingerprint: Fingerprint,
}

impl<T> WithFingerprint<T> {
    pub fn new(value: T, fingerprint: Fingerprint) -> Self {
        WithFingerprint { value, fingerprint }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_is_monotonic() {
        let mut fp = Fingerprint::default();
        let before = fp;
        fp.bump();
        assert!(fp > before);
        fp.bump();
        assert_eq!(fp.value(), 2);
    }
}
