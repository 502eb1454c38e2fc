//! Per-peer fetch state and the latency model.

use naos_common::BlockHash;
use std::collections::HashSet;
use std::time::Duration;

/// Identifies one upstream peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(pub u64);

/// A peer's response-time model: base latency (G), serialization time
/// per byte (S) and variance (V), maintained from observed transfers.
#[derive(Debug, Clone, Copy)]
pub struct PeerGsv {
    /// Round-trip base latency, seconds.
    pub g: f64,
    /// Transfer time per byte, seconds.
    pub s: f64,
    /// Response-time variance, seconds squared.
    pub v: f64,
}

impl PeerGsv {
    pub fn new(g: f64, s: f64, v: f64) -> Self {
        PeerGsv { g, s, v }
    }

    /// Expected time until a response of `bytes` more bytes completes,
    /// with everything already in flight ahead of it.
    pub fn expected_response_seconds(&self, bytes: u64) -> f64 {
        self.g + self.s * bytes as f64
    }

    /// The chance that fetching `fetch_bytes` behind `in_flight_bytes`
    /// completes before the deadline, bucketed into bands.
    pub fn probability_band(
        &self,
        in_flight_bytes: u64,
        fetch_bytes: u64,
        deadline: Duration,
    ) -> ProbabilityBand {
        let mean = self.expected_response_seconds(in_flight_bytes + fetch_bytes);
        let deviation = self.v.max(0.0).sqrt();
        let deadline = deadline.as_secs_f64();
        // One-sided normal tail bounds: ~2.05 sigma covers 98%,
        // ~0.67 sigma covers 75%
        if mean + 2.05 * deviation <= deadline {
            ProbabilityBand::High
        } else if mean + 0.67 * deviation <= deadline {
            ProbabilityBand::Moderate
        } else {
            ProbabilityBand::Low
        }
    }
}

/// Confidence that a fetch makes its deadline. The order makes `High`
/// the greatest, so sorting descending prefers confident peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProbabilityBand {
    Low,
    Moderate,
    High,
}

/// Whether a peer can take another request right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerFetchStatus {
    Ready,
    /// Above the byte low-watermark; wait for it to drain.
    Busy,
}

/// In-flight accounting for one peer.
#[derive(Debug, Clone)]
pub struct PeerState {
    pub gsv: PeerGsv,
    pub reqs_in_flight: u32,
    pub bytes_in_flight: u64,
    pub blocks_in_flight: HashSet<BlockHash>,
    pub status: PeerFetchStatus,
}

impl PeerState {
    pub fn new(gsv: PeerGsv) -> Self {
        PeerState {
            gsv,
            reqs_in_flight: 0,
            bytes_in_flight: 0,
            blocks_in_flight: HashSet::new(),
            status: PeerFetchStatus::Ready,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bands_reflect_latency_and_variance() {
        let deadline = Duration::from_secs(2);
        let fast = PeerGsv::new(0.05, 0.000_000_1, 0.0001);
        assert_eq!(fast.probability_band(0, 64_000, deadline), ProbabilityBand::High);

        // Same mean, growing variance: confidence drops band by band
        let jittery = PeerGsv::new(0.05, 0.000_000_1, 2.25);
        assert_eq!(
            jittery.probability_band(0, 64_000, deadline),
            ProbabilityBand::Moderate
        );
        let erratic = PeerGsv::new(0.05, 0.000_000_1, 16.0);
        assert_eq!(erratic.probability_band(0, 64_000, deadline), ProbabilityBand::Low);

        let slow = PeerGsv::new(1.8, 0.000_01, 0.01);
        assert_eq!(slow.probability_band(0, 64_000, deadline), ProbabilityBand::Low);
    }

    #[test]
    fn in_flight_bytes_push_the_estimate_out() {
        let gsv = PeerGsv::new(0.1, 0.000_01, 0.0);
        let idle = gsv.expected_response_seconds(10_000);
        let loaded = gsv.expected_response_seconds(1_000_000);
        assert!(loaded > idle);
    }

    #[test]
    fn band_order_prefers_high() {
        assert!(ProbabilityBand::High > ProbabilityBand::Moderate);
        assert!(ProbabilityBand::Moderate > ProbabilityBand::Low);
    }
}
