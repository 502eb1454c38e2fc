//! The fetch decision pipeline.
//!
//! Each call is a pure function of the current chain, the candidate
//! chain each peer offers, and the peers' in-flight accounting. It
//! decides, per peer, which block ranges to request next, or why
//! nothing should be requested from that peer.

use crate::peer::{PeerFetchStatus, PeerId, PeerState, ProbabilityBand};
use naos_common::{AnchoredFragment, BlockHash, ChainOrder, Header, Point};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::debug;

/// What the engine optimizes for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Throughput: follow the best chain, avoid duplicate downloads.
    BulkSync,
    /// Latency: hedge across peers to meet the production deadline.
    Deadline,
}

/// Engine limits and budgets.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub max_reqs_per_peer: u32,
    pub high_watermark_bytes: u64,
    pub low_watermark_bytes: u64,
    pub max_concurrency_bulk_sync: usize,
    pub max_concurrency_deadline: usize,
    pub max_request_bytes: u64,
    pub max_request_blocks: usize,
    pub deadline: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        FetchConfig {
            max_reqs_per_peer: 8,
            high_watermark_bytes: 384 * 1024,
            low_watermark_bytes: 192 * 1024,
            max_concurrency_bulk_sync: 1,
            max_concurrency_deadline: 2,
            max_request_bytes: 256 * 1024,
            max_request_blocks: 20,
            deadline: Duration::from_secs(2),
        }
    }
}

/// Why nothing was requested from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchDecline {
    /// The peer's chain is not preferable to ours.
    ChainNotPlausible,
    /// The peer's chain does not intersect our recent chain.
    ChainNoIntersection,
    /// Everything it offers is already stored.
    AlreadyFetched,
    /// Everything it offers is already on the wire from this peer.
    InFlightThisPeer,
    /// Everything it offers is already on the wire from other peers.
    InFlightOtherPeer,
    /// The peer is above the low watermark; wait for it to drain.
    PeerBusy,
    BytesInFlightLimit { in_flight: u64, high_watermark: u64 },
    ReqsInFlightLimit { in_flight: u32 },
    ConcurrencyLimit { limit: usize },
}

/// Block ranges to request, grouped into runs of consecutive blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub fragments: Vec<Vec<Header>>,
}

impl FetchRequest {
    pub fn block_count(&self) -> usize {
        self.fragments.iter().map(|fragment| fragment.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchDecision {
    Request(FetchRequest),
    Decline(FetchDecline),
}

struct Plan {
    peer: PeerId,
    candidate_index: usize,
    wanted: Vec<Header>,
    band: ProbabilityBand,
    expected_seconds: f64,
}

/// Decide, for every peer, what to fetch next.
pub fn decide(
    mode: FetchMode,
    config: &FetchConfig,
    order: &dyn ChainOrder,
    current: &AnchoredFragment,
    candidates: &[(PeerId, AnchoredFragment)],
    peers: &HashMap<PeerId, PeerState>,
    is_fetched: &dyn Fn(&Point) -> bool,
) -> Vec<(PeerId, FetchDecision)> {
    let mut decisions: Vec<(PeerId, FetchDecision)> = Vec::new();
    let mut plans: Vec<Plan> = Vec::new();

    for (index, (peer_id, candidate)) in candidates.iter().enumerate() {
        let Some(state) = peers.get(peer_id) else {
            debug!(peer = peer_id.0, "no peer state, skipping");
            continue;
        };

        if !order.prefer_candidate(current, candidate) {
            decisions.push((*peer_id, FetchDecision::Decline(FetchDecline::ChainNotPlausible)));
            continue;
        }

        let Some(suffix) = fork_suffix(current, candidate) else {
            decisions.push((*peer_id, FetchDecision::Decline(FetchDecline::ChainNoIntersection)));
            continue;
        };

        let not_fetched: Vec<Header> =
            suffix.into_iter().filter(|header| !is_fetched(&header.point())).collect();
        if not_fetched.is_empty() {
            decisions.push((*peer_id, FetchDecision::Decline(FetchDecline::AlreadyFetched)));
            continue;
        }

        let mut wanted: Vec<Header> = not_fetched
            .into_iter()
            .filter(|header| !state.blocks_in_flight.contains(&header.hash))
            .collect();
        if wanted.is_empty() {
            decisions.push((*peer_id, FetchDecision::Decline(FetchDecline::InFlightThisPeer)));
            continue;
        }

        // Bulk sync never duplicates a download another peer already
        // carries; deadline mode deliberately hedges
        if mode == FetchMode::BulkSync {
            let elsewhere: HashSet<BlockHash> = peers
                .iter()
                .filter(|(other, _)| *other != peer_id)
                .flat_map(|(_, other)| other.blocks_in_flight.iter().copied())
                .collect();
            wanted.retain(|header| !elsewhere.contains(&header.hash));
            if wanted.is_empty() {
                decisions
                    .push((*peer_id, FetchDecision::Decline(FetchDecline::InFlightOtherPeer)));
                continue;
            }
        }

        let request_bytes = estimate_request_bytes(config, &wanted);
        plans.push(Plan {
            peer: *peer_id,
            candidate_index: index,
            band: state.gsv.probability_band(
                state.bytes_in_flight,
                request_bytes,
                config.deadline,
            ),
            expected_seconds: state
                .gsv
                .expected_response_seconds(state.bytes_in_flight + request_bytes),
            wanted,
        });
    }

    sort_plans(mode, order, candidates, peers, &mut plans);

    // Stateful allocation over the prioritized plans
    let limit = match mode {
        FetchMode::BulkSync => config.max_concurrency_bulk_sync,
        FetchMode::Deadline => config.max_concurrency_deadline,
    };
    let mut active_peers = peers.values().filter(|state| state.reqs_in_flight > 0).count();
    let mut claimed: HashSet<BlockHash> = HashSet::new();

    for plan in plans {
        let state = &peers[&plan.peer];

        if state.status == PeerFetchStatus::Busy {
            decisions.push((plan.peer, FetchDecision::Decline(FetchDecline::PeerBusy)));
            continue;
        }
        if state.reqs_in_flight >= config.max_reqs_per_peer {
            decisions.push((
                plan.peer,
                FetchDecision::Decline(FetchDecline::ReqsInFlightLimit {
                    in_flight: state.reqs_in_flight,
                }),
            ));
            continue;
        }
        if state.bytes_in_flight >= config.high_watermark_bytes {
            decisions.push((
                plan.peer,
                FetchDecision::Decline(FetchDecline::BytesInFlightLimit {
                    in_flight: state.bytes_in_flight,
                    high_watermark: config.high_watermark_bytes,
                }),
            ));
            continue;
        }
        let was_active = state.reqs_in_flight > 0;
        if !was_active && active_peers >= limit {
            decisions.push((
                plan.peer,
                FetchDecision::Decline(FetchDecline::ConcurrencyLimit { limit }),
            ));
            continue;
        }

        let chosen = select_blocks(mode, config, &plan.wanted, &claimed);
        if chosen.is_empty() {
            decisions.push((plan.peer, FetchDecision::Decline(FetchDecline::InFlightOtherPeer)));
            continue;
        }
        if mode == FetchMode::BulkSync {
            claimed.extend(chosen.iter().map(|header| header.hash));
        }
        if !was_active {
            active_peers += 1;
        }

        let request = FetchRequest {
            fragments: group_consecutive(chosen),
        };
        debug!(
            peer = plan.peer.0,
            blocks = request.block_count(),
            candidate = plan.candidate_index,
            "fetch request"
        );
        decisions.push((plan.peer, FetchDecision::Request(request)));
    }

    decisions
}

/// The candidate's headers past its latest intersection with the
/// current chain. `None` when the chains do not meet within the
/// fragment we keep in memory (and can therefore roll back to).
fn fork_suffix(current: &AnchoredFragment, candidate: &AnchoredFragment) -> Option<Vec<Header>> {
    for header in candidate.headers().rev() {
        if current.contains(&header.point()) {
            return candidate.suffix_after(&header.point());
        }
    }
    if current.contains(&candidate.anchor().point) {
        return Some(candidate.headers().cloned().collect());
    }
    None
}

fn estimate_request_bytes(config: &FetchConfig, wanted: &[Header]) -> u64 {
    let mut bytes = 0u64;
    for header in wanted.iter().take(config.max_request_blocks) {
        bytes += header.body_size as u64;
        if bytes >= config.max_request_bytes {
            break;
        }
    }
    bytes.min(config.max_request_bytes)
}

fn sort_plans(
    mode: FetchMode,
    order: &dyn ChainOrder,
    candidates: &[(PeerId, AnchoredFragment)],
    peers: &HashMap<PeerId, PeerState>,
    plans: &mut [Plan],
) {
    match mode {
        FetchMode::Deadline => {
            // Confidence first, then the better chain. Among peers
            // offering the same head with equal confidence, the less
            // loaded peer goes first so nobody is starved.
            plans.sort_by(|a, b| {
                b.band
                    .cmp(&a.band)
                    .then_with(|| {
                        order.compare_candidates(
                            &candidates[b.candidate_index].1,
                            &candidates[a.candidate_index].1,
                        )
                    })
                    .then_with(|| {
                        peers[&a.peer].reqs_in_flight.cmp(&peers[&b.peer].reqs_in_flight)
                    })
                    .then_with(|| a.peer.cmp(&b.peer))
            });
        }
        FetchMode::BulkSync => {
            // Best chain first, faster peer on ties
            plans.sort_by(|a, b| {
                order
                    .compare_candidates(
                        &candidates[b.candidate_index].1,
                        &candidates[a.candidate_index].1,
                    )
                    .then_with(|| {
                        a.expected_seconds
                            .partial_cmp(&b.expected_seconds)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .then_with(|| a.peer.cmp(&b.peer))
            });
        }
    }
}

/// Take blocks up to the request budget. The first block is always
/// taken even when it alone exceeds the byte budget, otherwise a block
/// larger than the budget could never be fetched at all.
fn select_blocks(
    mode: FetchMode,
    config: &FetchConfig,
    wanted: &[Header],
    claimed: &HashSet<BlockHash>,
) -> Vec<Header> {
    let mut chosen = Vec::new();
    let mut bytes = 0u64;
    for header in wanted {
        if mode == FetchMode::BulkSync && claimed.contains(&header.hash) {
            continue;
        }
        let size = header.body_size as u64;
        if !chosen.is_empty()
            && (bytes + size > config.max_request_bytes || chosen.len() >= config.max_request_blocks)
        {
            break;
        }
        bytes += size;
        chosen.push(header.clone());
        if chosen.len() >= config.max_request_blocks {
            break;
        }
    }
    chosen
}

/// Group headers into runs of consecutive parent-child blocks.
fn group_consecutive(headers: Vec<Header>) -> Vec<Vec<Header>> {
    let mut fragments: Vec<Vec<Header>> = Vec::new();
    for header in headers {
        match fragments.last_mut() {
            Some(run)
                if run
                    .last()
                    .map(|last| header.prev_hash == Some(last.hash))
                    .unwrap_or(false) =>
            {
                run.push(header);
            }
            _ => fragments.push(vec![header]),
        }
    }
    fragments
}
