//! Chain selection.
//!
//! Implements the bounded `maxvalid` rule: among all candidate chains
//! reachable from the current chain through the volatile store, adopt
//! the best one that validates against the ledger, rejecting forks
//! deeper than k. Ties favour the chain we are already on.

use crate::error::{InvalidBlockInfo, InvalidBlockReason};
use crate::immutable::ImmutableDb;
use crate::ledger::LedgerDb;
use crate::volatile::VolatileDb;
use imbl::HashMap as ImblHashMap;
use naos_common::{Anchor, AnchoredFragment, BlockHash, ChainOrder, Header, Point};
use std::sync::Arc;
use tracing::{debug, warn};

/// A candidate chain: the current chain rolled back to `fork_point`
/// and extended with volatile blocks.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Where the candidate leaves the current chain.
    pub fork_point: Point,
    /// Suffix headers, anchored at the fork point.
    pub fragment: AnchoredFragment,
}

/// Everything chain selection needs to read.
pub struct SelectionContext<'a> {
    pub volatile: &'a VolatileDb,
    pub immutable: &'a Arc<ImmutableDb>,
    pub rule: &'a dyn ChainOrder,
    pub k: u64,
    pub current_slot: u64,
    pub clock_skew: u64,
}

/// What a selection pass decided.
#[derive(Default)]
pub struct SelectionOutcome {
    /// The adopted chain, if any: new fragment, its ledger, the
    /// rollback point and the newly adopted suffix.
    pub adopted: Option<Adopted>,
    /// Blocks found invalid during validation.
    pub newly_invalid: Vec<(BlockHash, InvalidBlockInfo)>,
    /// Headers within clock skew that must wait for their slot.
    pub future: Vec<Header>,
}

pub struct Adopted {
    pub chain: AnchoredFragment,
    pub ledger: LedgerDb,
    pub rollback_point: Point,
    pub suffix: Vec<Header>,
}

/// Run one chain-selection pass against a snapshot of the current
/// chain and ledger.
pub fn run(
    ctx: &SelectionContext,
    current: &AnchoredFragment,
    ledger: &LedgerDb,
    invalid: &ImblHashMap<BlockHash, InvalidBlockInfo>,
) -> SelectionOutcome {
    let mut outcome = SelectionOutcome::default();

    let mut candidates = collect_candidates(ctx, current, invalid, &mut outcome);
    sort_candidates(ctx.rule, &mut candidates);

    while let Some(candidate) = candidates.pop() {
        if !ctx.rule.prefer_candidate(current, &candidate.fragment) {
            continue;
        }
        // Validity closure: a candidate may contain a block another
        // candidate just proved invalid
        if candidate
            .fragment
            .headers()
            .any(|h| invalid.contains_key(&h.hash) || is_newly_invalid(&outcome, &h.hash))
        {
            continue;
        }

        match validate_candidate(ctx, ledger, &candidate, &mut outcome) {
            Validation::Valid(candidate_ledger) => {
                let Some(mut chain) = current.rollback_to(&candidate.fork_point) else {
                    warn!(fork = %candidate.fork_point, "fork point vanished from current chain");
                    continue;
                };
                let suffix: Vec<Header> = candidate.fragment.headers().cloned().collect();
                let mut linked = true;
                for header in &suffix {
                    if let Err(err) = chain.push(header.clone()) {
                        warn!("candidate does not link onto current chain: {err}");
                        linked = false;
                        break;
                    }
                }
                if !linked {
                    continue;
                }
                debug!(tip = %chain.head_point(), "adopting candidate chain");
                outcome.adopted = Some(Adopted {
                    chain,
                    ledger: candidate_ledger,
                    rollback_point: candidate.fork_point,
                    suffix,
                });
                return outcome;
            }
            Validation::Truncated(truncated) => {
                // The valid prefix may still win; re-rank it
                if truncated.fragment.len() > 0
                    && ctx.rule.prefer_candidate(current, &truncated.fragment)
                {
                    candidates.push(truncated);
                    sort_candidates(ctx.rule, &mut candidates);
                }
            }
            Validation::Abandoned => {}
        }
    }

    outcome
}

fn is_newly_invalid(outcome: &SelectionOutcome, hash: &BlockHash) -> bool {
    outcome.newly_invalid.iter().any(|(h, _)| h == hash)
}

/// All maximal extensions of the current chain through the volatile
/// store, anchored at a point within the rollback window.
fn collect_candidates(
    ctx: &SelectionContext,
    current: &AnchoredFragment,
    invalid: &ImblHashMap<BlockHash, InvalidBlockInfo>,
    outcome: &mut SelectionOutcome,
) -> Vec<Candidate> {
    let tip_number = current.head_block_number();

    // Oldest anchors first: among otherwise equal candidates the
    // stable sort then favours the latest fork point, i.e. the
    // shallowest rollback
    let mut anchors: Vec<Anchor> = vec![*current.anchor()];
    anchors.extend(current.headers().map(Anchor::from_header));

    let mut candidates = Vec::new();
    for anchor in anchors {
        // Forking here must not roll back more than k blocks
        let depth = match (tip_number, anchor.block_number) {
            (Some(tip), Some(at)) => tip.saturating_sub(at),
            (Some(tip), None) => tip + 1,
            _ => 0,
        };
        if depth > ctx.k {
            continue;
        }

        let mut path = AnchoredFragment::new(anchor);
        extend_maximal(ctx, invalid, &mut path, &mut candidates, outcome);
    }
    candidates
}

/// Depth-first walk over volatile successors, emitting every maximal
/// path as a candidate.
fn extend_maximal(
    ctx: &SelectionContext,
    invalid: &ImblHashMap<BlockHash, InvalidBlockInfo>,
    path: &mut AnchoredFragment,
    candidates: &mut Vec<Candidate>,
    outcome: &mut SelectionOutcome,
) {
    let children = ctx.volatile.successors(&path.head_point());

    let mut extended = false;
    for child in children {
        if invalid.contains_key(&child.hash) {
            // Candidates through an invalid block are never viable
            continue;
        }
        if child.slot > ctx.current_slot {
            // Within skew the block waits its turn; beyond it the
            // pre-add filter already rejected it, but re-check anyway
            if child.slot <= ctx.current_slot + ctx.clock_skew
                && !outcome.future.iter().any(|h| h.hash == child.hash)
            {
                outcome.future.push(child);
            }
            continue;
        }
        let head_before = path.head_point();
        if path.push(child).is_err() {
            continue;
        }
        extended = true;
        extend_maximal(ctx, invalid, path, candidates, outcome);
        // Backtrack to where this branch started
        *path = path.rollback_to(&head_before).expect("head is on the path");
    }

    if !extended && path.len() > 0 {
        candidates.push(Candidate {
            fork_point: path.anchor().point,
            fragment: path.clone(),
        });
    }
}

enum Validation {
    Valid(LedgerDb),
    Truncated(Candidate),
    Abandoned,
}

/// Validate a candidate block-by-block against the ledger rewound to
/// its fork point.
fn validate_candidate(
    ctx: &SelectionContext,
    ledger: &LedgerDb,
    candidate: &Candidate,
    outcome: &mut SelectionOutcome,
) -> Validation {
    let Ok(mut candidate_ledger) = ledger.rewind(&candidate.fork_point) else {
        debug!(fork = %candidate.fork_point, "fork point outside the rewind window");
        return Validation::Abandoned;
    };

    for (index, header) in candidate.fragment.headers().enumerate() {
        // A validation pass can outlive a garbage collection: refetch
        // from the immutable store if the block was copied, abandon
        // the candidate if it is gone entirely
        let block = match ctx.volatile.get(&header.hash) {
            Ok(Some(block)) => block,
            Ok(None) => match ctx.immutable.get_block(&header.point()) {
                Ok(Some(block)) => block,
                _ => {
                    debug!(block = %header.point(), "candidate block no longer available");
                    return Validation::Abandoned;
                }
            },
            Err(err) => {
                warn!("volatile read failed during validation: {err}");
                return Validation::Abandoned;
            }
        };

        if let Err(err) = candidate_ledger.push(&block) {
            warn!(block = %header.point(), "validation failed: {err}");
            outcome.newly_invalid.push((
                header.hash,
                InvalidBlockInfo {
                    reason: InvalidBlockReason::Ledger(err.reason.clone()),
                    slot: header.slot,
                },
            ));
            return truncate_before(candidate, index);
        }
    }

    Validation::Valid(candidate_ledger)
}

fn truncate_before(candidate: &Candidate, index: usize) -> Validation {
    if index == 0 {
        return Validation::Abandoned;
    }
    let keep = candidate.fragment.get(index - 1).expect("index within fragment");
    let fragment = candidate
        .fragment
        .rollback_to(&keep.point())
        .expect("point is on the fragment");
    Validation::Truncated(Candidate {
        fork_point: candidate.fork_point,
        fragment,
    })
}

/// Ascending sort so `pop` takes the best candidate first.
fn sort_candidates(rule: &dyn ChainOrder, candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| rule.compare_candidates(&a.fragment, &b.fragment));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValidationPolicy;
    use crate::immutable::ChunkInfo;
    use crate::ledger::{HeaderLedger, LedgerState};
    use naos_common::Block;

    struct Fixture {
        _dir: tempfile::TempDir,
        volatile: VolatileDb,
        immutable: Arc<ImmutableDb>,
        ledger: LedgerDb,
        invalid: ImblHashMap<BlockHash, InvalidBlockInfo>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let volatile = VolatileDb::open(
                dir.path().join("volatile"),
                100,
                ValidationPolicy::ValidateMostRecent,
            )
            .unwrap();
            let immutable = Arc::new(
                ImmutableDb::open(
                    dir.path().join("immutable"),
                    ChunkInfo::new(1000),
                    ValidationPolicy::ValidateAll,
                )
                .unwrap(),
            );
            Fixture {
                _dir: dir,
                volatile,
                immutable,
                ledger: LedgerDb::new(Arc::new(HeaderLedger), LedgerState::genesis()),
                invalid: ImblHashMap::new(),
            }
        }

        fn ctx(&self, current_slot: u64) -> SelectionContext<'_> {
            SelectionContext {
                volatile: &self.volatile,
                immutable: &self.immutable,
                rule: &naos_common::LongestChain,
                k: 5,
                current_slot,
                clock_skew: 2,
            }
        }
    }

    fn block(slot: u64, number: u64, prev: Option<BlockHash>, tag: u8) -> Block {
        Block::new(slot, number, prev, false, vec![tag])
    }

    #[test]
    fn adopts_a_linear_extension() {
        let fixture = Fixture::new();
        let a = block(1, 0, None, 1);
        let b = block(2, 1, Some(a.hash()), 2);
        fixture.volatile.put(&a).unwrap();
        fixture.volatile.put(&b).unwrap();

        let current = AnchoredFragment::new(Anchor::genesis());
        let outcome = run(&fixture.ctx(10), &current, &fixture.ledger, &fixture.invalid);

        let adopted = outcome.adopted.unwrap();
        assert_eq!(adopted.chain.head_point(), b.point());
        assert_eq!(adopted.rollback_point, Point::Origin);
        assert_eq!(adopted.suffix.len(), 2);
        assert_eq!(adopted.ledger.current().tip, b.point());
        assert!(outcome.newly_invalid.is_empty());
    }

    #[test]
    fn prefers_the_longer_fork() {
        let fixture = Fixture::new();
        let a = block(1, 0, None, 1);
        let b = block(2, 1, Some(a.hash()), 2);
        let b2 = block(3, 1, Some(a.hash()), 3);
        let c2 = block(4, 2, Some(b2.hash()), 4);
        for blk in [&a, &b, &b2, &c2] {
            fixture.volatile.put(blk).unwrap();
        }

        let current = AnchoredFragment::new(Anchor::genesis());
        let outcome = run(&fixture.ctx(10), &current, &fixture.ledger, &fixture.invalid);
        assert_eq!(outcome.adopted.unwrap().chain.head_point(), c2.point());
    }

    #[test]
    fn equal_length_keeps_current_chain() {
        let fixture = Fixture::new();
        let a = block(1, 0, None, 1);
        let b = block(2, 1, Some(a.hash()), 2);
        fixture.volatile.put(&a).unwrap();
        fixture.volatile.put(&b).unwrap();

        // Current chain is [a, b']; b is an equal-length alternative
        let b_prime = block(2, 1, Some(a.hash()), 9);
        fixture.volatile.put(&b_prime).unwrap();
        let mut ledger = fixture.ledger.clone();
        let mut current = AnchoredFragment::new(Anchor::genesis());
        for blk in [&a, &b_prime] {
            current.push(blk.header.clone()).unwrap();
            ledger.push(blk).unwrap();
        }

        let outcome = run(&fixture.ctx(10), &current, &ledger, &fixture.invalid);
        assert!(outcome.adopted.is_none());
    }

    #[test]
    fn rejects_forks_deeper_than_k() {
        let fixture = Fixture::new();

        // Current chain: 8 blocks; fork from block 0 would roll back 7 > k=5
        let mut current = AnchoredFragment::new(Anchor::genesis());
        let mut ledger = fixture.ledger.clone();
        let mut blocks = Vec::new();
        let mut prev = None;
        for n in 0..8u64 {
            let blk = block(n + 1, n, prev, n as u8);
            prev = Some(blk.hash());
            fixture.volatile.put(&blk).unwrap();
            current.push(blk.header.clone()).unwrap();
            ledger.push(&blk).unwrap();
            blocks.push(blk);
        }

        // A long fork from block 0 that would win on length
        let mut fork_prev = Some(blocks[0].hash());
        for n in 0..20u64 {
            let blk = Block::new(20 + n, 1 + n, fork_prev, false, vec![0xaa, n as u8]);
            fork_prev = Some(blk.hash());
            fixture.volatile.put(&blk).unwrap();
        }

        let outcome = run(&fixture.ctx(100), &current, &ledger, &fixture.invalid);
        assert!(outcome.adopted.is_none());
    }

    /// Applies the shared envelope, then rejects any block whose body
    /// starts with the poison byte.
    struct PoisonLedger;

    impl crate::ledger::Ledger for PoisonLedger {
        fn apply(
            &self,
            state: &LedgerState,
            block: &Block,
        ) -> Result<LedgerState, crate::ledger::LedgerError> {
            let next = crate::ledger::apply_envelope(state, block)?;
            if block.body.first() == Some(&0xee) {
                return Err(crate::ledger::LedgerError {
                    point: block.point(),
                    reason: "poisoned body".into(),
                });
            }
            Ok(next)
        }
    }

    #[test]
    fn invalid_block_truncates_candidate_and_is_recorded() {
        let fixture = Fixture::new();
        let a = block(1, 0, None, 1);
        let b = block(2, 1, Some(a.hash()), 2);
        // Structurally fine, rejected by the ledger rules
        let bad = Block::new(3, 2, Some(b.hash()), false, vec![0xee]);
        for blk in [&a, &b, &bad] {
            fixture.volatile.put(blk).unwrap();
        }

        let ledger = LedgerDb::new(Arc::new(PoisonLedger), LedgerState::genesis());
        let current = AnchoredFragment::new(Anchor::genesis());
        let outcome = run(&fixture.ctx(10), &current, &ledger, &fixture.invalid);

        // The valid prefix is adopted, the bad block recorded
        let adopted = outcome.adopted.unwrap();
        assert_eq!(adopted.chain.head_point(), b.point());
        assert_eq!(outcome.newly_invalid.len(), 1);
        assert_eq!(outcome.newly_invalid[0].0, bad.hash());
    }

    #[test]
    fn candidates_through_known_invalid_blocks_are_dropped() {
        let mut fixture = Fixture::new();
        let a = block(1, 0, None, 1);
        let b = block(2, 1, Some(a.hash()), 2);
        let c = block(3, 2, Some(b.hash()), 3);
        for blk in [&a, &b, &c] {
            fixture.volatile.put(blk).unwrap();
        }
        fixture.invalid.insert(
            b.hash(),
            InvalidBlockInfo {
                reason: InvalidBlockReason::Ledger("known bad".into()),
                slot: 2,
            },
        );

        let current = AnchoredFragment::new(Anchor::genesis());
        let outcome = run(&fixture.ctx(10), &current, &fixture.ledger, &fixture.invalid);

        // Only [a] is adoptable
        let adopted = outcome.adopted.unwrap();
        assert_eq!(adopted.chain.head_point(), a.point());
    }

    #[test]
    fn future_blocks_within_skew_are_deferred() {
        let fixture = Fixture::new();
        let a = block(1, 0, None, 1);
        let soon = block(12, 1, Some(a.hash()), 2);
        fixture.volatile.put(&a).unwrap();
        fixture.volatile.put(&soon).unwrap();

        let current = AnchoredFragment::new(Anchor::genesis());
        // Wall clock at slot 10, skew 2: slot 12 is within skew
        let outcome = run(&fixture.ctx(10), &current, &fixture.ledger, &fixture.invalid);

        let adopted = outcome.adopted.unwrap();
        assert_eq!(adopted.chain.head_point(), a.point());
        assert_eq!(outcome.future.len(), 1);
        assert_eq!(outcome.future[0].hash, soon.hash());

        // Once the clock reaches slot 12 the block is adoptable
        let mut ledger = fixture.ledger.clone();
        ledger.push(&a).unwrap();
        let outcome = run(&fixture.ctx(12), &adopted.chain, &ledger, &fixture.invalid);
        assert_eq!(outcome.adopted.unwrap().chain.head_point(), soon.point());
    }
}
