//! Background tasks: the add-block worker, the copy-to-immutable task
//! and the scheduled garbage collector.
//!
//! Exactly one worker drains the block queue, so chain selection is
//! totally serialized. Storage-layer failures are fatal: the worker
//! closes the database and stops, leaving in-flight promises to
//! resolve as closed.

use crate::db::ChainDbInner;
use crate::error::ChainDbError;
use crate::queue::QueuedBlock;
use crate::selection::{self, SelectionContext, SelectionOutcome};
use naos_common::{BlockHash, Point};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub(crate) async fn run_worker(inner: Arc<ChainDbInner>, mut queue: mpsc::Receiver<QueuedBlock>) {
    while let Some(queued) = queue.recv().await {
        if inner.is_closed() {
            break;
        }
        if let Err(err) = process_block(&inner, queued) {
            error!("add-block worker failed: {err}");
            inner.shutdown(false);
            break;
        }
    }
}

fn process_block(inner: &Arc<ChainDbInner>, queued: QueuedBlock) -> Result<(), ChainDbError> {
    let QueuedBlock {
        block,
        written_tx,
        processed_tx,
    } = queued;

    // Persist first; the promise must not resolve before durability
    inner.volatile.put(&block)?;
    let _ = written_tx.send(true);

    // A block from the near future waits in the wings
    let now = inner.clock.current_slot();
    if block.header.slot > now {
        let tip = {
            let mut state = inner.state.write().unwrap();
            state.future_blocks.insert(block.hash(), block.header.clone());
            state.chain.head_point()
        };
        debug!(block = %block.point(), now, "deferring block from the near future");
        let _ = processed_tx.send(tip);
        return Ok(());
    }

    let tip = run_selection_to_fixpoint(inner)?;
    let _ = processed_tx.send(tip);
    Ok(())
}

/// Run chain selection, retrying whenever deferred future blocks
/// mature, until nothing more can change.
pub(crate) fn run_selection_to_fixpoint(inner: &Arc<ChainDbInner>) -> Result<Point, ChainDbError> {
    loop {
        let (chain, ledger, invalid) = {
            let state = inner.state.read().unwrap();
            (state.chain.clone(), state.ledger.clone(), state.invalid.clone())
        };
        let now = inner.clock.current_slot();
        let ctx = SelectionContext {
            volatile: &inner.volatile,
            immutable: &inner.immutable,
            rule: inner.rule.as_ref(),
            k: inner.config.security_parameter_k,
            current_slot: now,
            clock_skew: inner.config.clock_skew_slots,
        };
        let outcome = selection::run(&ctx, &chain, &ledger, &invalid);
        let rerun = commit_outcome(inner, outcome, now)?;
        if !rerun {
            return Ok(inner.state.read().unwrap().chain.head_point());
        }
    }
}

/// Apply a selection outcome under one state transaction. Returns
/// whether selection must run again because future blocks matured.
fn commit_outcome(
    inner: &Arc<ChainDbInner>,
    outcome: SelectionOutcome,
    now: u64,
) -> Result<bool, ChainDbError> {
    let mut newly_invalid: Vec<BlockHash> = Vec::new();
    let mut switch = None;
    let rerun;
    {
        let mut state = inner.state.write().unwrap();

        for (hash, info) in outcome.newly_invalid {
            if state.invalid.insert(hash, info).is_none() {
                state.invalid_fingerprint.bump();
            }
            state.future_blocks.remove(&hash);
            newly_invalid.push(hash);
        }

        for header in outcome.future {
            state.future_blocks.entry(header.hash).or_insert(header);
        }

        if let Some(adopted) = outcome.adopted {
            let new_chain = Arc::new(adopted.chain);
            state.chain = Arc::clone(&new_chain);
            state.ledger = adopted.ledger;
            switch = Some((adopted.rollback_point, new_chain, adopted.suffix.len()));
        }

        let matured: Vec<BlockHash> = state
            .future_blocks
            .iter()
            .filter(|(_, header)| header.slot <= now)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in &matured {
            state.future_blocks.remove(hash);
        }
        rerun = !matured.is_empty();
    }

    // Invalid blocks never get copied and are dropped from disk
    for hash in &newly_invalid {
        inner.volatile.delete(hash)?;
    }

    if let Some((rollback_point, new_chain, adopted_count)) = switch {
        info!(
            tip = %new_chain.head_point(),
            adopted = adopted_count,
            rollback = %rollback_point,
            "chain selection adopted a new chain"
        );
        for reader in inner.readers.iter() {
            reader.value().on_switch_fork(&rollback_point, &new_chain, &inner.immutable);
        }
        inner.bump_chain_version();
        if new_chain.len() as u64 > inner.config.security_parameter_k {
            inner.copy_notify.notify_one();
        }
    }

    Ok(rerun)
}

/// Copy the suffix of the current chain older than k into the
/// immutable store, then schedule a volatile garbage collection.
pub(crate) async fn run_copy_task(inner: Arc<ChainDbInner>) {
    loop {
        tokio::select! {
            _ = inner.copy_notify.notified() => {}
            _ = tokio::time::sleep(inner.config.copy_interval) => {}
        }
        if inner.is_closed() {
            break;
        }
        if let Err(err) = copy_to_immutable(&inner).await {
            error!("copy-to-immutable failed: {err}");
            inner.shutdown(false);
            break;
        }
    }
}

async fn copy_to_immutable(inner: &Arc<ChainDbInner>) -> Result<(), ChainDbError> {
    // The copy lock serializes copy cycles against each other only
    let _guard = inner.copy_lock.lock().await;

    let to_copy = {
        let state = inner.state.read().unwrap();
        let len = state.chain.len() as u64;
        let k = inner.config.security_parameter_k;
        if len <= k {
            return Ok(());
        }
        let excess = (len - k) as usize;
        state.chain.headers().take(excess).cloned().collect::<Vec<_>>()
    };
    if to_copy.is_empty() {
        return Ok(());
    }

    for header in &to_copy {
        let block = inner.volatile.get(&header.hash)?.ok_or_else(|| {
            ChainDbError::Corruption(format!(
                "chain block {} missing from the volatile store during copy",
                header.point()
            ))
        })?;
        inner.immutable.append(&block)?;
    }

    let new_anchor = to_copy.last().expect("non-empty copy set").point();
    {
        let mut state = inner.state.write().unwrap();
        let mut chain = (*state.chain).clone();
        chain.drop_oldest(to_copy.len());
        state.chain = Arc::new(chain);
        state.ledger.advance_anchor(&new_anchor);
    }
    inner.bump_chain_version();
    debug!(copied = to_copy.len(), immutable_tip = %new_anchor, "copied blocks to the immutable store");

    let copied =
        inner.copied_since_snapshot.fetch_add(to_copy.len() as u64, Ordering::SeqCst)
            + to_copy.len() as u64;
    if copied >= inner.config.snapshot_interval {
        inner.copied_since_snapshot.store(0, Ordering::SeqCst);
        let anchor_state = inner.state.read().unwrap().ledger.anchor().clone();
        if let Err(err) = inner.snapshots.write(&anchor_state) {
            warn!("ledger snapshot failed: {err:#}");
        }
    }

    // The copied blocks stay in the volatile store until the delayed
    // collection; readers mid-stream get a grace period
    let due = Instant::now() + inner.config.gc_delay;
    let gc_slot = new_anchor.slot().unwrap_or(0);
    inner.gc_schedule.lock().unwrap().push_back((due, gc_slot));
    inner.gc_notify.notify_one();
    Ok(())
}

/// Drain the garbage-collection schedule as entries fall due.
pub(crate) async fn run_gc_task(inner: Arc<ChainDbInner>) {
    loop {
        if inner.is_closed() {
            break;
        }
        let next = inner.gc_schedule.lock().unwrap().front().copied();
        match next {
            None => {
                tokio::select! {
                    _ = inner.gc_notify.notified() => {}
                    _ = tokio::time::sleep(inner.config.copy_interval) => {}
                }
            }
            Some((due, slot)) => {
                tokio::time::sleep_until(due).await;
                if inner.is_closed() {
                    break;
                }
                inner.gc_schedule.lock().unwrap().pop_front();
                match inner.volatile.garbage_collect(slot) {
                    Ok(removed) if !removed.is_empty() => {
                        debug!(slot, removed = removed.len(), "scheduled garbage collection");
                    }
                    Ok(_) => {}
                    Err(err) => {
                        error!("garbage collection failed: {err}");
                        inner.shutdown(false);
                        break;
                    }
                }
            }
        }
    }
}
