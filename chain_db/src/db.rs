//! The chain database handle.
//!
//! One handle owns the three storage layers, the in-memory current
//! chain, the add-block pipeline and every background task. All
//! invariant-carrying state lives behind a single lock, so each
//! mutation is one transaction: readers observe the old state or the
//! new one, never a mix.

use crate::component::{self, BlockComponent, ComponentValue};
use crate::config::{ChainDbConfig, ValidationPolicy};
use crate::error::{ChainDbError, InvalidBlockInfo, InvalidBlockReason};
use crate::immutable::{ChunkInfo, ImmutableDb};
use crate::iterator::ChainIterator;
use crate::ledger::{self, Ledger, LedgerDb, LedgerState, SnapshotStore};
use crate::marker::{self, DirLock};
use crate::queue::{AddBlockPromise, QueuedBlock};
use crate::reader::{Reader, ReaderShared};
use crate::registry::ResourceRegistry;
use naos_common::ChainOrder;
use crate::volatile::VolatileDb;
use crate::worker;
use dashmap::DashMap;
use imbl::HashMap as ImblHashMap;
use naos_common::{
    Anchor, AnchoredFragment, Block, BlockHash, Clock, Fingerprint, Header, Point,
    WithFingerprint,
};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// The invariant-carrying composite state.
pub(crate) struct ChainState {
    /// Current chain fragment, anchored at the immutable tip.
    pub chain: Arc<AnchoredFragment>,
    /// Ledger states from the immutable tip to the current tip.
    pub ledger: LedgerDb,
    /// Blocks that failed validation, with the fingerprint consumers
    /// cache decisions against.
    pub invalid: ImblHashMap<BlockHash, InvalidBlockInfo>,
    pub invalid_fingerprint: Fingerprint,
    /// Blocks within clock skew waiting for their slot.
    pub future_blocks: HashMap<BlockHash, Header>,
}

pub(crate) struct ChainDbInner {
    pub config: ChainDbConfig,
    pub clock: Arc<dyn Clock>,
    pub rule: Arc<dyn ChainOrder>,
    pub immutable: Arc<ImmutableDb>,
    pub volatile: Arc<VolatileDb>,
    pub snapshots: SnapshotStore,
    pub state: RwLock<ChainState>,
    pub queue_tx: mpsc::Sender<QueuedBlock>,
    pub readers: DashMap<u64, Arc<ReaderShared>>,
    pub iterators: DashMap<u64, Arc<AtomicBool>>,
    next_key: AtomicU64,
    closed: AtomicBool,
    chain_version: watch::Sender<u64>,
    pub registry: ResourceRegistry,
    pub copy_notify: Notify,
    pub copy_lock: AsyncMutex<()>,
    pub copied_since_snapshot: AtomicU64,
    pub gc_schedule: StdMutex<VecDeque<(Instant, u64)>>,
    pub gc_notify: Notify,
    lock: StdMutex<Option<DirLock>>,
}

impl ChainDbInner {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn chain_snapshot(&self) -> Arc<AnchoredFragment> {
        self.state.read().unwrap().chain.clone()
    }

    pub fn bump_chain_version(&self) {
        self.chain_version.send_modify(|version| *version += 1);
    }

    pub fn subscribe_chain(&self) -> watch::Receiver<u64> {
        self.chain_version.subscribe()
    }

    pub fn register_iterator(&self) -> (u64, Arc<AtomicBool>) {
        let key = self.next_key.fetch_add(1, Ordering::SeqCst);
        let flag = Arc::new(AtomicBool::new(false));
        self.iterators.insert(key, Arc::clone(&flag));
        (key, flag)
    }

    /// Read one component from either store, volatile first.
    pub fn get_component_any(
        &self,
        point: &Point,
        component: BlockComponent,
    ) -> Result<Option<ComponentValue>, ChainDbError> {
        if let Some(hash) = point.hash() {
            if let Some(block) = self.volatile.get(&hash)? {
                return Ok(Some(component::from_block(block, component)));
            }
        }
        Ok(self.immutable.get_component(point, component)?)
    }

    /// Tear everything down. Idempotent; `clean` decides whether the
    /// clean-shutdown marker is written for the next open.
    pub fn shutdown(&self, clean: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(clean, "closing chain database");

        self.registry.abort_all();

        for entry in self.readers.iter() {
            entry.value().close();
        }
        self.readers.clear();
        for entry in self.iterators.iter() {
            entry.value().store(true, Ordering::SeqCst);
        }
        self.iterators.clear();

        // Wake any blocked reader so it observes the closed handle
        self.bump_chain_version();

        // Storage layers close volatile -> ledger -> immutable
        if let Err(err) = self.volatile.close() {
            warn!("volatile close failed: {err}");
        }
        if clean {
            let anchor_state = self.state.read().unwrap().ledger.anchor().clone();
            if !anchor_state.tip.is_origin() {
                if let Err(err) = self.snapshots.write(&anchor_state) {
                    warn!("final ledger snapshot failed: {err:#}");
                }
            }
        }
        if let Err(err) = self.immutable.close() {
            warn!("immutable close failed: {err}");
        }

        if clean {
            if let Err(err) = marker::write_clean_marker(&self.config.root_path) {
                warn!("could not write clean marker: {err}");
            }
        }
        *self.lock.lock().unwrap() = None;
    }
}

/// Handle to the chain database.
pub struct ChainDb {
    inner: Arc<ChainDbInner>,
}

impl ChainDb {
    /// Open (or create) the database under the configured root.
    ///
    /// When the clean-shutdown marker is absent, both stores are fully
    /// validated regardless of the configured policies.
    pub async fn open(
        config: ChainDbConfig,
        ledger: Arc<dyn Ledger>,
        rule: Arc<dyn ChainOrder>,
        clock: Arc<dyn Clock>,
    ) -> Result<ChainDb, ChainDbError> {
        fs::create_dir_all(&config.root_path)?;
        let lock = DirLock::acquire(&config.root_path)?;
        marker::check_magic(&config.root_path, config.protocol_magic)?;

        let clean = marker::take_clean_marker(&config.root_path)?;
        let (immutable_policy, volatile_policy) = if clean {
            (config.immutable_validation, config.volatile_validation)
        } else {
            info!("no clean-shutdown marker, forcing full validation");
            (ValidationPolicy::ValidateAll, ValidationPolicy::ValidateAll)
        };

        let immutable = Arc::new(ImmutableDb::open(
            config.immutable_path(),
            ChunkInfo::new(config.slots_per_chunk),
            immutable_policy,
        )?);
        let volatile = Arc::new(VolatileDb::open(
            config.volatile_path(),
            config.blocks_per_segment,
            volatile_policy,
        )?);
        let snapshots = SnapshotStore::open(config.ledger_path(), config.snapshots_retained)
            .map_err(|err| ChainDbError::Corruption(format!("{err:#}")))?;

        let ledger_db = ledger::restore(ledger, &snapshots, &immutable)?;

        let anchor = match immutable.tip() {
            Some(tip) => Anchor::at(tip.point, tip.block_number),
            None => Anchor::genesis(),
        };
        let state = ChainState {
            chain: Arc::new(AnchoredFragment::new(anchor)),
            ledger: ledger_db,
            invalid: ImblHashMap::new(),
            invalid_fingerprint: Fingerprint::default(),
            future_blocks: HashMap::new(),
        };

        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity);
        let (chain_version, _) = watch::channel(0);

        let inner = Arc::new(ChainDbInner {
            config,
            clock,
            rule,
            immutable,
            volatile,
            snapshots,
            state: RwLock::new(state),
            queue_tx,
            readers: DashMap::new(),
            iterators: DashMap::new(),
            next_key: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            chain_version,
            registry: ResourceRegistry::default(),
            copy_notify: Notify::new(),
            copy_lock: AsyncMutex::new(()),
            copied_since_snapshot: AtomicU64::new(0),
            gc_schedule: StdMutex::new(VecDeque::new()),
            gc_notify: Notify::new(),
            lock: StdMutex::new(Some(lock)),
        });

        // Blocks left in the volatile store may already extend the
        // immutable tip
        worker::run_selection_to_fixpoint(&inner)?;
        info!(
            tip = %inner.chain_snapshot().head_point(),
            k = inner.config.security_parameter_k,
            clock_skew_slots = inner.config.clock_skew_slots,
            "chain database open"
        );

        inner.registry.register(tokio::spawn(worker::run_worker(
            Arc::clone(&inner),
            queue_rx,
        )));
        inner
            .registry
            .register(tokio::spawn(worker::run_copy_task(Arc::clone(&inner))));
        inner
            .registry
            .register(tokio::spawn(worker::run_gc_task(Arc::clone(&inner))));

        Ok(ChainDb { inner })
    }

    /// Enqueue a block for persistence and chain selection.
    ///
    /// Hopeless blocks are rejected up front with a pre-resolved
    /// promise; everything else resolves as the pipeline progresses.
    pub async fn add_block(&self, block: Block) -> Result<AddBlockPromise, ChainDbError> {
        if self.inner.is_closed() {
            return Err(ChainDbError::ClosedDb);
        }

        let header = &block.header;
        let hash = block.hash();
        let now = self.inner.clock.current_slot();

        if header.slot > now + self.inner.config.clock_skew_slots {
            let tip = {
                let mut state = self.inner.state.write().unwrap();
                let info = InvalidBlockInfo {
                    reason: InvalidBlockReason::ExceedsClockSkew {
                        slot: header.slot,
                        current_slot: now,
                    },
                    slot: header.slot,
                };
                if state.invalid.insert(hash, info).is_none() {
                    state.invalid_fingerprint.bump();
                }
                state.chain.head_point()
            };
            warn!(block = %block.point(), now, "block exceeds clock skew, marked invalid");
            return Ok(AddBlockPromise::resolved(false, tip));
        }

        {
            let state = self.inner.state.read().unwrap();
            let tip = state.chain.head_point();

            if let Some(tip_number) = state.chain.head_block_number() {
                if header.number + self.inner.config.security_parameter_k <= tip_number {
                    debug!(block = %block.point(), "ignoring block older than k");
                    return Ok(AddBlockPromise::resolved(false, tip));
                }
            }
            if state.invalid.contains_key(&hash) {
                debug!(block = %block.point(), "ignoring known-invalid block");
                return Ok(AddBlockPromise::resolved(false, tip));
            }
            if self.inner.volatile.member(&hash) {
                debug!(block = %block.point(), "block already in the volatile store");
                return Ok(AddBlockPromise::resolved(true, tip));
            }
        }

        let (promise, written_tx, processed_tx) = AddBlockPromise::channels();
        self.inner
            .queue_tx
            .send(QueuedBlock {
                block,
                written_tx,
                processed_tx,
            })
            .await
            .map_err(|_| ChainDbError::ClosedDb)?;
        Ok(promise)
    }

    /// Snapshot of the current chain fragment (last <= k headers, plus
    /// any suffix not yet copied to the immutable store).
    pub fn current_chain(&self) -> Arc<AnchoredFragment> {
        self.inner.chain_snapshot()
    }

    /// Snapshot of the ledger state at the current tip.
    pub fn current_ledger(&self) -> LedgerState {
        self.inner.state.read().unwrap().ledger.current().clone()
    }

    pub fn tip_point(&self) -> Point {
        self.inner.chain_snapshot().head_point()
    }

    pub fn tip_block_number(&self) -> Option<u64> {
        self.inner.chain_snapshot().head_block_number()
    }

    pub fn tip_header(&self) -> Option<Header> {
        self.inner
            .chain_snapshot()
            .head()
            .cloned()
            .or_else(|| self.inner.immutable.tip_header())
    }

    /// Look a block up across both stores.
    pub fn get_block(&self, point: &Point) -> Result<Option<Block>, ChainDbError> {
        if self.inner.is_closed() {
            return Err(ChainDbError::ClosedDb);
        }
        Ok(self
            .inner
            .get_component_any(point, BlockComponent::Block)?
            .and_then(ComponentValue::into_block))
    }

    /// Predicate for the block-fetch decision engine.
    pub fn is_fetched(&self) -> impl Fn(&Point) -> bool + Send + Sync + 'static {
        let volatile = Arc::clone(&self.inner.volatile);
        let immutable = Arc::clone(&self.inner.immutable);
        move |point| match point.hash() {
            None => true,
            Some(hash) => volatile.member(&hash) || immutable.contains(point),
        }
    }

    /// The invalid-block set with its fingerprint.
    pub fn invalid_blocks(
        &self,
    ) -> WithFingerprint<ImblHashMap<BlockHash, InvalidBlockInfo>> {
        let state = self.inner.state.read().unwrap();
        WithFingerprint::new(state.invalid.clone(), state.invalid_fingerprint)
    }

    /// Stream the blocks of `[from, to]` as the chosen component.
    pub fn stream(
        &self,
        from: Point,
        to: Point,
        component: BlockComponent,
    ) -> Result<ChainIterator, ChainDbError> {
        if self.inner.is_closed() {
            return Err(ChainDbError::ClosedDb);
        }
        ChainIterator::plan(&self.inner, from, to, component)
    }

    /// Open a reader following the current chain.
    pub fn new_reader(&self, component: BlockComponent) -> Result<Reader, ChainDbError> {
        if self.inner.is_closed() {
            return Err(ChainDbError::ClosedDb);
        }
        let key = self.inner.next_key.fetch_add(1, Ordering::SeqCst);
        let shared = Arc::new(ReaderShared::new());
        self.inner.readers.insert(key, Arc::clone(&shared));
        Ok(Reader::new(
            Arc::clone(&self.inner),
            key,
            component,
            shared,
            self.inner.subscribe_chain(),
        ))
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Close the database: stop background tasks, close readers and
    /// iterators, flush the stores and mark the shutdown clean.
    pub async fn close(&self) {
        self.inner.shutdown(true);
    }
}

impl Drop for ChainDb {
    fn drop(&mut self) {
        // Without an explicit close the shutdown is not clean: the
        // next open will run full validation
        if !self.inner.is_closed() {
            self.inner.shutdown(false);
        }
    }
}
