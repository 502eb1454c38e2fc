//! The add-block queue and its per-block promises.

use crate::error::ChainDbError;
use naos_common::{Block, Point};
use tokio::sync::oneshot;

/// One enqueued block with the senders resolving its promises.
pub(crate) struct QueuedBlock {
    pub block: Block,
    pub written_tx: oneshot::Sender<bool>,
    pub processed_tx: oneshot::Sender<Point>,
}

/// The two futures handed back by `add_block`.
///
/// `written_to_disk` resolves `true` once the block is durable in the
/// volatile store, `false` if it was rejected before persistence.
/// `processed` resolves to the current tip after chain selection has
/// run for the block. For the same block, `written_to_disk` always
/// resolves before `processed`. Promises of blocks in flight when the
/// database closes resolve with [`ChainDbError::ClosedDb`].
pub struct AddBlockPromise {
    written: oneshot::Receiver<bool>,
    processed: oneshot::Receiver<Point>,
}

impl AddBlockPromise {
    pub(crate) fn channels() -> (AddBlockPromise, oneshot::Sender<bool>, oneshot::Sender<Point>) {
        let (written_tx, written) = oneshot::channel();
        let (processed_tx, processed) = oneshot::channel();
        (AddBlockPromise { written, processed }, written_tx, processed_tx)
    }

    /// A promise resolved on the spot, for blocks rejected (or already
    /// settled) before entering the queue.
    pub(crate) fn resolved(written: bool, tip: Point) -> AddBlockPromise {
        let (promise, written_tx, processed_tx) = Self::channels();
        let _ = written_tx.send(written);
        let _ = processed_tx.send(tip);
        promise
    }

    pub async fn written_to_disk(&mut self) -> Result<bool, ChainDbError> {
        (&mut self.written).await.map_err(|_| ChainDbError::ClosedDb)
    }

    pub async fn processed(self) -> Result<Point, ChainDbError> {
        self.processed.await.map_err(|_| ChainDbError::ClosedDb)
    }
}
