//! Ownership of background tasks.
//!
//! Every task spawned by the database is registered here so that
//! closing the handle reliably kills them all, normal or exceptional
//! exit alike.

use std::sync::Mutex;
use tokio::task::JoinHandle;

#[derive(Default)]
pub(crate) struct ResourceRegistry {
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ResourceRegistry {
    pub fn register(&self, task: JoinHandle<()>) {
        self.tasks.lock().unwrap().push(task);
    }

    /// Abort every registered task. Idempotent; aborting a finished
    /// task is a no-op.
    pub fn abort_all(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

impl Drop for ResourceRegistry {
    fn drop(&mut self) {
        self.abort_all();
    }
}
