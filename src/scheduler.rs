//! Serialized background transactions.
//!
//! One lane queue runs enqueued transactions strictly one at a time: each
//! transaction gets a fresh background context, runs its work on that
//! context's queue, and (on success) is cascaded all the way to the durable
//! store before the next transaction starts. Transaction N+1 therefore
//! always observes N's committed effects. Failed work discards its context
//! and never reaches the store.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::context::Context;
use crate::error::StackError;
use crate::queue::{dispatch_completion, QueueHandle};
use crate::save::save_and_wait;

pub struct TransactionScheduler {
    lane: QueueHandle,
}

impl TransactionScheduler {
    pub fn new() -> Self {
        Self {
            lane: QueueHandle::spawn("stratum-txn-lane"),
        }
    }

    /// Enqueue one exclusive transaction.
    ///
    /// `spawn_context` mints the transaction's private context once the lane
    /// reaches it; `work` runs confined to that context; `on_done` is
    /// marshaled back to the queue that enqueued the transaction.
    pub fn enqueue(
        &self,
        spawn_context: impl FnOnce() -> Arc<Context> + Send + 'static,
        work: impl FnOnce(&Arc<Context>) -> Result<(), StackError> + Send + 'static,
        on_done: impl FnOnce(Result<(), StackError>) + Send + 'static,
    ) {
        let origin = QueueHandle::current();
        self.lane.perform(move || {
            let ctx = spawn_context();
            debug!(context = %ctx.label(), "transaction started");
            let result = match ctx.perform_wait(move |c| work(c)) {
                // The lane blocks until the cascade is durable, so the next
                // transaction cannot start against a half-committed store.
                Ok(()) => save_and_wait(&ctx),
                Err(err) => {
                    warn!(context = %ctx.label(), error = %err, "transaction failed, discarding");
                    ctx.reset();
                    Err(err)
                }
            };
            dispatch_completion(origin, move || on_done(result));
        });
    }

    /// Block until every transaction enqueued so far has fully completed.
    pub fn drain(&self) {
        self.lane.perform_wait(|| ());
    }
}

impl Default for TransactionScheduler {
    fn default() -> Self {
        Self::new()
    }
}
