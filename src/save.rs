//! Cascading saves: push a context's pending mutations level by level up
//! the tree until the writer root performs the durable store write.
//!
//! A save with no pending mutations completes successfully without any
//! store I/O. The originator's pending set is retired only after the whole
//! cascade has landed durably, so a failure anywhere above leaves the
//! originator's work intact and the save retryable; the store's merge
//! semantics make a retried batch idempotent.

use std::sync::Arc;

use tracing::{debug, info};

use crate::context::Context;
use crate::error::StackError;
use crate::queue::{dispatch_completion, QueueHandle};

fn assert_chain_confined(ctx: &Arc<Context>) {
    let mut level = Some(ctx.clone());
    while let Some(current) = level {
        if current.queue_handle().is_none() {
            panic!(
                "cascading save requires queue-confined contexts; '{}' is caller-confined",
                current.label()
            );
        }
        level = current.parent().cloned();
    }
}

fn run_cascade(ctx: &Arc<Context>) -> Result<(), StackError> {
    let (batch, last_seq) = ctx.perform_wait(|c| c.snapshot_pending());
    if batch.is_empty() {
        debug!(context = %ctx.label(), "saved without changes");
        return Ok(());
    }

    info!(context = %ctx.label(), mutations = batch.len(), "cascading save");
    ctx.perform_wait(move |c| c.commit_batch_upward(&batch))?;

    // Each ancestor commits one level up on its own queue. Waits only ever
    // go upward, so a blocked child worker cannot deadlock its parent.
    let mut level = ctx.parent().cloned();
    while let Some(current) = level {
        current.commit_local()?;
        level = current.parent().cloned();
    }

    // Root write landed; only now retire the originator's pending set.
    ctx.perform_wait(move |c| c.mark_committed(last_seq));
    Ok(())
}

/// Save `ctx` and block until the durable store write completes (or fails).
///
/// Panics if any context in the chain is caller-confined.
pub fn save_and_wait(ctx: &Arc<Context>) -> Result<(), StackError> {
    assert_chain_confined(ctx);
    run_cascade(ctx)
}

/// Commit each remaining level on its own queue, chained by continuations,
/// then retire the originator's pending set once the root write lands.
fn ascend(
    level: Option<Arc<Context>>,
    originator: Arc<Context>,
    last_seq: u64,
    origin: Option<QueueHandle>,
    completion: Box<dyn FnOnce(Result<(), StackError>) + Send>,
) {
    let Some(current) = level else {
        originator.perform(move |o| {
            o.mark_committed(last_seq);
            dispatch_completion(origin, move || completion(Ok(())));
        });
        return;
    };
    current.perform(move |c| match c.commit_local() {
        Ok(()) => ascend(c.parent().cloned(), originator, last_seq, origin, completion),
        Err(err) => dispatch_completion(origin, move || completion(Err(err))),
    });
}

/// Save `ctx`, either synchronously (`wait`) or asynchronously. The async
/// cascade commits each level on that level's own queue: the originator's
/// queue is released after its local commit and never blocks on the durable
/// store write. The completion is marshaled back to whichever queue
/// initiated the save.
///
/// Panics if any context in the chain is caller-confined.
pub fn save_cascading(
    ctx: &Arc<Context>,
    wait: bool,
    completion: impl FnOnce(Result<(), StackError>) + Send + 'static,
) {
    assert_chain_confined(ctx);
    if wait {
        completion(run_cascade(ctx));
        return;
    }

    let origin = QueueHandle::current();
    let completion: Box<dyn FnOnce(Result<(), StackError>) + Send> = Box::new(completion);
    ctx.perform(move |c| {
        let (batch, last_seq) = c.snapshot_pending();
        if batch.is_empty() {
            debug!(context = %c.label(), "saved without changes");
            dispatch_completion(origin, move || completion(Ok(())));
            return;
        }
        info!(context = %c.label(), mutations = batch.len(), "cascading save");
        if let Err(err) = c.commit_batch_upward(&batch) {
            dispatch_completion(origin, move || completion(Err(err)));
            return;
        }
        match c.parent().cloned() {
            Some(parent) => ascend(Some(parent), c.clone(), last_seq, origin, completion),
            None => {
                // The originator is the writer root, so the commit above
                // was already the durable write.
                c.mark_committed(last_seq);
                dispatch_completion(origin, move || completion(Ok(())));
            }
        }
    });
}
