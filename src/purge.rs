//! Stale object purging.
//!
//! A purge is one exclusive scheduler transaction that sweeps every entity
//! type declaring a staleness criterion and deletes the matching objects.
//! Criteria are re-evaluated at sweep time so time-relative cutoffs stay
//! current. The sweep is best-effort: a failure on one entity type does
//! not stop the others, and whatever deleted cleanly still commits; all
//! failures are aggregated into [`StackError::PurgeFailed`].

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::context::Context;
use crate::error::StackError;
use crate::scheduler::TransactionScheduler;

pub(crate) fn run_purge(
    scheduler: &TransactionScheduler,
    spawn_context: impl FnOnce() -> Arc<Context> + Send + 'static,
    completion: impl FnOnce(Result<(), StackError>) + Send + 'static,
) {
    let failures: Arc<Mutex<Vec<StackError>>> = Arc::new(Mutex::new(Vec::new()));
    let failures_in = failures.clone();

    scheduler.enqueue(
        spawn_context,
        move |ctx| {
            let schema = ctx.schema().clone();
            let mut purged = 0usize;
            for descriptor in schema.descriptors() {
                let Some(criterion) = descriptor.staleness_criterion() else {
                    continue;
                };
                match ctx.delete_where(descriptor.name(), criterion()) {
                    Ok(n) => {
                        purged += n;
                        if n > 0 {
                            debug!(entity = %descriptor.name(), deleted = n, "purged stale objects");
                        }
                    }
                    Err(err) => {
                        error!(entity = %descriptor.name(), error = %err, "stale purge failed for entity type");
                        failures_in.lock().push(err);
                    }
                }
            }
            info!(deleted = purged, "stale purge swept");
            // Whatever deleted cleanly commits even when some entity types
            // failed above.
            Ok(())
        },
        move |save_result| {
            let mut errors = std::mem::take(&mut *failures.lock());
            if let Err(err) = save_result {
                errors.push(err);
            }
            if errors.is_empty() {
                completion(Ok(()));
            } else {
                completion(Err(StackError::PurgeFailed { errors }));
            }
        },
    );
}
