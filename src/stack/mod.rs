//! The data stack: one durable store under a fixed context tree.
//!
//! Topology: the store is owned by a private writer-root context on its own
//! queue; the main context is the writer's child on the main queue;
//! background contexts are private-queue siblings of main (children of the
//! writer); temporary contexts are scratch children of main sharing main's
//! queue. Background transactions and stale purges run through one
//! serialized scheduler lane.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::StackConfig;
use crate::context::{Context, ContextKind, StackCore};
use crate::error::StackError;
use crate::purge::run_purge;
use crate::queue::QueueHandle;
use crate::save::save_cascading;
use crate::scheduler::TransactionScheduler;
use crate::schema::Schema;
use crate::store::{ObjectStore, SledObjectStore, StoreOptions};

mod default;

pub use default::{default_stack, set_default_stack};

pub struct DataStack {
    core: Arc<StackCore>,
    writer: Arc<Context>,
    main: Arc<Context>,
    main_queue: QueueHandle,
    scheduler: TransactionScheduler,
    child_seq: AtomicU64,
}

impl DataStack {
    /// Open a stack over a sled store at `path` (in-memory when `None`).
    ///
    /// Runs one stale purge pass in the background when the options ask
    /// for it.
    pub fn open(
        schema: Schema,
        path: Option<&Path>,
        options: &StoreOptions,
    ) -> Result<Arc<DataStack>, StackError> {
        let store = SledObjectStore::open(&schema, path, options)?;
        let stack = Self::with_store(schema, Arc::new(store));
        info!(
            path = %path.map(|p| p.display().to_string()).unwrap_or_else(|| "<memory>".into()),
            "data stack opened"
        );
        if options.auto_stale_purge {
            stack.purge_stale(|result| {
                if let Err(err) = result {
                    warn!(error = %err, "startup stale purge failed");
                }
            });
        }
        Ok(stack)
    }

    /// Open a stack from a loaded configuration.
    pub fn from_config(schema: Schema, config: &StackConfig) -> Result<Arc<DataStack>, StackError> {
        Self::open(schema, config.store_path.as_deref(), &config.store)
    }

    /// Build a stack over an already-open store. This is the seam tests and
    /// embedders use to supply their own [`ObjectStore`].
    pub fn with_store(schema: Schema, store: Arc<dyn ObjectStore>) -> Arc<DataStack> {
        let core = Arc::new(StackCore {
            schema: Arc::new(schema),
            store,
        });
        let writer = Context::new(
            "writer",
            ContextKind::WriterRoot,
            Some(QueueHandle::spawn("stratum-writer")),
            None,
            core.clone(),
        );
        let main_queue = QueueHandle::spawn("stratum-main");
        let main = Context::new(
            "main",
            ContextKind::Main,
            Some(main_queue.clone()),
            Some(writer.clone()),
            core.clone(),
        );
        Arc::new(DataStack {
            core,
            writer,
            main,
            main_queue,
            scheduler: TransactionScheduler::new(),
            child_seq: AtomicU64::new(1),
        })
    }

    /// The long-lived main context.
    pub fn main_context(&self) -> &Arc<Context> {
        &self.main
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.core.schema
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.core.store
    }

    /// Mint a background context on its own private queue, sibling of main.
    pub fn background_context(&self) -> Arc<Context> {
        let n = self.child_seq.fetch_add(1, Ordering::Relaxed);
        Context::new(
            format!("background-{}", n),
            ContextKind::Background,
            Some(QueueHandle::spawn(format!("stratum-background-{}", n))),
            Some(self.writer.clone()),
            self.core.clone(),
        )
    }

    /// Mint a scratch child of main, sharing main's queue. Its
    /// [`Context::commit_local`] merges one level into main; reaching the
    /// store still requires a cascading save.
    pub fn temporary_context(&self) -> Arc<Context> {
        let n = self.child_seq.fetch_add(1, Ordering::Relaxed);
        Context::new(
            format!("temporary-{}", n),
            ContextKind::Temporary,
            Some(self.main_queue.clone()),
            Some(self.main.clone()),
            self.core.clone(),
        )
    }

    /// Mint a context with no confinement queue: operations run inline on
    /// the calling thread. Such a context can never be saved by a cascade.
    pub fn caller_confined_context(&self) -> Arc<Context> {
        let n = self.child_seq.fetch_add(1, Ordering::Relaxed);
        Context::new(
            format!("caller-confined-{}", n),
            ContextKind::Background,
            None,
            Some(self.writer.clone()),
            self.core.clone(),
        )
    }

    /// Enqueue one exclusive background transaction: a fresh background
    /// context, `work` on its queue, then a full cascade to the store.
    /// Transactions run strictly one at a time; see [`TransactionScheduler`].
    pub fn perform_background(
        self: &Arc<Self>,
        work: impl FnOnce(&Arc<Context>) -> Result<(), StackError> + Send + 'static,
        on_done: impl FnOnce(Result<(), StackError>) + Send + 'static,
    ) {
        let me = self.clone();
        self.scheduler
            .enqueue(move || me.background_context(), work, on_done);
    }

    /// Save the main context through to the store.
    pub fn save(
        &self,
        wait: bool,
        completion: impl FnOnce(Result<(), StackError>) + Send + 'static,
    ) {
        save_cascading(&self.main, wait, completion);
    }

    /// Save the main context and block until durable.
    pub fn save_and_wait(&self) -> Result<(), StackError> {
        crate::save::save_and_wait(&self.main)
    }

    /// Sweep every entity type declaring a staleness criterion, as one
    /// scheduler transaction. Best-effort across entity types; failures are
    /// aggregated into [`StackError::PurgeFailed`].
    pub fn purge_stale(
        self: &Arc<Self>,
        completion: impl FnOnce(Result<(), StackError>) + Send + 'static,
    ) {
        let me = self.clone();
        run_purge(
            &self.scheduler,
            move || me.background_context(),
            completion,
        );
    }

    /// Block until every background transaction enqueued so far is done.
    pub fn drain_background(&self) {
        self.scheduler.drain();
    }
}

impl std::fmt::Debug for DataStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStack")
            .field("entities", &self.core.schema.descriptors().count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicate::Predicate;
    use crate::schema::EntityDescriptor;
    use crate::types::{EntityName, Fields, Value};

    fn open_stack() -> Arc<DataStack> {
        let schema = Schema::builder()
            .entity(EntityDescriptor::new("person").primary_key("remoteID"))
            .build();
        DataStack::open(
            schema,
            None,
            &StoreOptions {
                in_memory: true,
                ..StoreOptions::default()
            },
        )
        .unwrap()
    }

    fn person() -> EntityName {
        EntityName::from("person")
    }

    #[test]
    fn background_work_becomes_visible_on_main() {
        let stack = open_stack();
        stack.perform_background(
            |ctx| {
                let mut f = Fields::new();
                f.insert("name".into(), Value::Text("A".into()));
                ctx.create(&person(), f)?;
                Ok(())
            },
            |r| r.unwrap(),
        );
        stack.drain_background();

        let rows = stack.main_context().fetch(&person(), Predicate::All).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(stack.store().commit_count(), 1);
    }

    #[test]
    fn temporary_context_merges_into_main_only() {
        let stack = open_stack();
        let temp = stack.temporary_context();
        let id = temp.create(&person(), Fields::new()).unwrap();

        // Invisible to main until the scratch context commits.
        assert!(stack.main_context().get(&person(), id).unwrap().is_none());
        temp.commit_local().unwrap();
        assert!(stack.main_context().get(&person(), id).unwrap().is_some());
        // Still not durable.
        assert_eq!(stack.store().commit_count(), 0);

        stack.save_and_wait().unwrap();
        assert_eq!(stack.store().commit_count(), 1);
    }

    #[test]
    fn main_edits_cascade_through_writer() {
        let stack = open_stack();
        let id = stack
            .main_context()
            .create(&person(), Fields::new())
            .unwrap();
        stack.save_and_wait().unwrap();
        assert!(stack.store().get(&person(), id).unwrap().is_some());
    }
}
