//! Transaction contexts: confined units of pending work against the store.
//!
//! A context records inserts, updates, and deletes without touching the
//! store; reads overlay its pending state on top of its parent's view (or
//! the store at the writer root). Every context is bound to one confinement
//! queue, and all state access happens on that queue. Cross-context object
//! references are forbidden; the same logical entity is addressed in
//! another context by its stable [`ObjectId`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::error::StackError;
use crate::import::cache::ImportCache;
use crate::predicate::Predicate;
use crate::queue::QueueHandle;
use crate::schema::Schema;
use crate::store::{ObjectStore, PendingMutation};
use crate::types::{EntityName, Fields, ObjectId, ObjectKey, Value};

/// Immutable per-stack state shared by every context in the tree.
pub(crate) struct StackCore {
    pub(crate) schema: Arc<Schema>,
    pub(crate) store: Arc<dyn ObjectStore>,
}

/// Position of a context in the fixed tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    /// Root of the tree; its local commit is the durable store write.
    WriterRoot,
    /// Singleton child of the writer, bound to the stack's main queue.
    Main,
    /// Private-queue sibling of main (child of the writer).
    Background,
    /// Scratch child of main, confined to main's queue.
    Temporary,
}

pub(crate) struct ContextState {
    /// Locally materialized field values, overlaid on the parent's view.
    overrides: HashMap<ObjectKey, Fields>,
    /// Objects created in this context and not yet present below it.
    inserted: HashSet<ObjectKey>,
    /// Objects deleted in this context.
    tombstones: HashSet<ObjectKey>,
    /// Ordered pending mutations, tagged with a per-context sequence so a
    /// cascade can later retire exactly the mutations it committed.
    dirty: Vec<(u64, PendingMutation)>,
    next_seq: u64,
    pub(crate) import_cache: ImportCache,
}

impl ContextState {
    fn new() -> Self {
        Self {
            overrides: HashMap::new(),
            inserted: HashSet::new(),
            tombstones: HashSet::new(),
            dirty: Vec::new(),
            next_seq: 1,
            import_cache: ImportCache::new(),
        }
    }

    fn push_dirty(&mut self, mutation: PendingMutation) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.dirty.push((seq, mutation));
    }
}

/// One confined unit of pending mutations. See the module docs.
pub struct Context {
    label: String,
    kind: ContextKind,
    parent: Option<Arc<Context>>,
    /// `None` means caller-confined: operations run inline on whichever
    /// thread calls them. Such contexts cannot participate in a cascade.
    queue: Option<QueueHandle>,
    core: Arc<StackCore>,
    state: Mutex<ContextState>,
}

impl Context {
    pub(crate) fn new(
        label: impl Into<String>,
        kind: ContextKind,
        queue: Option<QueueHandle>,
        parent: Option<Arc<Context>>,
        core: Arc<StackCore>,
    ) -> Arc<Context> {
        Arc::new(Context {
            label: label.into(),
            kind,
            parent,
            queue,
            core,
            state: Mutex::new(ContextState::new()),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    pub fn parent(&self) -> Option<&Arc<Context>> {
        self.parent.as_ref()
    }

    pub fn schema(&self) -> &Schema {
        &self.core.schema
    }

    pub(crate) fn queue_handle(&self) -> Option<&QueueHandle> {
        self.queue.as_ref()
    }

    // ------------------------------------------------------------------
    // Queue hops
    // ------------------------------------------------------------------

    /// Run `f` on this context's confinement queue and return its result.
    /// Runs inline when already on the queue (or when caller-confined).
    pub fn perform_wait<R: Send + 'static>(
        self: &Arc<Self>,
        f: impl FnOnce(&Arc<Context>) -> R + Send + 'static,
    ) -> R {
        match &self.queue {
            Some(q) if !q.is_current() => {
                let me = self.clone();
                q.perform_wait(move || f(&me))
            }
            _ => f(self),
        }
    }

    /// Enqueue `f` on this context's confinement queue without waiting.
    pub fn perform(self: &Arc<Self>, f: impl FnOnce(&Arc<Context>) + Send + 'static) {
        match &self.queue {
            Some(q) => {
                let me = self.clone();
                q.perform(move || f(&me));
            }
            None => f(self),
        }
    }

    fn assert_confined(&self) {
        if let Some(q) = &self.queue {
            debug_assert!(
                q.is_current(),
                "context '{}' state accessed off its confinement queue",
                self.label
            );
        }
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut ContextState) -> R) -> R {
        self.assert_confined();
        f(&mut self.state.lock())
    }

    // ------------------------------------------------------------------
    // Reads (overlay on the parent chain)
    // ------------------------------------------------------------------

    /// Read one object as seen from this context.
    pub fn get(
        self: &Arc<Self>,
        entity: &EntityName,
        id: ObjectId,
    ) -> Result<Option<Fields>, StackError> {
        let entity = entity.clone();
        self.perform_wait(move |ctx| ctx.get_local(&entity, id))
    }

    fn get_local(&self, entity: &EntityName, id: ObjectId) -> Result<Option<Fields>, StackError> {
        self.assert_confined();
        let key = ObjectKey::new(entity.clone(), id);
        let (tombstoned, local, inserted) = {
            let st = self.state.lock();
            (
                st.tombstones.contains(&key),
                st.overrides.get(&key).cloned(),
                st.inserted.contains(&key),
            )
        };
        if tombstoned {
            return Ok(None);
        }
        if inserted {
            return Ok(Some(local.unwrap_or_default()));
        }
        let base = self.base_get(entity, id)?;
        Ok(match (base, local) {
            (Some(mut fields), Some(local)) => {
                fields.extend(local);
                Some(fields)
            }
            (Some(fields), None) => Some(fields),
            // The object vanished below us but this context still holds a
            // live instance; keep honoring it.
            (None, Some(local)) => Some(local),
            (None, None) => None,
        })
    }

    fn base_get(&self, entity: &EntityName, id: ObjectId) -> Result<Option<Fields>, StackError> {
        match &self.parent {
            Some(parent) => parent.get(entity, id),
            None => Ok(self.core.store.get(entity, id)?),
        }
    }

    /// Fetch all objects of `entity` matching `predicate`, as seen from
    /// this context.
    pub fn fetch(
        self: &Arc<Self>,
        entity: &EntityName,
        predicate: Predicate,
    ) -> Result<Vec<(ObjectId, Fields)>, StackError> {
        let entity = entity.clone();
        self.perform_wait(move |ctx| ctx.fetch_local(&entity, &predicate))
    }

    pub(crate) fn fetch_local(
        &self,
        entity: &EntityName,
        predicate: &Predicate,
    ) -> Result<Vec<(ObjectId, Fields)>, StackError> {
        self.assert_confined();
        let base = match &self.parent {
            Some(parent) => parent.fetch(entity, Predicate::All)?,
            None => self.core.store.scan(entity)?,
        };
        let mut merged: BTreeMap<ObjectId, Fields> = base.into_iter().collect();
        {
            let st = self.state.lock();
            for (key, fields) in &st.overrides {
                if key.entity == *entity {
                    merged.entry(key.id).or_default().extend(fields.clone());
                }
            }
            for key in &st.tombstones {
                if key.entity == *entity {
                    merged.remove(&key.id);
                }
            }
        }
        Ok(merged
            .into_iter()
            .filter(|(_, fields)| predicate.matches(fields))
            .collect())
    }

    /// Count objects matching `predicate`.
    pub fn count(
        self: &Arc<Self>,
        entity: &EntityName,
        predicate: Predicate,
    ) -> Result<usize, StackError> {
        Ok(self.fetch(entity, predicate)?.len())
    }

    /// Resolve the same logical entity in `other`, keyed by stable
    /// identity. This is the only sanctioned way to move between contexts;
    /// passing object state across contexts by reference is a usage error.
    pub fn object_in(
        self: &Arc<Self>,
        entity: &EntityName,
        id: ObjectId,
        other: &Arc<Context>,
    ) -> Result<Option<Fields>, StackError> {
        let _ = self;
        other.get(entity, id)
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Create a new object with the given initial fields.
    pub fn create(
        self: &Arc<Self>,
        entity: &EntityName,
        fields: Fields,
    ) -> Result<ObjectId, StackError> {
        let entity = entity.clone();
        self.perform_wait(move |ctx| ctx.create_local(&entity, fields))
    }

    pub(crate) fn create_local(
        &self,
        entity: &EntityName,
        fields: Fields,
    ) -> Result<ObjectId, StackError> {
        self.assert_confined();
        self.core.schema.entity(entity)?;
        let id = self.core.store.next_object_id()?;
        let key = ObjectKey::new(entity.clone(), id);
        let mut st = self.state.lock();
        st.tombstones.remove(&key);
        st.inserted.insert(key.clone());
        st.overrides.insert(key, fields.clone());
        st.push_dirty(PendingMutation::Insert {
            entity: entity.clone(),
            id,
            fields,
        });
        trace!(context = %self.label, %entity, %id, "created object");
        Ok(id)
    }

    /// Set a single field on an object.
    pub fn set(
        self: &Arc<Self>,
        entity: &EntityName,
        id: ObjectId,
        field: impl Into<String>,
        value: Value,
    ) -> Result<(), StackError> {
        let mut fields = Fields::new();
        fields.insert(field.into(), value);
        self.set_fields(entity, id, fields)
    }

    /// Merge a field set into an object.
    pub fn set_fields(
        self: &Arc<Self>,
        entity: &EntityName,
        id: ObjectId,
        fields: Fields,
    ) -> Result<(), StackError> {
        let entity = entity.clone();
        self.perform_wait(move |ctx| ctx.set_fields_local(&entity, id, fields))
    }

    pub(crate) fn set_fields_local(
        &self,
        entity: &EntityName,
        id: ObjectId,
        fields: Fields,
    ) -> Result<(), StackError> {
        self.assert_confined();
        self.core.schema.entity(entity)?;
        let key = ObjectKey::new(entity.clone(), id);
        let mut st = self.state.lock();
        st.overrides
            .entry(key)
            .or_default()
            .extend(fields.clone());
        st.push_dirty(PendingMutation::Update {
            entity: entity.clone(),
            id,
            fields,
        });
        Ok(())
    }

    /// Delete an object.
    pub fn delete(
        self: &Arc<Self>,
        entity: &EntityName,
        id: ObjectId,
    ) -> Result<(), StackError> {
        let entity = entity.clone();
        self.perform_wait(move |ctx| ctx.delete_local(&entity, id))
    }

    fn delete_local(&self, entity: &EntityName, id: ObjectId) -> Result<(), StackError> {
        self.assert_confined();
        self.core.schema.entity(entity)?;
        let key = ObjectKey::new(entity.clone(), id);
        let mut st = self.state.lock();
        st.overrides.remove(&key);
        st.inserted.remove(&key);
        st.tombstones.insert(key);
        st.import_cache.evict(entity, id);
        st.push_dirty(PendingMutation::Delete {
            entity: entity.clone(),
            id,
        });
        Ok(())
    }

    /// Delete every object matching `predicate`. Returns the number of
    /// objects deleted.
    pub fn delete_where(
        self: &Arc<Self>,
        entity: &EntityName,
        predicate: Predicate,
    ) -> Result<usize, StackError> {
        let matches = self.fetch(entity, predicate)?;
        let count = matches.len();
        let entity = entity.clone();
        self.perform_wait(move |ctx| -> Result<(), StackError> {
            for (id, _) in matches {
                ctx.delete_local(&entity, id)?;
            }
            Ok(())
        })?;
        Ok(count)
    }

    /// Whether this context holds pending mutations.
    pub fn has_changes(self: &Arc<Self>) -> bool {
        self.perform_wait(|ctx| {
            ctx.assert_confined();
            !ctx.state.lock().dirty.is_empty()
        })
    }

    /// Discard all pending mutations and the import cache. Used when a
    /// failed unit of work is abandoned without committing.
    pub fn reset(self: &Arc<Self>) {
        self.perform_wait(|ctx| {
            ctx.assert_confined();
            let mut st = ctx.state.lock();
            st.overrides.clear();
            st.inserted.clear();
            st.tombstones.clear();
            st.dirty.clear();
            st.import_cache.clear();
        });
    }

    // ------------------------------------------------------------------
    // Commit machinery (driven by the save coordinator)
    // ------------------------------------------------------------------

    /// Snapshot the pending mutations and the sequence of the last one, so
    /// the cascade can retire exactly what it committed once the durable
    /// write lands.
    pub(crate) fn snapshot_pending(&self) -> (Vec<PendingMutation>, u64) {
        self.assert_confined();
        let st = self.state.lock();
        let last = st.dirty.last().map(|(seq, _)| *seq).unwrap_or(0);
        (st.dirty.iter().map(|(_, m)| m.clone()).collect(), last)
    }

    /// Commit a batch one level up: into the parent's working set, or to
    /// the durable store at the writer root.
    pub(crate) fn commit_batch_upward(&self, batch: &[PendingMutation]) -> Result<(), StackError> {
        self.assert_confined();
        match &self.parent {
            Some(parent) => {
                let batch = batch.to_vec();
                parent.perform_wait(move |p| {
                    p.absorb_local(batch);
                    Ok(())
                })
            }
            None => self.core.store.apply(batch).map_err(|e| StackError::CommitFailed {
                context: self.label.clone(),
                reason: e.to_string(),
            }),
        }
    }

    /// Apply a child's committed batch into this context's working set.
    fn absorb_local(&self, batch: Vec<PendingMutation>) {
        self.assert_confined();
        let mut st = self.state.lock();
        for mutation in batch {
            match &mutation {
                PendingMutation::Insert { entity, id, fields } => {
                    let key = ObjectKey::new(entity.clone(), *id);
                    st.tombstones.remove(&key);
                    st.inserted.insert(key.clone());
                    st.overrides.entry(key).or_default().extend(fields.clone());
                }
                PendingMutation::Update { entity, id, fields } => {
                    let key = ObjectKey::new(entity.clone(), *id);
                    st.tombstones.remove(&key);
                    st.overrides.entry(key).or_default().extend(fields.clone());
                }
                PendingMutation::Delete { entity, id } => {
                    let key = ObjectKey::new(entity.clone(), *id);
                    st.overrides.remove(&key);
                    st.inserted.remove(&key);
                    st.import_cache.evict(entity, *id);
                    st.tombstones.insert(key);
                }
            }
            st.push_dirty(mutation);
        }
    }

    /// Retire pending mutations up to and including `last_seq`, along with
    /// the overlay state they produced. Once a mutation has landed below
    /// us, the parent (or store) owns that state; keeping the local copy
    /// would shadow later commits made by sibling contexts.
    pub(crate) fn mark_committed(&self, last_seq: u64) {
        self.assert_confined();
        let mut st = self.state.lock();
        st.dirty.retain(|(seq, _)| *seq > last_seq);
        let live: HashSet<ObjectKey> = st
            .dirty
            .iter()
            .map(|(_, m)| ObjectKey::new(m.entity().clone(), m.id()))
            .collect();
        st.overrides.retain(|key, _| live.contains(key));
        st.inserted.retain(|key| live.contains(key));
        st.tombstones.retain(|key| live.contains(key));
    }

    /// Commit this context one level up and retire the committed mutations.
    ///
    /// This performs a single local commit only; it does not cascade. A
    /// temporary context saved this way merges into main, and the caller
    /// must still run a cascading save to reach the store.
    pub fn commit_local(self: &Arc<Self>) -> Result<(), StackError> {
        self.perform_wait(|ctx| {
            let (batch, last_seq) = ctx.snapshot_pending();
            if batch.is_empty() {
                return Ok(());
            }
            ctx.commit_batch_upward(&batch)?;
            ctx.mark_committed(last_seq);
            Ok(())
        })
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("label", &self.label)
            .field("kind", &self.kind)
            .field("parent", &self.parent.as_ref().map(|p| p.label()))
            .finish()
    }
}
