//! Shared helpers for integration tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use stratum::error::StoreError;
use stratum::schema::Schema;
use stratum::store::{ObjectStore, PendingMutation, SledObjectStore, StoreOptions};
use stratum::types::{EntityName, Fields, ObjectId};

/// In-memory store whose failures can be armed per operation, for driving
/// commit and purge error paths.
pub struct FlakyStore {
    inner: SledObjectStore,
    fail_apply: AtomicBool,
    fail_scan: AtomicBool,
    apply_held: Mutex<bool>,
    apply_gate: Condvar,
}

#[allow(dead_code)]
impl FlakyStore {
    pub fn new(schema: &Schema) -> Arc<FlakyStore> {
        let inner = SledObjectStore::open(
            schema,
            None,
            &StoreOptions {
                in_memory: true,
                ..StoreOptions::default()
            },
        )
        .expect("in-memory store");
        Arc::new(FlakyStore {
            inner,
            fail_apply: AtomicBool::new(false),
            fail_scan: AtomicBool::new(false),
            apply_held: Mutex::new(false),
            apply_gate: Condvar::new(),
        })
    }

    pub fn fail_applies(&self, fail: bool) {
        self.fail_apply.store(fail, Ordering::SeqCst);
    }

    /// Park every `apply` call until released, to observe what the rest of
    /// the stack does while a durable write is in flight.
    pub fn hold_applies(&self, hold: bool) {
        *self.apply_held.lock() = hold;
        if !hold {
            self.apply_gate.notify_all();
        }
    }

    pub fn fail_scans(&self, fail: bool) {
        self.fail_scan.store(fail, Ordering::SeqCst);
    }
}

impl ObjectStore for FlakyStore {
    fn get(&self, entity: &EntityName, id: ObjectId) -> Result<Option<Fields>, StoreError> {
        self.inner.get(entity, id)
    }

    fn scan(&self, entity: &EntityName) -> Result<Vec<(ObjectId, Fields)>, StoreError> {
        if self.fail_scan.load(Ordering::SeqCst) {
            return Err(StoreError::Corrupt("injected scan failure".to_string()));
        }
        self.inner.scan(entity)
    }

    fn apply(&self, batch: &[PendingMutation]) -> Result<(), StoreError> {
        {
            let mut held = self.apply_held.lock();
            while *held {
                self.apply_gate.wait(&mut held);
            }
        }
        if self.fail_apply.load(Ordering::SeqCst) {
            return Err(StoreError::Corrupt("injected apply failure".to_string()));
        }
        self.inner.apply(batch)
    }

    fn next_object_id(&self) -> Result<ObjectId, StoreError> {
        self.inner.next_object_id()
    }

    fn commit_count(&self) -> u64 {
        self.inner.commit_count()
    }
}
