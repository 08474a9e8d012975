//! Durable store collaborator contract.
//!
//! The coordination layer treats the object-graph store as opaque: it
//! resolves reads, accepts atomic mutation batches, and allocates stable
//! object identities. Everything else (contexts, cascades, uniquing) lives
//! above this trait.

use crate::error::StoreError;
use crate::types::{EntityName, Fields, ObjectId};

mod sled_store;

pub use sled_store::SledObjectStore;

/// One recorded mutation against a context, durable only once a cascade
/// reaches the store.
#[derive(Debug, Clone)]
pub enum PendingMutation {
    Insert {
        entity: EntityName,
        id: ObjectId,
        fields: Fields,
    },
    /// Field-wise merge into the existing row; insert-if-absent.
    Update {
        entity: EntityName,
        id: ObjectId,
        fields: Fields,
    },
    Delete {
        entity: EntityName,
        id: ObjectId,
    },
}

impl PendingMutation {
    pub fn entity(&self) -> &EntityName {
        match self {
            PendingMutation::Insert { entity, .. }
            | PendingMutation::Update { entity, .. }
            | PendingMutation::Delete { entity, .. } => entity,
        }
    }

    pub fn id(&self) -> ObjectId {
        match self {
            PendingMutation::Insert { id, .. }
            | PendingMutation::Update { id, .. }
            | PendingMutation::Delete { id, .. } => *id,
        }
    }
}

/// Options controlling how a store is opened.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    /// Rewrite the persisted schema fingerprint when it differs from the
    /// provided schema (lightweight migration). Defaults to on.
    pub auto_migrate: bool,

    /// If the store is unreadable against the schema and migration is
    /// disabled, wipe and recreate it instead of failing.
    pub delete_if_unreadable: bool,

    /// Back the store with a temporary in-memory database.
    pub in_memory: bool,

    /// Run one stale-object purge pass when the stack opens.
    pub auto_stale_purge: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            auto_migrate: true,
            delete_if_unreadable: false,
            in_memory: false,
            auto_stale_purge: false,
        }
    }
}

/// Object-graph store contract consumed by the coordination layer.
pub trait ObjectStore: Send + Sync {
    /// Read one row.
    fn get(&self, entity: &EntityName, id: ObjectId) -> Result<Option<Fields>, StoreError>;

    /// Read every row of an entity type.
    fn scan(&self, entity: &EntityName) -> Result<Vec<(ObjectId, Fields)>, StoreError>;

    /// Durably apply a mutation batch. Must be atomic per call.
    fn apply(&self, batch: &[PendingMutation]) -> Result<(), StoreError>;

    /// Allocate the next stable object identity.
    fn next_object_id(&self) -> Result<ObjectId, StoreError>;

    /// Number of durable write batches applied so far. Lets callers verify
    /// that empty saves perform no I/O.
    fn commit_count(&self) -> u64;
}
