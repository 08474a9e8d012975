//! Sled-backed implementation of the object store contract.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::schema::Schema;
use crate::store::{ObjectStore, PendingMutation, StoreOptions};
use crate::types::{EntityName, Fields, ObjectId};

const META_SCHEMA: &[u8] = b"meta:schema";
const META_NEXT_ID: &[u8] = b"meta:next_id";

fn sled_err(context: &str, err: sled::Error) -> StoreError {
    StoreError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("{}: {}", context, err),
    ))
}

fn codec_err(context: &str, err: bincode::Error) -> StoreError {
    StoreError::Corrupt(format!("{}: {}", context, err))
}

fn row_key(entity: &EntityName, id: ObjectId) -> Vec<u8> {
    format!("row:{}:{:016x}", entity, id.as_u64()).into_bytes()
}

fn row_prefix(entity: &EntityName) -> Vec<u8> {
    format!("row:{}:", entity).into_bytes()
}

/// Sled database holding object rows keyed by `row:{entity}:{id}`, plus a
/// schema fingerprint and a persisted identity counter under `meta:` keys.
pub struct SledObjectStore {
    db: sled::Db,
    next_id: AtomicU64,
    commits: AtomicU64,
}

impl SledObjectStore {
    /// Open or create a store at `path` against `schema`.
    ///
    /// A persisted fingerprint that does not match the schema is resolved by
    /// `options`: rewrite it when `auto_migrate` is set, wipe and recreate
    /// when `delete_if_unreadable` is set, otherwise fail with
    /// [`StoreError::SchemaUnreadable`].
    pub fn open(
        schema: &Schema,
        path: Option<&Path>,
        options: &StoreOptions,
    ) -> Result<Self, StoreError> {
        let db = if options.in_memory || path.is_none() {
            sled::Config::new()
                .temporary(true)
                .open()
                .map_err(|e| StoreError::Open(format!("failed to open in-memory store: {}", e)))?
        } else {
            sled::open(path.unwrap())
                .map_err(|e| StoreError::Open(format!("failed to open store: {}", e)))?
        };

        let fingerprint = schema.fingerprint();
        match db.get(META_SCHEMA).map_err(|e| sled_err("read schema fingerprint", e))? {
            None => {
                db.insert(META_SCHEMA, &fingerprint[..])
                    .map_err(|e| sled_err("write schema fingerprint", e))?;
                debug!("initialized fresh store");
            }
            Some(existing) if existing.as_ref() == fingerprint => {}
            Some(_) => {
                if options.auto_migrate {
                    info!("schema fingerprint changed, migrating in place");
                    db.insert(META_SCHEMA, &fingerprint[..])
                        .map_err(|e| sled_err("rewrite schema fingerprint", e))?;
                } else if options.delete_if_unreadable {
                    warn!("store unreadable against schema, deleting and recreating");
                    db.clear().map_err(|e| sled_err("clear unreadable store", e))?;
                    db.insert(META_SCHEMA, &fingerprint[..])
                        .map_err(|e| sled_err("write schema fingerprint", e))?;
                } else {
                    return Err(StoreError::SchemaUnreadable {
                        reason: "persisted schema fingerprint does not match and migration is disabled"
                            .to_string(),
                    });
                }
            }
        }

        let next_id = match db.get(META_NEXT_ID).map_err(|e| sled_err("read id counter", e))? {
            Some(bytes) => {
                bincode::deserialize::<u64>(&bytes).map_err(|e| codec_err("id counter", e))?
            }
            None => 1,
        };

        Ok(Self {
            db,
            next_id: AtomicU64::new(next_id),
            commits: AtomicU64::new(0),
        })
    }

    fn read_row(&self, key: &[u8]) -> Result<Option<Fields>, StoreError> {
        match self.db.get(key).map_err(|e| sled_err("read row", e))? {
            Some(bytes) => {
                let fields = bincode::deserialize(&bytes).map_err(|e| codec_err("row", e))?;
                Ok(Some(fields))
            }
            None => Ok(None),
        }
    }
}

impl ObjectStore for SledObjectStore {
    fn get(&self, entity: &EntityName, id: ObjectId) -> Result<Option<Fields>, StoreError> {
        self.read_row(&row_key(entity, id))
    }

    fn scan(&self, entity: &EntityName) -> Result<Vec<(ObjectId, Fields)>, StoreError> {
        let prefix = row_prefix(entity);
        let mut rows = Vec::new();
        for item in self.db.scan_prefix(&prefix) {
            let (key, value) = item.map_err(|e| sled_err("scan rows", e))?;
            let hex = &key[prefix.len()..];
            let id = u64::from_str_radix(
                std::str::from_utf8(hex)
                    .map_err(|_| StoreError::Corrupt("non-utf8 row key".to_string()))?,
                16,
            )
            .map_err(|_| StoreError::Corrupt("malformed row key".to_string()))?;
            let fields: Fields = bincode::deserialize(&value).map_err(|e| codec_err("row", e))?;
            rows.push((ObjectId(id), fields));
        }
        Ok(rows)
    }

    fn apply(&self, batch: &[PendingMutation]) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }

        // Merge updates against current rows first, then apply everything
        // in a single atomic sled batch.
        let mut writes = sled::Batch::default();
        for mutation in batch {
            match mutation {
                PendingMutation::Insert { entity, id, fields } => {
                    let key = row_key(entity, *id);
                    let merged = match self.read_row(&key)? {
                        Some(mut existing) => {
                            existing.extend(fields.clone());
                            existing
                        }
                        None => fields.clone(),
                    };
                    let bytes =
                        bincode::serialize(&merged).map_err(|e| codec_err("row", e))?;
                    writes.insert(key, bytes);
                }
                PendingMutation::Update { entity, id, fields } => {
                    let key = row_key(entity, *id);
                    let merged = match self.read_row(&key)? {
                        Some(mut existing) => {
                            existing.extend(fields.clone());
                            existing
                        }
                        None => fields.clone(),
                    };
                    let bytes =
                        bincode::serialize(&merged).map_err(|e| codec_err("row", e))?;
                    writes.insert(key, bytes);
                }
                PendingMutation::Delete { entity, id } => {
                    writes.remove(row_key(entity, *id));
                }
            }
        }

        self.db
            .apply_batch(writes)
            .map_err(|e| sled_err("apply batch", e))?;
        self.db.flush().map_err(|e| sled_err("flush", e))?;
        self.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn next_object_id(&self) -> Result<ObjectId, StoreError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let proposed = bincode::serialize(&(id + 1)).map_err(|e| codec_err("id counter", e))?;
        // Persist only-if-greater: a slower allocator must not clobber a
        // higher counter written by a concurrent one, or a reopen would
        // re-hand an already-committed identity.
        loop {
            let current = self
                .db
                .get(META_NEXT_ID)
                .map_err(|e| sled_err("read id counter", e))?;
            let persisted = match &current {
                Some(bytes) => {
                    bincode::deserialize::<u64>(bytes).map_err(|e| codec_err("id counter", e))?
                }
                None => 0,
            };
            if persisted > id {
                break;
            }
            match self
                .db
                .compare_and_swap(META_NEXT_ID, current, Some(proposed.clone()))
                .map_err(|e| sled_err("persist id counter", e))?
            {
                Ok(()) => break,
                Err(_) => continue,
            }
        }
        Ok(ObjectId(id))
    }

    fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::EntityDescriptor;
    use crate::types::Value;
    use tempfile::TempDir;

    fn schema() -> Schema {
        Schema::builder()
            .entity(EntityDescriptor::new("person").primary_key("remoteID"))
            .build()
    }

    fn fields(pairs: &[(&str, Value)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn apply_and_read_back() {
        let dir = TempDir::new().unwrap();
        let store = SledObjectStore::open(&schema(), Some(dir.path()), &StoreOptions::default())
            .unwrap();

        let entity = EntityName::from("person");
        let id = store.next_object_id().unwrap();
        store
            .apply(&[PendingMutation::Insert {
                entity: entity.clone(),
                id,
                fields: fields(&[("name", Value::Text("A".into()))]),
            }])
            .unwrap();

        let row = store.get(&entity, id).unwrap().unwrap();
        assert_eq!(row.get("name"), Some(&Value::Text("A".into())));
        assert_eq!(store.commit_count(), 1);
    }

    #[test]
    fn update_merges_fields() {
        let dir = TempDir::new().unwrap();
        let store = SledObjectStore::open(&schema(), Some(dir.path()), &StoreOptions::default())
            .unwrap();

        let entity = EntityName::from("person");
        let id = store.next_object_id().unwrap();
        store
            .apply(&[PendingMutation::Insert {
                entity: entity.clone(),
                id,
                fields: fields(&[("name", Value::Text("A".into())), ("age", Value::Int(30))]),
            }])
            .unwrap();
        store
            .apply(&[PendingMutation::Update {
                entity: entity.clone(),
                id,
                fields: fields(&[("name", Value::Text("A2".into()))]),
            }])
            .unwrap();

        let row = store.get(&entity, id).unwrap().unwrap();
        assert_eq!(row.get("name"), Some(&Value::Text("A2".into())));
        assert_eq!(row.get("age"), Some(&Value::Int(30)));
    }

    #[test]
    fn delete_removes_row() {
        let store =
            SledObjectStore::open(&schema(), None, &StoreOptions::default()).unwrap();
        let entity = EntityName::from("person");
        let id = store.next_object_id().unwrap();
        store
            .apply(&[PendingMutation::Insert {
                entity: entity.clone(),
                id,
                fields: Fields::new(),
            }])
            .unwrap();
        store
            .apply(&[PendingMutation::Delete {
                entity: entity.clone(),
                id,
            }])
            .unwrap();
        assert!(store.get(&entity, id).unwrap().is_none());
    }

    #[test]
    fn scan_returns_only_requested_entity() {
        let multi = Schema::builder()
            .entity(EntityDescriptor::new("person").primary_key("remoteID"))
            .entity(EntityDescriptor::new("song").primary_key("remoteID"))
            .build();
        let store = SledObjectStore::open(&multi, None, &StoreOptions::default()).unwrap();

        let person = EntityName::from("person");
        let song = EntityName::from("song");
        let p = store.next_object_id().unwrap();
        let s = store.next_object_id().unwrap();
        store
            .apply(&[
                PendingMutation::Insert {
                    entity: person.clone(),
                    id: p,
                    fields: Fields::new(),
                },
                PendingMutation::Insert {
                    entity: song.clone(),
                    id: s,
                    fields: Fields::new(),
                },
            ])
            .unwrap();

        assert_eq!(store.scan(&person).unwrap().len(), 1);
        assert_eq!(store.scan(&song).unwrap().len(), 1);
    }

    #[test]
    fn schema_mismatch_fails_without_migration() {
        let dir = TempDir::new().unwrap();
        {
            let _store =
                SledObjectStore::open(&schema(), Some(dir.path()), &StoreOptions::default())
                    .unwrap();
        }
        let changed = Schema::builder()
            .entity(EntityDescriptor::new("person").primary_key("uuid"))
            .build();
        let options = StoreOptions {
            auto_migrate: false,
            ..StoreOptions::default()
        };
        let result = SledObjectStore::open(&changed, Some(dir.path()), &options);
        assert!(matches!(result, Err(StoreError::SchemaUnreadable { .. })));
    }

    #[test]
    fn schema_mismatch_wipes_when_requested() {
        let dir = TempDir::new().unwrap();
        let entity = EntityName::from("person");
        {
            let store =
                SledObjectStore::open(&schema(), Some(dir.path()), &StoreOptions::default())
                    .unwrap();
            let id = store.next_object_id().unwrap();
            store
                .apply(&[PendingMutation::Insert {
                    entity: entity.clone(),
                    id,
                    fields: Fields::new(),
                }])
                .unwrap();
        }
        let changed = Schema::builder()
            .entity(EntityDescriptor::new("person").primary_key("uuid"))
            .build();
        let options = StoreOptions {
            auto_migrate: false,
            delete_if_unreadable: true,
            ..StoreOptions::default()
        };
        let store = SledObjectStore::open(&changed, Some(dir.path()), &options).unwrap();
        assert!(store.scan(&entity).unwrap().is_empty());
    }

    #[test]
    fn concurrent_id_allocation_never_regresses_the_counter() {
        let dir = TempDir::new().unwrap();
        let mut issued = Vec::new();
        {
            let store = std::sync::Arc::new(
                SledObjectStore::open(&schema(), Some(dir.path()), &StoreOptions::default())
                    .unwrap(),
            );
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let store = store.clone();
                    std::thread::spawn(move || {
                        (0..25)
                            .map(|_| store.next_object_id().unwrap())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            for handle in handles {
                issued.extend(handle.join().unwrap());
            }
        }
        let distinct: std::collections::HashSet<_> = issued.iter().copied().collect();
        assert_eq!(distinct.len(), issued.len());

        // Every id handed out after a reopen is above the high-water mark.
        let store = SledObjectStore::open(&schema(), Some(dir.path()), &StoreOptions::default())
            .unwrap();
        let fresh = store.next_object_id().unwrap();
        assert!(issued.iter().all(|id| *id < fresh));
    }

    #[test]
    fn id_counter_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let first = {
            let store =
                SledObjectStore::open(&schema(), Some(dir.path()), &StoreOptions::default())
                    .unwrap();
            store.next_object_id().unwrap()
        };
        let store = SledObjectStore::open(&schema(), Some(dir.path()), &StoreOptions::default())
            .unwrap();
        let second = store.next_object_id().unwrap();
        assert!(second > first);
    }
}
