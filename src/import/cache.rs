//! Per-context uniquing cache.
//!
//! Maps (cache-key field, canonical value encoding) pairs to stable object
//! identities for one entity type. The cache fills incrementally as the
//! resolver looks objects up; warming marks an entity as fully loaded, so
//! a later miss means the object does not exist and the store fetch can be
//! skipped.

use std::collections::HashMap;

use crate::types::{EntityName, ObjectId, Value};

#[derive(Debug, Default)]
struct EntityCache {
    by_key: HashMap<(String, String), ObjectId>,
    warmed: bool,
}

#[derive(Debug, Default)]
pub(crate) struct ImportCache {
    entities: HashMap<EntityName, EntityCache>,
}

impl ImportCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lookup(
        &self,
        entity: &EntityName,
        key_field: &str,
        value: &Value,
    ) -> Option<ObjectId> {
        self.entities
            .get(entity)?
            .by_key
            .get(&(key_field.to_string(), value.lookup_key()))
            .copied()
    }

    pub(crate) fn register(
        &mut self,
        entity: &EntityName,
        key_field: &str,
        value: &Value,
        id: ObjectId,
    ) {
        self.entities
            .entry(entity.clone())
            .or_default()
            .by_key
            .insert((key_field.to_string(), value.lookup_key()), id);
    }

    /// Mark an entity type as fully loaded.
    pub(crate) fn mark_warmed(&mut self, entity: &EntityName) {
        self.entities.entry(entity.clone()).or_default().warmed = true;
    }

    pub(crate) fn is_warmed(&self, entity: &EntityName) -> bool {
        self.entities.get(entity).map(|c| c.warmed).unwrap_or(false)
    }

    /// Drop every entry resolving to `id`. Called when the object is
    /// deleted in the owning context.
    pub(crate) fn evict(&mut self, entity: &EntityName, id: ObjectId) {
        if let Some(cache) = self.entities.get_mut(entity) {
            cache.by_key.retain(|_, cached| *cached != id);
        }
    }

    pub(crate) fn clear(&mut self) {
        self.entities.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person() -> EntityName {
        EntityName::from("person")
    }

    #[test]
    fn register_and_lookup() {
        let mut cache = ImportCache::new();
        cache.register(&person(), "remoteID", &Value::Int(1), ObjectId(10));
        assert_eq!(
            cache.lookup(&person(), "remoteID", &Value::Int(1)),
            Some(ObjectId(10))
        );
        assert_eq!(cache.lookup(&person(), "remoteID", &Value::Int(2)), None);
        // Same encoded text under a different variant must not collide.
        assert_eq!(
            cache.lookup(&person(), "remoteID", &Value::Text("1".into())),
            None
        );
    }

    #[test]
    fn evict_drops_all_entries_for_an_object() {
        let mut cache = ImportCache::new();
        cache.register(&person(), "remoteID", &Value::Int(1), ObjectId(10));
        cache.register(&person(), "email", &Value::Text("a@b".into()), ObjectId(10));
        cache.evict(&person(), ObjectId(10));
        assert_eq!(cache.lookup(&person(), "remoteID", &Value::Int(1)), None);
        assert_eq!(
            cache.lookup(&person(), "email", &Value::Text("a@b".into())),
            None
        );
    }

    #[test]
    fn warmed_flag_is_per_entity() {
        let mut cache = ImportCache::new();
        cache.mark_warmed(&person());
        assert!(cache.is_warmed(&person()));
        assert!(!cache.is_warmed(&EntityName::from("song")));
    }
}
