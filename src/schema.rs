//! Entity model: schema and per-entity capability descriptors.
//!
//! Entity types declare optional capabilities (external primary key, cache
//! keys, always-create-on-import, staleness criterion, nested-record
//! routing). Absent capabilities default to no-ops; the coordination layer
//! never introspects beyond this descriptor.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::StoreError;
use crate::predicate::Predicate;
use crate::types::{EntityName, Value};

/// Produces the staleness predicate for a purge run. Re-evaluated on every
/// run so time-relative cutoffs stay current.
pub type StalenessCriterion = Arc<dyn Fn() -> Predicate + Send + Sync>;

/// Per-field import veto hook: return `false` to skip a key/value pair.
pub type ImportVeto = Arc<dyn Fn(&str, &Value) -> bool + Send + Sync>;

/// Declarative description of one entity type.
#[derive(Clone)]
pub struct EntityDescriptor {
    name: EntityName,
    primary_key: Option<String>,
    cache_keys: Vec<String>,
    always_create_new: bool,
    staleness: Option<StalenessCriterion>,
    nested: BTreeMap<String, EntityName>,
    import_veto: Option<ImportVeto>,
}

impl EntityDescriptor {
    pub fn new(name: impl Into<EntityName>) -> Self {
        Self {
            name: name.into(),
            primary_key: None,
            cache_keys: Vec::new(),
            always_create_new: false,
            staleness: None,
            nested: BTreeMap::new(),
            import_veto: None,
        }
    }

    /// Declare the external primary key field used for uniquing.
    pub fn primary_key(mut self, field: impl Into<String>) -> Self {
        self.primary_key = Some(field.into());
        self
    }

    /// Declare additional cache-key fields. The primary key is always a
    /// cache key and need not be repeated here.
    pub fn cache_key(mut self, field: impl Into<String>) -> Self {
        self.cache_keys.push(field.into());
        self
    }

    /// Every import creates a fresh instance; the uniquing cache is bypassed.
    pub fn always_create_new(mut self) -> Self {
        self.always_create_new = true;
        self
    }

    /// Declare the staleness criterion consumed by the purger.
    pub fn staleness(mut self, criterion: impl Fn() -> Predicate + Send + Sync + 'static) -> Self {
        self.staleness = Some(Arc::new(criterion));
        self
    }

    /// Route a record key holding a nested record (or list of records) to
    /// another entity type during import.
    pub fn nested(mut self, record_key: impl Into<String>, entity: impl Into<EntityName>) -> Self {
        self.nested.insert(record_key.into(), entity.into());
        self
    }

    /// Install a per-field import veto hook.
    pub fn import_veto(
        mut self,
        veto: impl Fn(&str, &Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.import_veto = Some(Arc::new(veto));
        self
    }

    pub fn name(&self) -> &EntityName {
        &self.name
    }

    pub fn primary_key_field(&self) -> Option<&str> {
        self.primary_key.as_deref()
    }

    /// The cache keys consulted by the uniquing resolver: the declared
    /// primary key first, then any extra cache keys.
    pub fn effective_cache_keys(&self) -> Vec<&str> {
        let mut keys = Vec::new();
        if let Some(pk) = self.primary_key.as_deref() {
            keys.push(pk);
        }
        for k in &self.cache_keys {
            if !keys.contains(&k.as_str()) {
                keys.push(k);
            }
        }
        keys
    }

    pub fn is_always_create_new(&self) -> bool {
        self.always_create_new
    }

    pub fn staleness_criterion(&self) -> Option<&StalenessCriterion> {
        self.staleness.as_ref()
    }

    pub fn nested_entity(&self, record_key: &str) -> Option<&EntityName> {
        self.nested.get(record_key)
    }

    pub fn should_import(&self, key: &str, value: &Value) -> bool {
        match &self.import_veto {
            Some(veto) => veto(key, value),
            None => true,
        }
    }

    /// Structural description fed into the schema fingerprint. Behavioral
    /// capabilities (staleness, veto) do not affect storage shape and are
    /// excluded.
    fn fingerprint_line(&self) -> String {
        format!(
            "{}|pk={}|cache={}|nested={}",
            self.name,
            self.primary_key.as_deref().unwrap_or("-"),
            self.cache_keys.join(","),
            self.nested
                .iter()
                .map(|(k, v)| format!("{}:{}", k, v))
                .collect::<Vec<_>>()
                .join(","),
        )
    }
}

impl fmt::Debug for EntityDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityDescriptor")
            .field("name", &self.name)
            .field("primary_key", &self.primary_key)
            .field("cache_keys", &self.cache_keys)
            .field("always_create_new", &self.always_create_new)
            .field("staleness", &self.staleness.is_some())
            .field("nested", &self.nested)
            .finish()
    }
}

/// The full entity model for one store.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    entities: BTreeMap<EntityName, EntityDescriptor>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn entity(&self, name: &EntityName) -> Result<&EntityDescriptor, StoreError> {
        self.entities
            .get(name)
            .ok_or_else(|| StoreError::UnknownEntity(name.to_string()))
    }

    pub fn contains(&self, name: &EntityName) -> bool {
        self.entities.contains_key(name)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &EntityDescriptor> {
        self.entities.values()
    }

    /// Stable fingerprint of the schema's structural shape, persisted in the
    /// store and compared on open.
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        for descriptor in self.entities.values() {
            hasher.update(descriptor.fingerprint_line().as_bytes());
            hasher.update(b"\n");
        }
        *hasher.finalize().as_bytes()
    }
}

#[derive(Debug, Default)]
pub struct SchemaBuilder {
    entities: BTreeMap<EntityName, EntityDescriptor>,
}

impl SchemaBuilder {
    pub fn entity(mut self, descriptor: EntityDescriptor) -> Self {
        self.entities.insert(descriptor.name.clone(), descriptor);
        self
    }

    /// Finish the schema.
    ///
    /// Panics when an entity name is empty or contains `:`, which is
    /// reserved as the store's key separator.
    pub fn build(self) -> Schema {
        for name in self.entities.keys() {
            assert!(
                !name.0.is_empty() && !name.0.contains(':'),
                "entity name '{}' is invalid: must be non-empty and must not contain ':'",
                name
            );
        }
        Schema {
            entities: self.entities,
        }
    }
}
