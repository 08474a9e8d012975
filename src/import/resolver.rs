//! Record import: uniquing resolution plus field mapping.
//!
//! Importing a record resolves the target object by its external primary
//! key (create-if-absent, unique otherwise), merges the mapped field
//! assignments, and recurses into nested records per the descriptor's
//! routing table. Resolution consults the per-context uniquing cache
//! first, falls back to a keyed fetch, and registers what it finds so
//! repeated imports of the same payload touch the store once.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::context::{Context, ContextKind};
use crate::error::StackError;
use crate::import::mapping::{DirectMapper, FieldMapper};
use crate::predicate::Predicate;
use crate::schema::EntityDescriptor;
use crate::types::{record_scalar, EntityName, Fields, ObjectId, Record, RecordValue, Value};

impl Context {
    /// Resolve the object a record refers to, creating it when absent.
    ///
    /// Returns the object's identity and whether it already existed. Fails
    /// with [`StackError::MissingPrimaryKey`] when the entity type declares
    /// no primary key and is not marked always-create-new.
    pub fn resolve_record(
        self: &Arc<Self>,
        entity: &EntityName,
        record: &Record,
    ) -> Result<(ObjectId, bool), StackError> {
        let entity = entity.clone();
        let record = record.clone();
        self.perform_wait(move |ctx| ctx.resolve_record_local(&entity, &record))
    }

    /// Import one record with the default identity mapper.
    pub fn import_record(
        self: &Arc<Self>,
        entity: &EntityName,
        record: &Record,
    ) -> Result<ObjectId, StackError> {
        self.import_record_with(entity, record, DirectMapper)
    }

    /// Import one record with a custom field mapper.
    pub fn import_record_with(
        self: &Arc<Self>,
        entity: &EntityName,
        record: &Record,
        mapper: impl FieldMapper + 'static,
    ) -> Result<ObjectId, StackError> {
        let entity = entity.clone();
        let record = record.clone();
        self.perform_wait(move |ctx| ctx.import_record_local(&entity, &record, &mapper))
    }

    /// Import a batch of records with the default mapper.
    pub fn import_records(
        self: &Arc<Self>,
        entity: &EntityName,
        records: &[Record],
    ) -> Result<Vec<ObjectId>, StackError> {
        let entity = entity.clone();
        let records = records.to_vec();
        self.perform_wait(move |ctx| {
            records
                .iter()
                .map(|record| ctx.import_record_local(&entity, record, &DirectMapper))
                .collect()
        })
    }

    /// Preload the uniquing cache with every existing object of `entity`.
    ///
    /// After warming, an import-time cache miss proves the object does not
    /// exist and the keyed fetch is skipped. Intended for bulk imports on
    /// background contexts; warming on the main context is a smell.
    pub fn warm_import_cache(self: &Arc<Self>, entity: &EntityName) -> Result<(), StackError> {
        let entity = entity.clone();
        self.perform_wait(move |ctx| {
            if ctx.kind() == ContextKind::Main {
                warn!(%entity, "warming the import cache on the main context; bulk imports belong on a background context");
            }
            let descriptor = ctx.schema().entity(&entity)?.clone();
            let rows = ctx.fetch_local(&entity, &Predicate::All)?;
            ctx.warm_cache_local(&entity, &descriptor, &rows);
            debug!(%entity, objects = rows.len(), "import cache warmed");
            Ok(())
        })
    }

    /// Preload the uniquing cache from a caller-provided collection instead
    /// of a store fetch. Same miss-is-authoritative semantics as
    /// [`Context::warm_import_cache`], scoped to the objects supplied.
    pub fn warm_import_cache_with(
        self: &Arc<Self>,
        entity: &EntityName,
        objects: &[(ObjectId, Fields)],
    ) -> Result<(), StackError> {
        let entity = entity.clone();
        let objects = objects.to_vec();
        self.perform_wait(move |ctx| {
            let descriptor = ctx.schema().entity(&entity)?.clone();
            ctx.warm_cache_local(&entity, &descriptor, &objects);
            debug!(%entity, objects = objects.len(), "import cache warmed from provided collection");
            Ok(())
        })
    }

    /// Whether the uniquing cache has been warmed for `entity`.
    pub fn is_import_cache_warmed(self: &Arc<Self>, entity: &EntityName) -> bool {
        let entity = entity.clone();
        self.perform_wait(move |ctx| ctx.with_state(|st| st.import_cache.is_warmed(&entity)))
    }

    fn resolve_record_local(
        &self,
        entity: &EntityName,
        record: &Record,
    ) -> Result<(ObjectId, bool), StackError> {
        let descriptor = self.schema().entity(entity)?.clone();
        if descriptor.is_always_create_new() {
            return Ok((self.create_local(entity, Fields::new())?, false));
        }

        let pk = descriptor
            .primary_key_field()
            .ok_or_else(|| StackError::MissingPrimaryKey(entity.clone()))?
            .to_string();
        let pk_value = match record_scalar(record, &pk) {
            Some(v) => v.clone(),
            None => {
                debug!(%entity, key = %pk, "record lacks its primary key, creating unkeyed object");
                return Ok((self.create_local(entity, Fields::new())?, false));
            }
        };

        if let Some(id) = self.with_state(|st| st.import_cache.lookup(entity, &pk, &pk_value)) {
            return Ok((id, true));
        }

        if !self.with_state(|st| st.import_cache.is_warmed(entity)) {
            let matches = self.fetch_local(entity, &Predicate::eq(&pk, pk_value.clone()))?;
            if let Some((id, fields)) = matches.into_iter().next() {
                self.register_cache_keys(entity, &descriptor, id, &fields);
                return Ok((id, true));
            }
        }

        let mut fields = Fields::new();
        fields.insert(pk.clone(), pk_value.clone());
        let id = self.create_local(entity, fields)?;
        self.with_state(|st| st.import_cache.register(entity, &pk, &pk_value, id));
        Ok((id, false))
    }

    fn warm_cache_local(
        &self,
        entity: &EntityName,
        descriptor: &EntityDescriptor,
        rows: &[(ObjectId, Fields)],
    ) {
        self.with_state(|st| {
            for (id, fields) in rows {
                for key in descriptor.effective_cache_keys() {
                    if let Some(value) = fields.get(key) {
                        st.import_cache.register(entity, key, value, *id);
                    }
                }
            }
            st.import_cache.mark_warmed(entity);
        });
    }

    fn register_cache_keys(
        &self,
        entity: &EntityName,
        descriptor: &EntityDescriptor,
        id: ObjectId,
        fields: &Fields,
    ) {
        self.with_state(|st| {
            for key in descriptor.effective_cache_keys() {
                if let Some(value) = fields.get(key) {
                    st.import_cache.register(entity, key, value, id);
                }
            }
        });
    }

    fn import_record_local(
        &self,
        entity: &EntityName,
        record: &Record,
        mapper: &dyn FieldMapper,
    ) -> Result<ObjectId, StackError> {
        let (id, _existing) = self.resolve_record_local(entity, record)?;
        let descriptor = self.schema().entity(entity)?.clone();
        let mapped = mapper.map(&descriptor, record);

        if !mapped.assignments.is_empty() {
            self.set_fields_local(entity, id, mapped.assignments)?;
        }

        for (record_key, nested_entity, value) in mapped.nested {
            match value {
                RecordValue::Object(nested_record) => {
                    let child = self.import_record_local(&nested_entity, &nested_record, mapper)?;
                    // The parent holds the child's identity under the record
                    // key; to-one only.
                    self.set_fields_local(
                        entity,
                        id,
                        [(record_key, Value::Int(child.as_u64() as i64))]
                            .into_iter()
                            .collect(),
                    )?;
                }
                RecordValue::List(items) => {
                    // List members are imported standalone; no back-reference
                    // is written on the parent.
                    for item in &items {
                        self.import_record_local(&nested_entity, item, mapper)?;
                    }
                }
                RecordValue::Scalar(_) => {}
            }
        }

        Ok(id)
    }
}
