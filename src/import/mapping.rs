//! Field mapping from external records to stored fields.
//!
//! A mapper decides, per entity type, which record keys become field
//! assignments and which route to nested entity imports. The default
//! mapper copies scalar keys verbatim, honoring the descriptor's import
//! veto hook and its nested-record routing table.

use crate::schema::EntityDescriptor;
use crate::types::{EntityName, Fields, Record, RecordValue};

/// The outcome of mapping one record against one entity descriptor.
#[derive(Debug, Default)]
pub struct MappedRecord {
    /// Scalar field assignments to merge into the resolved object.
    pub assignments: Fields,
    /// Record keys routed to nested entity imports, with the record value
    /// to import (a single record or a list of records).
    pub nested: Vec<(String, EntityName, RecordValue)>,
}

pub trait FieldMapper: Send + Sync {
    fn map(&self, descriptor: &EntityDescriptor, record: &Record) -> MappedRecord;
}

/// Identity mapping: record keys become field names unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectMapper;

impl FieldMapper for DirectMapper {
    fn map(&self, descriptor: &EntityDescriptor, record: &Record) -> MappedRecord {
        let mut mapped = MappedRecord::default();
        for (key, value) in record {
            if let Some(nested_entity) = descriptor.nested_entity(key) {
                match value {
                    RecordValue::Object(_) | RecordValue::List(_) => {
                        mapped
                            .nested
                            .push((key.clone(), nested_entity.clone(), value.clone()));
                    }
                    // A scalar under a nested key has no record to import.
                    RecordValue::Scalar(_) => {}
                }
                continue;
            }
            if let RecordValue::Scalar(scalar) = value {
                if descriptor.should_import(key, scalar) {
                    mapped.assignments.insert(key.clone(), scalar.clone());
                }
            }
        }
        mapped
    }
}
