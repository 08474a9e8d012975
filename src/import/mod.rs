//! Record import: uniquing cache, field mapping, and the resolver that
//! ties them to a context.

pub(crate) mod cache;
mod mapping;
mod resolver;

pub use mapping::{DirectMapper, FieldMapper, MappedRecord};
