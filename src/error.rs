//! Error types for the persistence coordination layer.

use crate::types::EntityName;
use thiserror::Error;

/// Storage-tier errors, raised by the durable store collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store exists but cannot be opened against the provided schema
    /// and migration is disabled.
    #[error("store schema unreadable: {reason}")]
    SchemaUnreadable { reason: String },

    #[error("failed to open store: {0}")]
    Open(String),

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt store data: {0}")]
    Corrupt(String),

    #[error("unknown entity type: {0}")]
    UnknownEntity(String),
}

/// Coordination-tier errors.
#[derive(Debug, Error)]
pub enum StackError {
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// A single level's commit failed during a cascade. The originating
    /// context's dirty set is left intact so the caller may retry.
    #[error("commit failed in context '{context}': {reason}")]
    CommitFailed { context: String, reason: String },

    /// Identity-keyed lookup on an entity type that declares no primary key.
    /// This is a usage error, not a recoverable data condition.
    #[error("entity type '{0}' declares no primary key")]
    MissingPrimaryKey(EntityName),

    /// The process-wide default stack is set-once; replacing it fails loudly.
    #[error("default stack already registered")]
    DefaultAlreadySet,

    /// One or more entity types failed during a stale purge; the purge
    /// continues best-effort across remaining types and aggregates here.
    #[error("stale purge failed for {} entity type(s)", errors.len())]
    PurgeFailed { errors: Vec<StackError> },

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<config::ConfigError> for StackError {
    fn from(err: config::ConfigError) -> Self {
        StackError::Config(err.to_string())
    }
}
