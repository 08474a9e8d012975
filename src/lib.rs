//! Stratum: Persistence Coordination Layer
//!
//! A coordination layer over an object-graph store: a fixed tree of
//! queue-confined transaction contexts, cascading saves that push pending
//! work level by level to the durable store, serialized background
//! transactions, uniqued record imports, and stale-object purging.

pub mod config;
pub mod context;
pub mod error;
pub mod import;
pub mod logging;
pub mod predicate;
mod purge;
pub mod queue;
pub mod save;
pub mod schema;
pub mod scheduler;
pub mod stack;
pub mod store;
pub mod types;
