//! Persistence for the NoETL engine.
//!
//! Three store traits cover the durable surfaces:
//!
//! - [`CatalogStore`]: versioned, immutable playbook and credential
//!   definitions keyed by `(path, version)`
//! - [`EventStore`]: the append-only event log plus the execution index
//!   derived from it
//! - [`QueueStore`]: the leased command queue with at-least-once delivery
//!
//! PostgreSQL is the authoritative implementation; the in-memory one
//! mirrors its semantics for tests and single-process runs.

pub mod memory;
pub mod postgres;
pub mod store;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use store::{
    CatalogEntry, CatalogKind, CatalogStore, ClaimedCommand, CommandStatus, EventStore,
    ExecutionFilter, ExecutionRecord, HeartbeatAck, NewCatalogEntry, NewCommand, QueueStore,
    StoreError,
};

/// The full persistence surface, for callers that hold one store behind a
/// trait object.
pub trait Store: CatalogStore + EventStore + QueueStore {}

impl<T: CatalogStore + EventStore + QueueStore> Store for T {}
