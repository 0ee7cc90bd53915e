//! # playmill-store
//!
//! Persistence for the playmill engine behind one trait, [`EngineStore`]:
//! the append-only event log, the durable work queue
//! (lease/heartbeat/ack/nack/reap), the versioned playbook catalog,
//! encrypted credentials, executions and the worker registry.
//!
//! [`PgEngineStore`] is the production implementation;
//! [`MemoryEngineStore`] mirrors its semantics for tests.

mod error;
mod memory;
mod postgres;
mod records;
mod secrets;
mod store;

pub use error::StoreError;
pub use memory::MemoryEngineStore;
pub use postgres::{database_url_from_env, PgEngineStore};
pub use records::{
    AppendOutcome, CatalogRecord, CatalogSummary, CredentialRecord, CredentialSummary,
    ExecutionFilter, ExecutionRecord, HeartbeatOutcome, LeaseRequest, LeasedEntry, NackOutcome,
    NewExecution, ParentLink, QueueStats, QueueStatus, WorkerRecord, WorkerRegistration,
};
pub use secrets::SecretCipher;
pub use store::EngineStore;
