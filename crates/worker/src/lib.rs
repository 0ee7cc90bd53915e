//! # playmill-worker
//!
//! Stateless worker runtime for the playmill engine. Workers lease
//! entries from the PostgreSQL queue, render templates against the
//! context captured with each entry, resolve credentials at render time,
//! invoke the action through the build-time [`actions::ActionRegistry`]
//! and report outcomes back as events.

pub mod actions;
pub mod config;
pub mod poller;
pub mod retry;
pub mod runtime;

pub use actions::{Action, ActionInvocation, ActionRegistry, ProgressSender, SecretHandle};
pub use config::WorkerConfig;
pub use retry::RetryPolicy;
pub use runtime::{WorkerError, WorkerRuntime};
