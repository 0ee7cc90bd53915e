//! # playmill-core
//!
//! Pure domain layer of the playmill workflow orchestrator:
//!
//! - [`event`] — the append-only event model, the source of truth for
//!   every execution.
//! - [`playbook`] — parsing and validation of declarative YAML playbooks.
//! - [`render`] — deterministic template rendering over layered contexts.
//! - [`state`] — reconstruction of execution state by folding events.
//! - [`broker`] — the scheduling state machine
//!   `(playbook, snapshot, event) -> effects`.
//! - [`action`] — queue entry payloads shared between broker, store and
//!   workers.
//!
//! Nothing in this crate performs I/O. The PostgreSQL-backed store, the
//! broker driver and the worker runtime live in sibling crates and apply
//! the decisions made here.

pub mod action;
pub mod broker;
pub mod error;
pub mod event;
pub mod playbook;
pub mod render;
pub mod state;

pub use action::{ActionSpec, EntryKind, QueueSpec};
pub use broker::{Broker, ChildSpec, Effect};
pub use error::{EngineError, ErrorKind, ErrorObject};
pub use event::{Event, EventStatus, EventType, NewEvent};
pub use playbook::{ActionKind, ParsedPlaybook, Playbook};
pub use render::{ContextLayers, LayerKind, TemplateEngine, WhenOutcome};
pub use state::{ExecutionStatus, Snapshot, StepStatus};
