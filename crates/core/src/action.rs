//! Queue entry payloads.
//!
//! An [`ActionSpec`] is the fully-resolved, pre-render configuration the
//! broker attaches to a queue entry. It carries everything a worker needs
//! to render and invoke the action except secrets, which are resolved by
//! name at render time and never persisted.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::playbook::{ActionKind, JsonMap};

/// Default per-action deadline.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Default attempt budget; steps opt into retries via `max_attempts`.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 1;

/// Suffix distinguishing a step's save block in node identifiers.
const SAVE_SUFFIX: &str = "::save";

/// What a queue entry represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// A workflow step's action.
    Step,
    /// A step's save block. Terminal failures are recorded but never fail
    /// the producing step.
    Save,
}

/// Pre-render action configuration stored with a queue entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub kind: ActionKind,
    /// Base configuration from the workbook task (or empty for inline
    /// actions).
    #[serde(default)]
    pub config: JsonMap,
    /// Templated inputs from the step; rendered and merged over `config`.
    #[serde(default)]
    pub args: JsonMap,
    /// Merged context layers captured at scheduling time. Broker and
    /// worker render against this same value.
    pub context: Value,
    /// Credential name (already resolved through the keychain). The worker
    /// fetches the secret at render time; it is never stored here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
    pub timeout_secs: u64,
}

impl ActionSpec {
    pub fn new(kind: ActionKind, context: Value) -> Self {
        Self {
            kind,
            config: JsonMap::new(),
            args: JsonMap::new(),
            context,
            auth: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    pub fn with_config(mut self, config: JsonMap) -> Self {
        self.config = config;
        self
    }

    pub fn with_args(mut self, args: JsonMap) -> Self {
        self.args = args;
        self
    }

    pub fn with_auth(mut self, auth: Option<String>) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }
}

/// A queue entry the broker asks the store to create. Enqueued in the same
/// transaction as the events that caused it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSpec {
    pub execution_id: i64,
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterator_index: Option<i32>,
    pub entry_kind: EntryKind,
    pub spec: ActionSpec,
    pub pool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    #[serde(default)]
    pub priority: i32,
    pub max_attempts: i32,
}

impl QueueSpec {
    pub fn step(execution_id: i64, node_id: impl Into<String>, spec: ActionSpec) -> Self {
        Self {
            execution_id,
            node_id: node_id.into(),
            iterator_index: None,
            entry_kind: EntryKind::Step,
            spec,
            pool: "default".to_string(),
            runtime: None,
            priority: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn save(execution_id: i64, step: &str, spec: ActionSpec) -> Self {
        Self {
            execution_id,
            node_id: save_node_id(step),
            iterator_index: None,
            entry_kind: EntryKind::Save,
            spec,
            pool: "default".to_string(),
            runtime: None,
            priority: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_iterator_index(mut self, index: i32) -> Self {
        self.iterator_index = Some(index);
        self
    }

    pub fn with_pool(mut self, pool: Option<String>) -> Self {
        if let Some(pool) = pool {
            self.pool = pool;
        }
        self
    }

    pub fn with_runtime(mut self, runtime: Option<String>) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Stable fingerprint for this entry at a given attempt, used to
    /// deduplicate terminal reports under at-least-once delivery.
    pub fn fingerprint_at(&self, attempt: i32) -> String {
        fingerprint(
            self.execution_id,
            &self.node_id,
            self.iterator_index,
            attempt,
        )
    }
}

/// Stable hash of `(execution_id, node_id, iterator_index, attempt_count)`.
pub fn fingerprint(
    execution_id: i64,
    node_id: &str,
    iterator_index: Option<i32>,
    attempt_count: i32,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(execution_id.to_be_bytes());
    hasher.update(node_id.as_bytes());
    hasher.update(
        iterator_index
            .map(|i| i64::from(i))
            .unwrap_or(-1)
            .to_be_bytes(),
    );
    hasher.update(attempt_count.to_be_bytes());
    hex::encode(hasher.finalize())
}

/// Node id for a step's save block.
pub fn save_node_id(step: &str) -> String {
    format!("{step}{SAVE_SUFFIX}")
}

/// Split a node id into the base step name and whether it addresses a
/// save block.
pub fn base_step(node_id: &str) -> (&str, bool) {
    match node_id.strip_suffix(SAVE_SUFFIX) {
        Some(base) => (base, true),
        None => (node_id, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fingerprints_differ_by_attempt_and_index() {
        let a = fingerprint(1, "s1", None, 0);
        let b = fingerprint(1, "s1", None, 1);
        let c = fingerprint(1, "s1", Some(0), 0);
        assert_eq!(a, fingerprint(1, "s1", None, 0));
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn save_node_round_trip() {
        let node = save_node_id("persist");
        assert_eq!(node, "persist::save");
        assert_eq!(base_step(&node), ("persist", true));
        assert_eq!(base_step("persist"), ("persist", false));
    }

    #[test]
    fn queue_spec_serializes() {
        let spec = QueueSpec::step(
            5,
            "s1",
            ActionSpec::new(ActionKind::Noop, json!({"x": 1}))
                .with_timeout_secs(30),
        )
        .with_max_attempts(3);

        let value = serde_json::to_value(&spec).unwrap();
        let parsed: QueueSpec = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, spec);
        assert_eq!(parsed.entry_kind, EntryKind::Step);
    }
}
