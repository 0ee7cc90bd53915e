//! Typed representation of a parsed playbook document.
//!
//! The YAML surface is deliberately small and strict: unknown keys are
//! rejected at registration so typos fail loudly instead of silently
//! changing behavior.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type JsonMap = serde_json::Map<String, Value>;

/// Every action a step or workbook task can perform.
///
/// The set is closed on purpose: actions are wired into the worker at build
/// time, keyed by this enum. There is no dynamic loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Python,
    Http,
    Postgres,
    Duckdb,
    Snowflake,
    SnowflakeTransfer,
    Container,
    Secrets,
    Iterator,
    Playbook,
    Noop,
    Shell,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Http => "http",
            Self::Postgres => "postgres",
            Self::Duckdb => "duckdb",
            Self::Snowflake => "snowflake",
            Self::SnowflakeTransfer => "snowflake_transfer",
            Self::Container => "container",
            Self::Secrets => "secrets",
            Self::Iterator => "iterator",
            Self::Playbook => "playbook",
            Self::Noop => "noop",
            Self::Shell => "shell",
        }
    }

    /// Kinds handled entirely inside the broker; they never reach a worker.
    pub fn is_control_flow(&self) -> bool {
        matches!(self, Self::Iterator | Self::Playbook)
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw document as deserialized from YAML. Validation happens after this
/// parse step; see [`super::validate`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlaybookDoc {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: Metadata,
    #[serde(default)]
    pub workload: JsonMap,
    #[serde(default)]
    pub workbook: Vec<TaskDef>,
    pub workflow: Vec<StepDef>,
    #[serde(default)]
    pub keychain: Vec<KeychainEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Metadata {
    pub name: String,
    pub path: String,
}

/// A named, reusable action definition referenced by steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskDef {
    pub name: String,
    #[serde(alias = "type")]
    pub tool: ActionKind,
    #[serde(default, alias = "args", alias = "data")]
    pub with: JsonMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
}

/// Iterator scheduling mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterMode {
    /// One element at a time; index `i + 1` is enqueued only after index
    /// `i` reaches a terminal state.
    #[default]
    Sequential,
    /// All elements are enqueued at expansion time.
    Async,
}

/// One step of the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepDef {
    pub step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,

    /// Inline action kind. Mutually exclusive with `name` except for
    /// iterator steps, where `tool: iterator` pairs with `task`.
    #[serde(default, alias = "type", skip_serializing_if = "Option::is_none")]
    pub tool: Option<ActionKind>,

    /// Workbook task reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    // `args`, `data` and `with` are aliases for the same templated-input
    // mapping. Kept as separate fields so validation can reject mixing and
    // warn on the legacy `data:` spelling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<JsonMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with: Option<JsonMap>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save: Option<SaveBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vars: Option<JsonMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<Vec<Edge>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case: Option<Vec<CaseArm>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,

    // Iterator steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<IterMode>,
    /// Workbook task executed per element.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,

    // Sub-playbook steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_step: Option<String>,
}

impl StepDef {
    /// The templated-input mapping, whichever alias the author used.
    pub fn inputs(&self) -> Option<&JsonMap> {
        self.args.as_ref().or(self.data.as_ref()).or(self.with.as_ref())
    }

    /// Number of alias spellings present; more than one is a validation
    /// error.
    pub fn input_alias_count(&self) -> usize {
        [self.args.is_some(), self.data.is_some(), self.with.is_some()]
            .iter()
            .filter(|present| **present)
            .count()
    }

    pub fn outgoing_edge_count(&self) -> usize {
        self.next.as_ref().map_or(0, Vec::len)
            + self.case.as_ref().map_or(0, Vec::len)
    }
}

/// Persisted-result block attached to a step. Executed as a synthetic
/// downstream action of the given storage kind; failures are recorded but
/// never retro-fail the producing step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SaveBlock {
    #[serde(alias = "type", alias = "storage")]
    pub tool: ActionKind,
    #[serde(default, alias = "args", alias = "with")]
    pub data: JsonMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
}

/// Unconditional routing edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DirectEdge {
    pub step: String,
    #[serde(default, alias = "data", skip_serializing_if = "Option::is_none")]
    pub args: Option<JsonMap>,
}

/// Conditional routing arm: `when` is a template expression evaluated
/// against the current snapshot; a truthy result fires every step in
/// `then`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CaseArm {
    pub when: String,
    pub then: Vec<String>,
    #[serde(default, alias = "data", skip_serializing_if = "Option::is_none")]
    pub args: Option<JsonMap>,
}

/// An entry of a step's `next` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Edge {
    /// Bare step name.
    Name(String),
    /// Conditional edge (same shape as a `case` arm).
    Cond(CaseArm),
    /// Unconditional edge with bindings for the target.
    Direct(DirectEdge),
}

impl Edge {
    pub fn is_conditional(&self) -> bool {
        matches!(self, Edge::Cond(_))
    }

    /// Step names this edge can reach.
    pub fn targets(&self) -> Vec<&str> {
        match self {
            Edge::Name(name) => vec![name.as_str()],
            Edge::Direct(edge) => vec![edge.step.as_str()],
            Edge::Cond(arm) => arm.then.iter().map(String::as_str).collect(),
        }
    }
}

/// Named token or credential recipe bound to the execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeychainEntry {
    pub name: String,
    pub kind: String,
    /// Credential-store name backing this recipe; defaults to `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl KeychainEntry {
    pub fn credential_name(&self) -> &str {
        self.credential.as_deref().unwrap_or(&self.name)
    }
}

/// Fully parsed and validated playbook.
#[derive(Debug, Clone)]
pub struct Playbook {
    pub name: String,
    pub path: String,
    pub workload: JsonMap,
    pub tasks: HashMap<String, TaskDef>,
    pub steps: Vec<StepDef>,
    pub keychain: Vec<KeychainEntry>,
    index: HashMap<String, usize>,
}

impl Playbook {
    pub(super) fn from_doc(doc: PlaybookDoc) -> Self {
        let tasks = doc
            .workbook
            .iter()
            .map(|t| (t.name.clone(), t.clone()))
            .collect();
        let index = doc
            .workflow
            .iter()
            .enumerate()
            .map(|(i, s)| (s.step.clone(), i))
            .collect();
        Self {
            name: doc.metadata.name,
            path: doc.metadata.path,
            workload: doc.workload,
            tasks,
            steps: doc.workflow,
            keychain: doc.keychain,
            index,
        }
    }

    pub fn step(&self, name: &str) -> Option<&StepDef> {
        self.index.get(name).map(|i| &self.steps[*i])
    }

    pub fn task(&self, name: &str) -> Option<&TaskDef> {
        self.tasks.get(name)
    }

    /// Resolve a keychain recipe name to the backing credential, falling
    /// back to treating the name as a direct credential reference.
    pub fn resolve_auth<'a>(&'a self, name: &'a str) -> &'a str {
        self.keychain
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.credential_name())
            .unwrap_or(name)
    }

    /// Condensed description served by the catalog read API.
    pub fn summary(&self) -> Value {
        serde_json::json!({
            "name": self.name,
            "path": self.path,
            "steps": self.steps.iter().map(|s| {
                serde_json::json!({
                    "step": s.step,
                    "desc": s.desc,
                    "tool": s.tool,
                    "name": s.name,
                    "routes": s.outgoing_edge_count(),
                })
            }).collect::<Vec<_>>(),
            "tasks": self.tasks.keys().collect::<Vec<_>>(),
            "keychain": self.keychain.iter().map(|k| &k.name).collect::<Vec<_>>(),
        })
    }
}
