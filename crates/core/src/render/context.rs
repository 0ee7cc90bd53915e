//! Layered rendering context.
//!
//! A rendering context is an ordered list of immutable mapping layers with
//! first-hit precedence: step locals, then extracted variables, then prior
//! step results indexed by step name, then the workload. Unknown names
//! resolve to an explicit [`Lookup::Missing`] sentinel; nothing propagates
//! implicitly.

use serde_json::Value;

use crate::playbook::JsonMap;

/// Identifies where a layer's values came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    /// Current step's local bindings (edge args, iterator element).
    Locals,
    /// Extracted variables from `vars` blocks.
    Variables,
    /// Previous step results, indexed by step name.
    Results,
    /// Global inputs rendered at execution start.
    Workload,
    /// Reserved bindings (`result`, `this`, `error`).
    Reserved,
}

#[derive(Debug, Clone)]
struct Layer {
    kind: LayerKind,
    values: JsonMap,
}

/// Result of a name lookup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Lookup<'a> {
    Found(&'a Value, LayerKind),
    Missing,
}

impl<'a> Lookup<'a> {
    pub fn value(&self) -> Option<&'a Value> {
        match self {
            Lookup::Found(v, _) => Some(v),
            Lookup::Missing => None,
        }
    }
}

/// Ordered, immutable context layers. Layers pushed earlier take
/// precedence over layers pushed later.
#[derive(Debug, Clone, Default)]
pub struct ContextLayers {
    layers: Vec<Layer>,
    execution_id: Option<i64>,
}

impl ContextLayers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_execution_id(mut self, execution_id: i64) -> Self {
        self.execution_id = Some(execution_id);
        self
    }

    /// Append a layer below all existing ones (lower precedence).
    pub fn push(mut self, kind: LayerKind, values: JsonMap) -> Self {
        self.layers.push(Layer { kind, values });
        self
    }

    /// Bind a single reserved name above all layers (highest precedence).
    pub fn bind(self, name: impl Into<String>, value: Value) -> Self {
        let mut values = JsonMap::new();
        values.insert(name.into(), value);
        self.bind_map(values)
    }

    /// Bind a whole mapping above all layers (highest precedence).
    pub fn bind_map(self, values: JsonMap) -> Self {
        if values.is_empty() {
            return self;
        }
        let mut layers = Vec::with_capacity(self.layers.len() + 1);
        layers.push(Layer { kind: LayerKind::Reserved, values });
        layers.extend(self.layers);
        Self {
            layers,
            execution_id: self.execution_id,
        }
    }

    /// First-hit lookup across the layers.
    pub fn resolve(&self, name: &str) -> Lookup<'_> {
        for layer in &self.layers {
            if let Some(value) = layer.values.get(name) {
                return Lookup::Found(value, layer.kind);
            }
        }
        Lookup::Missing
    }

    /// Names visible in any layer, with shadowed duplicates removed.
    pub fn names(&self) -> Vec<&str> {
        let mut seen = std::collections::HashSet::new();
        let mut names = Vec::new();
        for layer in &self.layers {
            for name in layer.values.keys() {
                if seen.insert(name.as_str()) {
                    names.push(name.as_str());
                }
            }
        }
        names
    }

    /// Flatten into one JSON object for the template evaluator: lowest
    /// precedence first, higher layers overriding. `execution_id` is always
    /// exposed when set.
    pub fn to_value(&self) -> Value {
        let mut merged = JsonMap::new();
        for layer in self.layers.iter().rev() {
            for (key, value) in &layer.values {
                merged.insert(key.clone(), value.clone());
            }
        }
        if let Some(execution_id) = self.execution_id {
            merged.insert("execution_id".to_string(), Value::from(execution_id));
        }
        Value::Object(merged)
    }

    /// Rebuild a single-layer context from a previously flattened value.
    /// Used by workers, which receive the merged context with each queue
    /// entry.
    pub fn from_merged(value: &Value) -> Self {
        let mut layers = ContextLayers::new();
        if let Value::Object(map) = value {
            let mut values = map.clone();
            let execution_id = values
                .remove("execution_id")
                .and_then(|v| v.as_i64());
            layers = layers.push(LayerKind::Locals, values);
            layers.execution_id = execution_id;
        }
        layers
    }
}
