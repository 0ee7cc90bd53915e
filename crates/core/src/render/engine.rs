//! Deterministic template rendering.
//!
//! Rendering is pure and side-effect free: the broker and a worker render
//! the same template against the same context and must obtain identical
//! results. The engine fails closed — any unresolved name or type error is
//! a template error — with one carve-out: routing conditions treat a
//! missing name as `false` so routing stays robust under partial
//! information.

use minijinja::{Environment, UndefinedBehavior};
use serde_json::Value;

use crate::error::EngineError;
use crate::playbook::JsonMap;

use super::context::ContextLayers;

/// Outcome of evaluating a routing condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WhenOutcome {
    True,
    False,
    /// A name in the expression was not resolvable; treated as a non-match,
    /// not an error.
    MissingName(String),
}

impl WhenOutcome {
    pub fn fired(&self) -> bool {
        matches!(self, WhenOutcome::True)
    }
}

/// Expression evaluator over a layered context.
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl TemplateEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        // Fail closed: unresolved names are errors everywhere except
        // routing conditions, which handle them explicitly.
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.add_filter("fromjson", fromjson);
        Self { env }
    }

    /// Render one template string.
    ///
    /// A whole-string expression (`{{ expr }}` and nothing else) preserves
    /// the evaluated type, so `{{ workload.count }}` used alone yields a
    /// number, not its string form. Anything else interpolates to a string.
    pub fn render_str(&self, template: &str, ctx: &ContextLayers) -> Result<Value, EngineError> {
        if !template.contains("{{") && !template.contains("{%") {
            return Ok(Value::String(template.to_string()));
        }

        let trimmed = template.trim();
        if let Some(inner) = whole_expression(trimmed) {
            let expr = self
                .env
                .compile_expression(inner)
                .map_err(template_error)?;
            let value = expr
                .eval(minijinja::Value::from_serialize(&ctx.to_value()))
                .map_err(template_error)?;
            return serde_json::to_value(&value).map_err(EngineError::from);
        }

        let rendered = self
            .env
            .render_str(template, ctx.to_value())
            .map_err(template_error)?;
        Ok(Value::String(rendered))
    }

    /// Render a JSON value recursively: strings go through [`render_str`],
    /// arrays and objects are walked, everything else passes through.
    pub fn render_value(&self, value: &Value, ctx: &ContextLayers) -> Result<Value, EngineError> {
        match value {
            Value::String(s) => self.render_str(s, ctx),
            Value::Array(items) => items
                .iter()
                .map(|item| self.render_value(item, ctx))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut rendered = JsonMap::new();
                for (key, item) in map {
                    rendered.insert(key.clone(), self.render_value(item, ctx)?);
                }
                Ok(Value::Object(rendered))
            }
            other => Ok(other.clone()),
        }
    }

    /// Render every entry of a mapping.
    pub fn render_map(&self, map: &JsonMap, ctx: &ContextLayers) -> Result<JsonMap, EngineError> {
        let mut rendered = JsonMap::new();
        for (key, value) in map {
            rendered.insert(key.clone(), self.render_value(value, ctx)?);
        }
        Ok(rendered)
    }

    /// Evaluate a routing condition to a boolean.
    ///
    /// Accepts either a bare expression (`s1.x > 3`) or a braced template
    /// (`{{ s1.x > 3 }}`). An unresolved name yields
    /// [`WhenOutcome::MissingName`]; other evaluation failures are template
    /// errors.
    pub fn eval_when(
        &self,
        condition: &str,
        ctx: &ContextLayers,
    ) -> Result<WhenOutcome, EngineError> {
        let trimmed = condition.trim();
        let expr_text = whole_expression(trimmed).unwrap_or(trimmed);

        let expr = self
            .env
            .compile_expression(expr_text)
            .map_err(template_error)?;
        match expr.eval(minijinja::Value::from_serialize(&ctx.to_value())) {
            Ok(value) => Ok(if value.is_true() {
                WhenOutcome::True
            } else {
                WhenOutcome::False
            }),
            Err(e) if e.kind() == minijinja::ErrorKind::UndefinedError => {
                tracing::debug!(condition = trimmed, error = %e, "routing condition references a missing name; treating as false");
                Ok(WhenOutcome::MissingName(e.to_string()))
            }
            Err(e) => Err(template_error(e)),
        }
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// If the template is exactly one `{{ expr }}` block, return the inner
/// expression.
fn whole_expression(template: &str) -> Option<&str> {
    let inner = template.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

fn template_error(e: minijinja::Error) -> EngineError {
    EngineError::Template(e.to_string())
}

/// `fromjson` filter: parse a JSON string into a value.
fn fromjson(value: String) -> Result<minijinja::Value, minijinja::Error> {
    serde_json::from_str::<Value>(&value)
        .map(|v| minijinja::Value::from_serialize(&v))
        .map_err(|e| {
            minijinja::Error::new(
                minijinja::ErrorKind::InvalidOperation,
                format!("fromjson: invalid json: {e}"),
            )
        })
}
