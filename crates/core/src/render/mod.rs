//! Template rendering over layered contexts.

mod context;
mod engine;

pub use context::{ContextLayers, LayerKind, Lookup};
pub use engine::{TemplateEngine, WhenOutcome};
