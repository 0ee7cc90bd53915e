//! Catalog registration and lookup.

use std::sync::Arc;

use tracing::{info, instrument};

use playmill_store::{CatalogRecord, CatalogSummary, EngineStore};

use crate::error::{AppError, AppResult};

/// Outcome of a successful registration.
#[derive(Debug, Clone)]
pub struct Registered {
    pub path: String,
    pub version: i32,
    pub warnings: Vec<String>,
}

#[derive(Clone)]
pub struct CatalogService {
    store: Arc<dyn EngineStore>,
}

impl CatalogService {
    pub fn new(store: Arc<dyn EngineStore>) -> Self {
        Self { store }
    }

    /// Parse, validate and store a playbook revision. Structural errors
    /// fail the call; the assigned version is monotonic per path and
    /// in-flight executions keep the version they bound at start.
    #[instrument(skip(self, content))]
    pub async fn register(&self, content: &str) -> AppResult<Registered> {
        let parsed = playmill_core::playbook::parse(content)?;
        let path = parsed.playbook.path.clone();
        let summary = parsed.playbook.summary();

        let version = self
            .store
            .register_playbook(&path, content, summary)
            .await?;

        info!(path, version, "playbook registered");
        Ok(Registered {
            path,
            version,
            warnings: parsed.warnings,
        })
    }

    pub async fn get(&self, path: &str, version: Option<i32>) -> AppResult<CatalogRecord> {
        Ok(self.store.get_playbook(path, version).await?)
    }

    pub async fn list(&self, prefix: Option<&str>) -> AppResult<Vec<CatalogSummary>> {
        Ok(self.store.list_playbooks(prefix).await?)
    }

    /// Parse the stored text back into the typed model.
    pub async fn load_playbook(
        &self,
        path: &str,
        version: Option<i32>,
    ) -> AppResult<playmill_core::Playbook> {
        let record = self.get(path, version).await?;
        let parsed = playmill_core::playbook::parse(&record.content).map_err(|e| {
            AppError::Internal(format!(
                "stored playbook {path} v{} no longer parses: {e}",
                record.version
            ))
        })?;
        Ok(parsed.playbook)
    }
}
