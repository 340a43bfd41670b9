//! Model catalog: which models to measure and their declared context limits

use crate::error::{ProbeError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// Context length assumed when the daemon does not report one
pub const FALLBACK_CONTEXT_LENGTH: u32 = 2048;

/// A model and its architecturally supported context window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    #[serde(rename = "context_length")]
    pub declared_max_context: u32,
}

impl ModelDescriptor {
    pub fn new(name: impl Into<String>, declared_max_context: u32) -> Self {
        Self {
            name: name.into(),
            declared_max_context,
        }
    }

    /// Catalog contract: a usable descriptor has a name and a non-zero limit
    pub fn check(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ProbeError::InvalidDescriptor {
                model: self.name.clone(),
                message: "empty model name".into(),
            });
        }
        if self.declared_max_context == 0 {
            return Err(ProbeError::InvalidDescriptor {
                model: self.name.clone(),
                message: "declared max context is zero".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
pub trait ModelCatalog: Send + Sync {
    /// All models in catalog order
    async fn list_models(&self) -> Result<Vec<ModelDescriptor>>;

    /// Describe a single model, even one missing from the listing
    async fn describe(&self, name: &str) -> Result<ModelDescriptor> {
        self.list_models()
            .await?
            .into_iter()
            .find(|m| m.name == name)
            .ok_or_else(|| ProbeError::InvalidDescriptor {
                model: name.to_string(),
                message: "not in catalog".into(),
            })
    }
}

/// Catalog filtered to `--model`, or the full listing
pub async fn select_models(
    catalog: &dyn ModelCatalog,
    filter: Option<&str>,
) -> Result<Vec<ModelDescriptor>> {
    match filter {
        Some(name) => Ok(vec![catalog.describe(name).await?]),
        None => catalog.list_models().await,
    }
}

/// Catalog cached on disk as a JSON array of `{name, context_length}`
pub struct FileCatalog {
    path: PathBuf,
    /// Asked about names the file does not list
    fallback: Option<Arc<dyn ModelCatalog>>,
}

impl FileCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn ModelCatalog>) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

#[async_trait]
impl ModelCatalog for FileCatalog {
    async fn list_models(&self) -> Result<Vec<ModelDescriptor>> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        let models: Vec<ModelDescriptor> = serde_json::from_str(&content)?;

        tracing::debug!(
            path = ?self.path,
            models = models.len(),
            "Catalog loaded from file"
        );

        Ok(models)
    }

    async fn describe(&self, name: &str) -> Result<ModelDescriptor> {
        let listed = self.list_models().await?.into_iter().find(|m| m.name == name);
        match (listed, &self.fallback) {
            (Some(model), _) => Ok(model),
            (None, Some(fallback)) => {
                tracing::debug!(
                    model = %name,
                    path = ?self.path,
                    "Not in catalog file, asking the daemon"
                );
                fallback.describe(name).await
            }
            (None, None) => Err(ProbeError::InvalidDescriptor {
                model: name.to_string(),
                message: format!("not in catalog {:?}", self.path),
            }),
        }
    }
}
