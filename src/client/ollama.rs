//! HTTP adapter for an Ollama-compatible daemon

use super::{LoadedModelHandle, MemoryReading, ResidentModel, ServingClient};
use crate::catalog::{FALLBACK_CONTEXT_LENGTH, ModelCatalog, ModelDescriptor};
use crate::config::ProbeConfig;
use crate::error::{LoadFailure, ProbeError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::{Instant, sleep};

const UNLOAD_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ShowResponse {
    #[serde(default)]
    model_info: HashMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct PsResponse {
    #[serde(default)]
    models: Vec<PsEntry>,
}

#[derive(Debug, Deserialize)]
struct PsEntry {
    name: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    size_vram: u64,
    #[serde(default)]
    context_length: Option<u32>,
}

impl PsEntry {
    fn is(&self, model: &str) -> bool {
        same_model(&self.name, model) || self.model.as_deref().is_some_and(|m| same_model(m, model))
    }
}

#[derive(Debug, Deserialize)]
struct VersionResponse {
    version: String,
}

/// Ollama names untagged models `name:latest`
fn same_model(listed: &str, requested: &str) -> bool {
    listed == requested
        || listed
            .strip_suffix(":latest")
            .is_some_and(|base| base == requested)
}

/// Error text from an `{"error": "..."}` body, or the raw body
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

fn looks_like_oom(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("memory") || lower.contains("oom")
}

/// Declared context from `model_info`, e.g. `llama.context_length`
fn context_length_from_info(info: &HashMap<String, Value>) -> Option<u32> {
    let mut keys: Vec<&String> = info
        .keys()
        .filter(|k| k.ends_with(".context_length"))
        .collect();
    keys.sort();
    keys.into_iter()
        .find_map(|k| info[k].as_u64())
        .map(|v| v.min(u32::MAX as u64) as u32)
}

pub struct OllamaClient {
    http: reqwest::Client,
    base: String,
    load_timeout: Duration,
    unload_timeout: Duration,
    keep_alive: String,
}

impl OllamaClient {
    pub fn new(api_base: &str, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            http,
            base: api_base.trim_end_matches('/').to_string(),
            load_timeout: Duration::from_secs(600),
            unload_timeout: Duration::from_secs(30),
            keep_alive: "10m".to_string(),
        })
    }

    pub fn from_config(config: &ProbeConfig) -> Result<Self> {
        Ok(Self::new(&config.api_base, config.request_timeout())?
            .with_load_timeout(config.load_timeout())
            .with_unload_timeout(config.unload_timeout())
            .with_keep_alive(config.keep_alive.clone()))
    }

    pub fn with_load_timeout(mut self, timeout: Duration) -> Self {
        self.load_timeout = timeout;
        self
    }

    pub fn with_unload_timeout(mut self, timeout: Duration) -> Self {
        self.unload_timeout = timeout;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: impl Into<String>) -> Self {
        self.keep_alive = keep_alive.into();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn unavailable(&self, e: impl std::fmt::Display) -> ProbeError {
        ProbeError::DaemonUnavailable(format!("{}: {}", self.base, e))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .http
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| self.unavailable(e))?;
        if !response.status().is_success() {
            return Err(self.unavailable(format!("GET {} returned {}", path, response.status())));
        }
        response.json().await.map_err(|e| self.unavailable(e))
    }

    async fn ps(&self) -> Result<Vec<PsEntry>> {
        Ok(self.get_json::<PsResponse>("/api/ps").await?.models)
    }

    async fn request_unload(&self, model: &str) -> std::result::Result<(), String> {
        let response = self
            .http
            .post(self.url("/api/generate"))
            .json(&json!({ "model": model, "keep_alive": 0 }))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("{}: {}", status, error_message(&body)));
        }
        Ok(())
    }
}

#[async_trait]
impl ServingClient for OllamaClient {
    async fn load(&self, model: &str, context: u32) -> Result<LoadedModelHandle> {
        let load_error = |reason: LoadFailure, message: String| ProbeError::Load {
            model: model.to_string(),
            context,
            reason,
            message,
        };

        let sent = self
            .http
            .post(self.url("/api/generate"))
            .timeout(self.load_timeout)
            .json(&json!({
                "model": model,
                "options": { "num_ctx": context },
                "keep_alive": self.keep_alive,
            }))
            .send()
            .await;

        let response = match sent {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                // The daemon may finish the load after we stop waiting
                if let Err(unload_err) = self.request_unload(model).await {
                    tracing::warn!(
                        model = %model,
                        error = %unload_err,
                        "Unload after load timeout failed"
                    );
                }
                return Err(load_error(
                    LoadFailure::Timeout,
                    format!("no response within {}s", self.load_timeout.as_secs()),
                ));
            }
            Err(e) if e.is_connect() => return Err(self.unavailable(e)),
            Err(e) => return Err(load_error(LoadFailure::Rejected, e.to_string())),
        };

        let status = response.status();
        if status.is_success() {
            return Ok(LoadedModelHandle::new(model, context));
        }

        let body = response.text().await.unwrap_or_default();
        let message = error_message(&body);
        let reason = if status.is_server_error() && looks_like_oom(&message) {
            LoadFailure::Oom
        } else {
            LoadFailure::Rejected
        };
        Err(load_error(reason, format!("{}: {}", status, message)))
    }

    async fn status(&self, handle: &LoadedModelHandle) -> Result<MemoryReading> {
        let models = self.ps().await?;
        let reading = models
            .iter()
            .find(|m| m.is(handle.model()))
            .filter(|m| m.context_length.is_none_or(|c| c == handle.context()))
            .map(|m| MemoryReading {
                vram_bytes: m.size_vram,
                total_bytes: m.size,
                ready: true,
            })
            .unwrap_or_else(MemoryReading::not_ready);
        Ok(reading)
    }

    async fn unload(&self, handle: LoadedModelHandle) -> Result<()> {
        let model = handle.model().to_string();
        let unload_failure = |message: String| ProbeError::UnloadFailure {
            model: model.clone(),
            message,
        };

        self.request_unload(&model).await.map_err(unload_failure)?;

        let deadline = Instant::now() + self.unload_timeout;
        loop {
            match self.ps().await {
                Ok(models) if !models.iter().any(|m| m.is(&model)) => {
                    tracing::debug!(model = %model, "Model left the resident list");
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(model = %model, error = %e, "Resident list unavailable");
                }
            }
            if Instant::now() >= deadline {
                return Err(unload_failure(format!(
                    "still resident after {}s",
                    self.unload_timeout.as_secs()
                )));
            }
            sleep(UNLOAD_POLL_INTERVAL).await;
        }
    }

    async fn resident_models(&self) -> Result<Vec<ResidentModel>> {
        Ok(self
            .ps()
            .await?
            .into_iter()
            .map(|m| ResidentModel {
                name: m.name,
                vram_bytes: m.size_vram,
                total_bytes: m.size,
                context_length: m.context_length,
            })
            .collect())
    }

    async fn version(&self) -> Result<String> {
        Ok(self
            .get_json::<VersionResponse>("/api/version")
            .await?
            .version)
    }
}

#[async_trait]
impl ModelCatalog for OllamaClient {
    async fn list_models(&self) -> Result<Vec<ModelDescriptor>> {
        let tags: TagsResponse = self.get_json("/api/tags").await?;
        let mut models = Vec::with_capacity(tags.models.len());
        for tag in tags.models {
            match self.describe(&tag.name).await {
                Ok(model) => models.push(model),
                // Kept with no declared context so the model still gets a failed row
                Err(ProbeError::InvalidDescriptor { model, message }) => {
                    tracing::warn!(model = %model, error = %message, "Could not describe model");
                    models.push(ModelDescriptor::new(model, 0));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(models)
    }

    async fn describe(&self, name: &str) -> Result<ModelDescriptor> {
        let response = self
            .http
            .post(self.url("/api/show"))
            .json(&json!({ "model": name }))
            .send()
            .await
            .map_err(|e| self.unavailable(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProbeError::InvalidDescriptor {
                model: name.to_string(),
                message: format!("show returned {}: {}", status, error_message(&body)),
            });
        }

        let show: ShowResponse = response.json().await.map_err(|e| self.unavailable(e))?;
        let context = match context_length_from_info(&show.model_info) {
            Some(context) => context,
            None => {
                tracing::debug!(
                    model = %name,
                    fallback = FALLBACK_CONTEXT_LENGTH,
                    "No context_length in model_info, using fallback"
                );
                FALLBACK_CONTEXT_LENGTH
            }
        };

        Ok(ModelDescriptor::new(name, context))
    }
}
