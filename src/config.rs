//! Configuration structures and loading logic

use crate::probe::SearchSettings;
use crate::sampler::SamplerConfig;
use crate::sweep::SweepSettings;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level tool configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Base URL of the serving daemon
    pub api_base: String,
    pub request_timeout_secs: u64,
    /// Upper bound on a single model load (weight streaming can be slow)
    pub load_timeout_secs: u64,
    /// How long to wait for an unloaded model to leave the resident list
    pub unload_timeout_secs: u64,
    /// keep_alive passed on load so the model stays resident while sampled
    pub keep_alive: String,
    pub output_dir: PathBuf,
    pub probe_output: String,
    pub usage_output: String,
    /// `--max-vram` equivalent; None means all free VRAM on the first device
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_vram: Option<String>,
    pub search: SearchSettings,
    pub sampler: SamplerConfig,
    pub sweep: SweepSettings,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            request_timeout_secs: default_request_timeout(),
            load_timeout_secs: default_load_timeout(),
            unload_timeout_secs: default_unload_timeout(),
            keep_alive: default_keep_alive(),
            output_dir: PathBuf::from("."),
            probe_output: default_probe_output(),
            usage_output: default_usage_output(),
            max_vram: None,
            search: SearchSettings::default(),
            sampler: SamplerConfig::default(),
            sweep: SweepSettings::default(),
        }
    }
}

impl ProbeConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        // CTX_PROBE_API_BASE wins over the daemon's own variable
        if let Ok(api_base) = std::env::var("OLLAMA_API_BASE") {
            config.api_base = api_base;
        }
        if let Ok(api_base) = std::env::var("CTX_PROBE_API_BASE") {
            config.api_base = api_base;
        }
        if let Ok(timeout) = std::env::var("CTX_PROBE_REQUEST_TIMEOUT") {
            config.request_timeout_secs = timeout
                .parse()
                .context("Invalid CTX_PROBE_REQUEST_TIMEOUT value")?;
        }
        if let Ok(timeout) = std::env::var("CTX_PROBE_LOAD_TIMEOUT") {
            config.load_timeout_secs = timeout
                .parse()
                .context("Invalid CTX_PROBE_LOAD_TIMEOUT value")?;
        }
        if let Ok(dir) = std::env::var("CTX_PROBE_OUTPUT_DIR") {
            config.output_dir = PathBuf::from(dir);
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !(self.api_base.starts_with("http://") || self.api_base.starts_with("https://")) {
            anyhow::bail!(
                "API base must be an http(s) URL (got '{}')",
                self.api_base
            );
        }
        if self.request_timeout_secs == 0 || self.load_timeout_secs == 0 {
            anyhow::bail!("Request and load timeouts must be non-zero");
        }

        let search = &self.search;
        if search.min_context == 0 {
            anyhow::bail!("search.min_context must be >= 1");
        }
        if search.resolution == 0 {
            anyhow::bail!("search.resolution must be >= 1");
        }
        if search.max_iterations == 0 {
            anyhow::bail!("search.max_iterations must be >= 1");
        }

        let sampler = &self.sampler;
        if sampler.poll_interval_ms == 0 {
            anyhow::bail!("sampler.poll_interval_ms must be >= 1");
        }
        if sampler.max_wait_ms < sampler.poll_interval_ms {
            anyhow::bail!(
                "sampler.max_wait_ms ({}) must be at least one poll interval ({})",
                sampler.max_wait_ms,
                sampler.poll_interval_ms
            );
        }
        if sampler.max_status_failures == 0 {
            anyhow::bail!("sampler.max_status_failures must be >= 1");
        }

        if !self.sweep.floor.is_power_of_two() {
            anyhow::bail!(
                "sweep.floor must be a power of two (got {})",
                self.sweep.floor
            );
        }

        for name in [&self.probe_output, &self.usage_output] {
            if name.is_empty() {
                anyhow::bail!("Report file names cannot be empty");
            }
        }

        // Ensure output directory exists or can be created
        if !self.output_dir.as_os_str().is_empty() && !self.output_dir.exists() {
            std::fs::create_dir_all(&self.output_dir).with_context(|| {
                format!("Cannot create output directory: {:?}", self.output_dir)
            })?;
        }

        Ok(())
    }

    pub fn probe_output_path(&self) -> PathBuf {
        self.output_dir.join(&self.probe_output)
    }

    pub fn usage_output_path(&self) -> PathBuf {
        self.output_dir.join(&self.usage_output)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs)
    }

    pub fn unload_timeout(&self) -> Duration {
        Duration::from_secs(self.unload_timeout_secs)
    }
}

// Default functions
fn default_api_base() -> String {
    "http://localhost:11434".to_string()
}
fn default_request_timeout() -> u64 {
    30
}
fn default_load_timeout() -> u64 {
    600
}
fn default_unload_timeout() -> u64 {
    30
}
fn default_keep_alive() -> String {
    "10m".to_string()
}
fn default_probe_output() -> String {
    "max_context.csv".to_string()
}
fn default_usage_output() -> String {
    "context_usage.csv".to_string()
}
