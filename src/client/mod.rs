//! Serving daemon contract
//!
//! Engines talk to the daemon only through [`ServingClient`], so they can be
//! driven by the HTTP adapter in production and by [`simulated::SimulatedDaemon`]
//! in tests.

pub mod ollama;
pub mod simulated;

use crate::error::Result;
use async_trait::async_trait;
use serde::Serialize;

pub use ollama::OllamaClient;
pub use simulated::{CostModel, SimulatedDaemon};

/// Ownership token for a model loaded through this toolkit
///
/// Not `Clone`: `unload` consumes it, so a handle can be released once.
#[derive(Debug)]
pub struct LoadedModelHandle {
    model: String,
    context: u32,
}

impl LoadedModelHandle {
    /// Adapters mint a handle once the daemon has accepted the load
    pub fn new(model: impl Into<String>, context: u32) -> Self {
        Self {
            model: model.into(),
            context,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn context(&self) -> u32 {
        self.context
    }
}

/// One status poll for a loaded model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MemoryReading {
    pub vram_bytes: u64,
    /// Total allocation; exceeds `vram_bytes` when part of the model spilled to RAM
    pub total_bytes: u64,
    /// Model is listed as resident with the requested context
    pub ready: bool,
}

impl MemoryReading {
    pub fn not_ready() -> Self {
        Self::default()
    }

    pub fn fully_resident(&self) -> bool {
        self.vram_bytes >= self.total_bytes
    }
}

/// Entry of the daemon's resident-model list
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResidentModel {
    pub name: String,
    pub vram_bytes: u64,
    pub total_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_length: Option<u32>,
}

/// Load/status/unload operations against the serving daemon
#[async_trait]
pub trait ServingClient: Send + Sync {
    /// Load `model` with a `context`-token window; fails with `ProbeError::Load`
    async fn load(&self, model: &str, context: u32) -> Result<LoadedModelHandle>;

    /// Current footprint of a loaded model; fails with `DaemonUnavailable`
    async fn status(&self, handle: &LoadedModelHandle) -> Result<MemoryReading>;

    /// Release the model and wait until the daemon no longer lists it
    async fn unload(&self, handle: LoadedModelHandle) -> Result<()>;

    /// Models currently resident, whoever loaded them
    async fn resident_models(&self) -> Result<Vec<ResidentModel>>;

    /// Daemon version string, used as a reachability check
    async fn version(&self) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_accessors() {
        let handle = LoadedModelHandle::new("llama3.2:1b", 8192);
        assert_eq!(handle.model(), "llama3.2:1b");
        assert_eq!(handle.context(), 8192);
    }

    #[test]
    fn test_fully_resident() {
        let reading = MemoryReading {
            vram_bytes: 100,
            total_bytes: 100,
            ready: true,
        };
        assert!(reading.fully_resident());

        let spilled = MemoryReading {
            vram_bytes: 80,
            total_bytes: 100,
            ready: true,
        };
        assert!(!spilled.fully_resident());
        assert!(!MemoryReading::not_ready().ready);
    }
}
