//! ctx-probe - VRAM-bounded context window probing
//!
//! Finds the largest context window a locally served model can use within a
//! VRAM budget, and reports memory cost across a power-of-two sweep of context
//! sizes, by actually loading the model in an Ollama-compatible daemon.

pub mod budget;
pub mod catalog;
pub mod client;
pub mod config;
pub mod error;
pub mod gpu;
pub mod metrics;
pub mod probe;
pub mod report;
pub mod residency;
pub mod sampler;
pub mod search;
pub mod session;
pub mod sweep;
pub mod units;

pub use budget::{ResolvedBudget, VramBudget};
pub use catalog::{FileCatalog, ModelCatalog, ModelDescriptor};
pub use client::{LoadedModelHandle, MemoryReading, OllamaClient, ServingClient};
pub use config::ProbeConfig;
pub use error::{LoadFailure, ProbeError, Result};
pub use probe::{ProbeEngine, ProbeResult, ProbeStatus};
pub use report::{ReportFormat, ReportWriter};
pub use residency::ResidencySlot;
pub use session::{CancelToken, RunStatus, RunSummary, Session};
pub use sweep::{SweepEngine, UsageSample, UsageStatus};
