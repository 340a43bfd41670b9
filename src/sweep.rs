//! Usage sweep engine
//!
//! Measures a model at every power-of-two context from the floor up to its
//! declared maximum. No budget applies and a failed size never stops the sweep;
//! only a stuck unload or a lost daemon does.

use crate::catalog::ModelDescriptor;
use crate::error::{LoadFailure, ProbeError, Result};
use crate::residency::ResidencySlot;
use crate::sampler::{MemorySampler, SamplerConfig};
use crate::units::format_size;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SweepSettings {
    /// Smallest context measured; must be a power of two
    pub floor: u32,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self { floor: 2048 }
    }
}

/// Ascending powers of two in `[floor, declared_max]`
///
/// A model whose declared maximum is below the floor is measured at its
/// declared maximum alone.
pub fn sweep_sizes(floor: u32, declared_max: u32) -> Vec<u32> {
    if declared_max == 0 {
        return Vec::new();
    }
    if declared_max < floor {
        return vec![declared_max];
    }
    std::iter::successors(Some(floor), |&size| size.checked_mul(2))
        .take_while(|&size| size <= declared_max)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UsageStatus {
    Ok,
    LoadFailed,
    TimedOut,
}

impl UsageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::LoadFailed => "load-failed",
            Self::TimedOut => "timed-out",
        }
    }
}

impl fmt::Display for UsageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UsageStatus {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ok" => Ok(Self::Ok),
            "load-failed" => Ok(Self::LoadFailed),
            "timed-out" => Ok(Self::TimedOut),
            other => Err(ProbeError::Report(format!("unknown usage status '{}'", other))),
        }
    }
}

/// One row of the usage report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSample {
    pub model: String,
    pub context_size: u32,
    pub observed_vram: u64,
    pub status: UsageStatus,
    pub provisional: bool,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

impl UsageSample {
    fn new(model: &str, context_size: u32, status: UsageStatus) -> Self {
        Self {
            model: model.to_string(),
            context_size,
            observed_vram: 0,
            status,
            provisional: false,
            detail: String::new(),
            timestamp: Utc::now(),
        }
    }

    /// Placeholder row for a model that could not be swept at all
    pub fn unusable(model: &str, detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
            ..Self::new(model, 0, UsageStatus::LoadFailed)
        }
    }

    /// Row for a size left unmeasured because an earlier unload failed
    fn not_measured(model: &str, context_size: u32) -> Self {
        Self {
            detail: "not measured: earlier unload failed".to_string(),
            ..Self::new(model, context_size, UsageStatus::LoadFailed)
        }
    }

    fn failed(model: &str, context_size: u32, reason: LoadFailure, e: &ProbeError) -> Self {
        let status = match reason {
            LoadFailure::Timeout => UsageStatus::TimedOut,
            LoadFailure::Rejected | LoadFailure::Oom => UsageStatus::LoadFailed,
        };
        Self {
            detail: e.to_string(),
            ..Self::new(model, context_size, status)
        }
    }
}

/// Samples for one model
#[derive(Debug, Clone, Default)]
pub struct SweepOutcome {
    pub samples: Vec<UsageSample>,
    /// An unload failed; sizes after it are recorded without being loaded
    pub degraded: bool,
}

pub struct SweepEngine {
    slot: Arc<ResidencySlot>,
    sampler: MemorySampler,
    settings: SweepSettings,
}

impl SweepEngine {
    pub fn new(slot: Arc<ResidencySlot>, sampler: SamplerConfig, settings: SweepSettings) -> Self {
        let sampler = MemorySampler::new(slot.client().clone(), sampler);
        Self {
            slot,
            sampler,
            settings,
        }
    }

    /// Sweep one model, skipping sizes in `done`
    pub async fn sweep(&self, model: &ModelDescriptor, done: &HashSet<u32>) -> Result<SweepOutcome> {
        let mut outcome = SweepOutcome::default();

        if let Err(e) = model.check() {
            tracing::warn!(model = %model.name, error = %e, "Skipping invalid catalog entry");
            outcome
                .samples
                .push(UsageSample::unusable(&model.name, e.to_string()));
            return Ok(outcome);
        }

        let sizes = sweep_sizes(self.settings.floor, model.declared_max_context);
        tracing::info!(
            model = %model.name,
            sizes = sizes.len(),
            skipped = sizes.iter().filter(|s| done.contains(s)).count(),
            "Sweeping model"
        );

        for context in sizes {
            if done.contains(&context) {
                tracing::debug!(model = %model.name, context, "Already measured, skipping");
                continue;
            }
            if outcome.degraded {
                outcome
                    .samples
                    .push(UsageSample::not_measured(&model.name, context));
                continue;
            }

            let (sample, unload_failed) = self.measure(&model.name, context).await?;
            tracing::info!(
                model = %model.name,
                context,
                status = %sample.status,
                vram = %format_size(sample.observed_vram),
                "Measured"
            );
            outcome.samples.push(sample);

            if unload_failed {
                tracing::error!(
                    model = %model.name,
                    context,
                    "Abandoning remaining sizes after unload failure"
                );
                outcome.degraded = true;
            }
        }

        Ok(outcome)
    }

    /// Load, sample and unload one size; the flag reports a failed unload
    async fn measure(&self, model: &str, context: u32) -> Result<(UsageSample, bool)> {
        let handle = match self.slot.load(model, context).await {
            Ok(handle) => handle,
            Err(e) => {
                return match e.load_failure() {
                    Some(reason) => Ok((UsageSample::failed(model, context, reason, &e), false)),
                    None => Err(e),
                };
            }
        };

        let sampled = self.sampler.sample(&handle).await;
        let unloaded = self.slot.unload(handle).await;

        let unload_failed = match unloaded {
            Ok(()) => false,
            Err(e) if e.is_unload_failure() => true,
            Err(e) => return Err(e),
        };

        let sample = match sampled {
            Ok(sample) if sample.is_provisional() => UsageSample {
                observed_vram: sample.vram_bytes,
                provisional: true,
                detail: format!(
                    "reading did not stabilize within {}ms",
                    self.sampler.config().max_wait_ms
                ),
                ..UsageSample::new(model, context, UsageStatus::TimedOut)
            },
            Ok(sample) => UsageSample {
                observed_vram: sample.vram_bytes,
                ..UsageSample::new(model, context, UsageStatus::Ok)
            },
            Err(e) => match e.load_failure() {
                Some(reason) => UsageSample::failed(model, context, reason, &e),
                None => return Err(e),
            },
        };

        Ok((sample, unload_failed))
    }
}
