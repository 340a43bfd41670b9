//! Context probe engine
//!
//! Drives [`find_max_fit`] with a predicate that really loads the model: load at
//! the candidate context, sample VRAM, unload, then judge the sample against
//! the budget. One [`ProbeResult`] comes out per model, whatever happened.

use crate::budget::ResolvedBudget;
use crate::catalog::ModelDescriptor;
use crate::error::{LoadFailure, ProbeError, Result};
use crate::residency::ResidencySlot;
use crate::sampler::{MemorySampler, Sample, SamplerConfig};
use crate::search::{SearchBounds, SearchOutcome, Termination, Trial, find_max_fit};
use crate::units::format_size;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

/// Search tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SearchSettings {
    /// Smallest context worth reporting
    pub min_context: u32,
    pub resolution: u32,
    pub max_iterations: u32,
    /// Reloads allowed when the sampler only produced a provisional reading
    pub provisional_retries: u32,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            min_context: 2048,
            resolution: 256,
            max_iterations: 32,
            provisional_retries: 1,
        }
    }
}

/// Verdict on one candidate context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum TrialDetail {
    Fitted { vram_bytes: u64, provisional: bool },
    OverBudget { vram_bytes: u64, provisional: bool },
    /// Part of the model spilled to system RAM
    Offloaded {
        vram_bytes: u64,
        total_bytes: u64,
        provisional: bool,
    },
    LoadFailed { reason: LoadFailure },
}

impl TrialDetail {
    pub fn vram_bytes(&self) -> u64 {
        match *self {
            Self::Fitted { vram_bytes, .. }
            | Self::OverBudget { vram_bytes, .. }
            | Self::Offloaded { vram_bytes, .. } => vram_bytes,
            Self::LoadFailed { .. } => 0,
        }
    }

    pub fn provisional(&self) -> bool {
        match *self {
            Self::Fitted { provisional, .. }
            | Self::OverBudget { provisional, .. }
            | Self::Offloaded { provisional, .. } => provisional,
            Self::LoadFailed { .. } => false,
        }
    }
}

impl fmt::Display for TrialDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Fitted { vram_bytes, .. } => write!(f, "fits at {}", format_size(vram_bytes)),
            Self::OverBudget { vram_bytes, .. } => {
                write!(f, "over budget at {}", format_size(vram_bytes))
            }
            Self::Offloaded {
                vram_bytes,
                total_bytes,
                ..
            } => write!(
                f,
                "offloaded ({} of {} in VRAM)",
                format_size(vram_bytes),
                format_size(total_bytes)
            ),
            Self::LoadFailed { reason } => write!(f, "load failed ({})", reason),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeStatus {
    Fits,
    /// Nothing fits, not even the floor
    NotProbable,
    /// Catalog entry unusable; no load was attempted
    Failed,
    UnloadFailed,
}

impl ProbeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fits => "fits",
            Self::NotProbable => "not-probable",
            Self::Failed => "failed",
            Self::UnloadFailed => "unload-failed",
        }
    }

    /// Whether a resumed run may skip a model with this status
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Fits | Self::NotProbable)
    }
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProbeStatus {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fits" => Ok(Self::Fits),
            "not-probable" => Ok(Self::NotProbable),
            "failed" => Ok(Self::Failed),
            "unload-failed" => Ok(Self::UnloadFailed),
            other => Err(ProbeError::Report(format!("unknown probe status '{}'", other))),
        }
    }
}

/// One row of the probe report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub model: String,
    /// Largest fitting context, 0 when nothing fit
    pub context_size: u32,
    pub observed_vram: u64,
    pub fits_within_budget: bool,
    pub status: ProbeStatus,
    pub provisional: bool,
    pub declared_max_context: u32,
    pub is_model_max: bool,
    pub load_cycles: u32,
    pub over_budget_trials: u32,
    pub load_failed_trials: u32,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

impl ProbeResult {
    fn empty(model: &ModelDescriptor, status: ProbeStatus, detail: String) -> Self {
        Self {
            model: model.name.clone(),
            context_size: 0,
            observed_vram: 0,
            fits_within_budget: false,
            status,
            provisional: false,
            declared_max_context: model.declared_max_context,
            is_model_max: false,
            load_cycles: 0,
            over_budget_trials: 0,
            load_failed_trials: 0,
            detail,
            timestamp: Utc::now(),
        }
    }

    /// Row for a model that could not be probed
    pub fn failed(model: &ModelDescriptor, detail: impl Into<String>) -> Self {
        Self::empty(model, ProbeStatus::Failed, detail.into())
    }

    fn from_outcome(
        model: &ModelDescriptor,
        outcome: &SearchOutcome<TrialDetail>,
        load_cycles: u32,
        floor: u32,
        unload_error: Option<&str>,
    ) -> Self {
        let mut result = match outcome.best() {
            Some(best) => Self {
                context_size: best.context,
                observed_vram: best.detail.vram_bytes(),
                fits_within_budget: true,
                provisional: best.detail.provisional(),
                is_model_max: best.context == model.declared_max_context,
                detail: match outcome.termination {
                    Termination::DeclaredMaxFits => "declared max fits".to_string(),
                    Termination::Converged => "converged".to_string(),
                    Termination::IterationCap => "iteration cap reached".to_string(),
                    Termination::NothingFits | Termination::Abandoned => String::new(),
                },
                ..Self::empty(model, ProbeStatus::Fits, String::new())
            },
            None => {
                let why = outcome
                    .trials
                    .last()
                    .map(|t| t.detail.to_string())
                    .unwrap_or_default();
                Self::empty(
                    model,
                    ProbeStatus::NotProbable,
                    format!("does not fit at {}: {}", floor, why),
                )
            }
        };

        if outcome.termination == Termination::Abandoned {
            let stopped_at = outcome.trials.last().map(|t| t.context).unwrap_or_default();
            result.status = ProbeStatus::UnloadFailed;
            result.detail = format!(
                "stopped at {}: {}",
                stopped_at,
                unload_error.unwrap_or("unload failed")
            );
        }

        result.load_cycles = load_cycles;
        for trial in &outcome.trials {
            match trial.detail {
                TrialDetail::OverBudget { .. } | TrialDetail::Offloaded { .. } => {
                    result.over_budget_trials += 1
                }
                TrialDetail::LoadFailed { .. } => result.load_failed_trials += 1,
                TrialDetail::Fitted { .. } => {}
            }
        }
        result
    }
}

pub struct ProbeEngine {
    slot: Arc<ResidencySlot>,
    sampler: MemorySampler,
    budget: ResolvedBudget,
    settings: SearchSettings,
}

impl ProbeEngine {
    pub fn new(
        slot: Arc<ResidencySlot>,
        sampler: SamplerConfig,
        budget: ResolvedBudget,
        settings: SearchSettings,
    ) -> Self {
        let sampler = MemorySampler::new(slot.client().clone(), sampler);
        Self {
            slot,
            sampler,
            budget,
            settings,
        }
    }

    /// Probe one model
    ///
    /// Per-model failures become a row; only run-fatal errors are returned.
    pub async fn probe(&self, model: &ModelDescriptor) -> Result<ProbeResult> {
        if let Err(e) = model.check() {
            tracing::warn!(model = %model.name, error = %e, "Skipping invalid catalog entry");
            return Ok(ProbeResult::failed(model, e.to_string()));
        }

        let bounds = SearchBounds {
            min: self.settings.min_context,
            max: model.declared_max_context,
            resolution: self.settings.resolution,
            max_iterations: self.settings.max_iterations,
        };
        let cycles = AtomicU32::new(0);
        let unload_error = OnceLock::new();
        let started = Instant::now();

        tracing::info!(
            model = %model.name,
            declared_max = model.declared_max_context,
            floor = bounds.floor(),
            budget = %self.budget,
            "Probing model"
        );

        let name = model.name.as_str();
        let outcome = find_max_fit(bounds, |c| {
            self.measure(name, c, &cycles, &unload_error)
        })
        .await?;
        let load_cycles = cycles.load(Ordering::Relaxed);

        crate::metrics::record_search(name, outcome.probes(), outcome.termination);
        let result = ProbeResult::from_outcome(
            model,
            &outcome,
            load_cycles,
            bounds.floor(),
            unload_error.get().map(String::as_str),
        );

        tracing::info!(
            model = %model.name,
            status = %result.status,
            context = result.context_size,
            vram = %format_size(result.observed_vram),
            tries = outcome.probes(),
            load_cycles,
            termination = ?outcome.termination,
            elapsed_secs = started.elapsed().as_secs_f64(),
            "Probe finished"
        );

        Ok(result)
    }

    /// The fits-predicate: one candidate context, possibly several load cycles
    async fn measure(
        &self,
        model: &str,
        context: u32,
        cycles: &AtomicU32,
        unload_error: &OnceLock<String>,
    ) -> Result<Trial<TrialDetail>> {
        let mut retries_left = self.settings.provisional_retries;
        loop {
            cycles.fetch_add(1, Ordering::Relaxed);
            let handle = match self.slot.load(model, context).await {
                Ok(handle) => handle,
                Err(e) => return Self::load_failed(model, context, e),
            };

            let sampled = self.sampler.sample(&handle).await;
            let unloaded = self.slot.unload(handle).await;

            let sample = match (sampled, unloaded) {
                (Err(e), _) if e.is_fatal() => return Err(e),
                (sampled, Err(e)) if e.is_unload_failure() => {
                    tracing::warn!(
                        model = %model,
                        context,
                        error = %e,
                        "Unload failed; keeping this trial and stopping the search"
                    );
                    let _ = unload_error.set(e.to_string());
                    let trial = match sampled {
                        Ok(sample) => self.judge(context, &sample),
                        Err(e) => Self::load_failed(model, context, e)?,
                    };
                    return Ok(trial.abandoning());
                }
                (_, Err(e)) => return Err(e),
                (Err(e), Ok(())) => return Self::load_failed(model, context, e),
                (Ok(sample), Ok(())) => sample,
            };

            if sample.is_provisional() && retries_left > 0 {
                retries_left -= 1;
                tracing::info!(
                    model = %model,
                    context,
                    "Provisional reading; reloading for another sample"
                );
                continue;
            }

            let trial = self.judge(context, &sample);
            tracing::debug!(
                model = %model,
                context,
                fits = trial.fits,
                detail = %trial.detail,
                "Trial finished"
            );
            return Ok(trial);
        }
    }

    fn load_failed(model: &str, context: u32, e: ProbeError) -> Result<Trial<TrialDetail>> {
        match e.load_failure() {
            Some(reason) => {
                tracing::info!(
                    model = %model,
                    context,
                    reason = %reason,
                    error = %e,
                    "Load failed; treating as does not fit"
                );
                Ok(Trial::does_not_fit(context, TrialDetail::LoadFailed { reason }))
            }
            None => Err(e),
        }
    }

    fn judge(&self, context: u32, sample: &Sample) -> Trial<TrialDetail> {
        let provisional = sample.is_provisional();
        if !sample.fully_resident() {
            return Trial::does_not_fit(
                context,
                TrialDetail::Offloaded {
                    vram_bytes: sample.vram_bytes,
                    total_bytes: sample.total_bytes,
                    provisional,
                },
            );
        }
        if !self.budget.admits(sample.vram_bytes) {
            return Trial::does_not_fit(
                context,
                TrialDetail::OverBudget {
                    vram_bytes: sample.vram_bytes,
                    provisional,
                },
            );
        }
        Trial::fits(
            context,
            TrialDetail::Fitted {
                vram_bytes: sample.vram_bytes,
                provisional,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{CostModel, SimulatedDaemon};

    const GB: u64 = 1_000_000_000;
    const KB: u64 = 1_000;

    fn sampler_config() -> SamplerConfig {
        SamplerConfig {
            poll_interval_ms: 10,
            max_wait_ms: 100,
            ..SamplerConfig::default()
        }
    }

    fn engine(daemon: Arc<SimulatedDaemon>, budget: ResolvedBudget) -> ProbeEngine {
        ProbeEngine::new(
            Arc::new(ResidencySlot::new(daemon)),
            sampler_config(),
            budget,
            SearchSettings::default(),
        )
    }

    fn linear() -> CostModel {
        CostModel::linear(4 * GB, 100 * KB)
    }

    #[tokio::test(start_paused = true)]
    async fn test_declared_max_fits() {
        let daemon = Arc::new(SimulatedDaemon::new(linear()));
        let result = engine(daemon.clone(), ResolvedBudget::bytes(8 * GB))
            .probe(&ModelDescriptor::new("m", 32768))
            .await
            .unwrap();

        assert_eq!(result.status, ProbeStatus::Fits);
        assert_eq!(result.context_size, 32768);
        assert!(result.is_model_max);
        assert_eq!(result.load_cycles, 1);
        assert_eq!(daemon.stats().loads, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_failures_count_as_not_fitting() {
        let daemon = Arc::new(SimulatedDaemon::new(linear()).reject_above(8192));
        let result = engine(daemon.clone(), ResolvedBudget::bytes(100 * GB))
            .probe(&ModelDescriptor::new("m", 32768))
            .await
            .unwrap();

        assert_eq!(result.status, ProbeStatus::Fits);
        assert!(result.context_size >= 8192 - 256 && result.context_size <= 8192);
        assert!(result.load_failed_trials >= 2);
        assert_eq!(result.over_budget_trials, 0);
        let stats = daemon.stats();
        assert_eq!(stats.loads, stats.unloads);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offload_is_not_a_fit() {
        // Budget is generous, the device is not
        let daemon = Arc::new(SimulatedDaemon::new(linear()).device_bytes(5 * GB));
        let result = engine(daemon, ResolvedBudget::unbounded())
            .probe(&ModelDescriptor::new("m", 32768))
            .await
            .unwrap();

        assert_eq!(result.status, ProbeStatus::Fits);
        assert!(result.context_size <= 10_000);
        assert!(result.observed_vram <= 5 * GB);
        assert!(result.over_budget_trials >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provisional_sample_is_retried_and_flagged() {
        let daemon = Arc::new(SimulatedDaemon::new(linear()).never_settle());
        let result = engine(daemon.clone(), ResolvedBudget::bytes(100 * GB))
            .probe(&ModelDescriptor::new("m", 4096))
            .await
            .unwrap();

        assert_eq!(result.status, ProbeStatus::Fits);
        assert!(result.provisional);
        // One reload for the provisional reading
        assert_eq!(result.load_cycles, 2);
        assert_eq!(daemon.stats().loads, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unload_failure_abandons_model() {
        let daemon = Arc::new(SimulatedDaemon::new(linear()).fail_unloads(1));
        let result = engine(daemon, ResolvedBudget::bytes(8 * GB))
            .probe(&ModelDescriptor::new("m", 32768))
            .await
            .unwrap();

        assert_eq!(result.status, ProbeStatus::UnloadFailed);
        assert_eq!(result.load_cycles, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unload_failure_keeps_best_fit() {
        // 32768 and 16384 are over budget, 8192 fits, the unload after 12288 sticks
        let daemon = Arc::new(SimulatedDaemon::new(linear()).fail_unloads_after(3, 1));
        let result = engine(daemon.clone(), ResolvedBudget::bytes(5 * GB))
            .probe(&ModelDescriptor::new("m", 32768))
            .await
            .unwrap();

        assert_eq!(result.status, ProbeStatus::UnloadFailed);
        assert_eq!(result.context_size, 8192);
        assert_eq!(result.observed_vram, 4 * GB + 8192 * 100 * KB);
        assert!(result.fits_within_budget);
        assert_eq!(result.load_cycles, 4);
        assert_eq!(result.over_budget_trials, 3);
        assert!(result.detail.starts_with("stopped at 12288"));
        assert_eq!(daemon.stats().load_attempts, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unload_failure_keeps_sample_of_stuck_trial() {
        // The fitting trial at 8192 is the one whose unload sticks
        let daemon = Arc::new(SimulatedDaemon::new(linear()).fail_unloads_after(2, 1));
        let result = engine(daemon, ResolvedBudget::bytes(5 * GB))
            .probe(&ModelDescriptor::new("m", 32768))
            .await
            .unwrap();

        assert_eq!(result.status, ProbeStatus::UnloadFailed);
        assert_eq!(result.context_size, 8192);
        assert_eq!(result.load_cycles, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_descriptor_is_failed_row() {
        let daemon = Arc::new(SimulatedDaemon::new(linear()));
        let result = engine(daemon.clone(), ResolvedBudget::bytes(8 * GB))
            .probe(&ModelDescriptor::new("m", 0))
            .await
            .unwrap();

        assert_eq!(result.status, ProbeStatus::Failed);
        assert_eq!(daemon.stats().load_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_daemon_loss_is_fatal() {
        let daemon = Arc::new(SimulatedDaemon::new(linear()).unreachable_after_loads(1));
        let err = engine(daemon, ResolvedBudget::bytes(8 * GB))
            .probe(&ModelDescriptor::new("m", 32768))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::DaemonUnavailable(_)));
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            ProbeStatus::Fits,
            ProbeStatus::NotProbable,
            ProbeStatus::Failed,
            ProbeStatus::UnloadFailed,
        ] {
            assert_eq!(status.as_str().parse::<ProbeStatus>().unwrap(), status);
        }
        assert!("maybe".parse::<ProbeStatus>().is_err());
    }
}
