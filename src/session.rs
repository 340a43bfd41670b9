//! Run session: drives an engine over the catalog
//!
//! Models are handled one at a time in catalog order. Per-model failures end
//! up as rows; fatal errors stop the run after the report has been flushed.
//! Cancellation is checked between models.

use crate::catalog::ModelDescriptor;
use crate::client::ServingClient;
use crate::error::{ProbeError, Result};
use crate::probe::{ProbeEngine, ProbeResult, ProbeStatus};
use crate::report::{ReportRow, ReportWriter};
use crate::residency::ResidencySlot;
use crate::sweep::{SweepEngine, SweepOutcome, UsageSample, UsageStatus};
use crate::units::format_size;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cooperative stop request, checked at model boundaries
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Final state of a run, mapped to the process exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Complete,
    /// At least one unload failed
    Degraded,
    Fatal,
    /// Stopped by a second interrupt
    Aborted,
}

impl RunStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Complete => 0,
            Self::Fatal => 1,
            Self::Degraded => 2,
            Self::Aborted => 130,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub models: usize,
    pub measured: usize,
    /// Skipped because a resumed report already had them
    pub skipped: usize,
    pub rows: usize,
    pub degraded: bool,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn status(&self) -> RunStatus {
        if self.degraded {
            RunStatus::Degraded
        } else {
            RunStatus::Complete
        }
    }
}

pub struct Session {
    client: Arc<dyn ServingClient>,
    slot: Arc<ResidencySlot>,
    cancel: CancelToken,
}

impl Session {
    pub fn new(client: Arc<dyn ServingClient>, cancel: CancelToken) -> Self {
        let slot = Arc::new(ResidencySlot::new(client.clone()));
        Self {
            client,
            slot,
            cancel,
        }
    }

    pub fn slot(&self) -> &Arc<ResidencySlot> {
        &self.slot
    }

    /// Reachability check, plus a warning for models someone else has resident
    pub async fn preflight(&self) -> Result<()> {
        let version = self.client.version().await?;
        tracing::info!(version = %version, "Serving daemon reachable");

        match self.client.resident_models().await {
            Ok(models) => {
                for model in &models {
                    tracing::warn!(
                        model = %model.name,
                        vram = %format_size(model.vram_bytes),
                        "Model already resident; measurements may be skewed"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not list resident models");
            }
        }
        Ok(())
    }

    /// Probe every model, writing the report after each one
    ///
    /// With `skip_finished`, models whose existing row is final are not probed again.
    pub async fn run_probe(
        &self,
        models: &[ModelDescriptor],
        engine: &ProbeEngine,
        report: &mut ReportWriter<ProbeResult>,
        skip_finished: bool,
    ) -> Result<RunSummary> {
        if models.is_empty() {
            return Err(ProbeError::EmptyCatalog);
        }

        let finished: HashSet<String> = if skip_finished {
            report
                .rows()
                .iter()
                .filter(|r| r.status.is_final())
                .map(|r| r.model.clone())
                .collect()
        } else {
            HashSet::new()
        };

        let mut summary = RunSummary {
            models: models.len(),
            ..Default::default()
        };

        for model in models {
            if self.stop_requested(&mut summary) {
                break;
            }
            if finished.contains(&model.name) {
                tracing::info!(model = %model.name, "Already probed, skipping");
                summary.skipped += 1;
                continue;
            }

            let result = match engine.probe(model).await {
                Ok(result) => result,
                Err(e) if !e.is_fatal() => {
                    tracing::error!(model = %model.name, error = %e, "Probe failed");
                    ProbeResult::failed(model, e.to_string())
                }
                Err(e) => return Err(self.abort(e, report).await),
            };

            if result.status == ProbeStatus::UnloadFailed {
                summary.degraded = true;
            }
            summary.measured += 1;
            report.upsert([result]);
            if let Err(e) = report.flush().await {
                return Err(self.abort(e, report).await);
            }
        }

        self.finish(summary, report).await
    }

    /// Sweep every model, writing the report after each one
    ///
    /// With `resume`, sizes already recorded as `ok` are not measured again.
    pub async fn run_usage(
        &self,
        models: &[ModelDescriptor],
        engine: &SweepEngine,
        report: &mut ReportWriter<UsageSample>,
        resume: bool,
    ) -> Result<RunSummary> {
        if models.is_empty() {
            return Err(ProbeError::EmptyCatalog);
        }

        let mut summary = RunSummary {
            models: models.len(),
            ..Default::default()
        };

        for model in models {
            if self.stop_requested(&mut summary) {
                break;
            }

            let done: HashSet<u32> = if resume {
                report
                    .rows()
                    .iter()
                    .filter(|r| r.model == model.name && r.status == UsageStatus::Ok)
                    .map(|r| r.context_size)
                    .collect()
            } else {
                HashSet::new()
            };

            let outcome = match engine.sweep(model, &done).await {
                Ok(outcome) => outcome,
                Err(e) if !e.is_fatal() => {
                    tracing::error!(model = %model.name, error = %e, "Sweep failed");
                    SweepOutcome {
                        samples: vec![UsageSample::unusable(&model.name, e.to_string())],
                        degraded: false,
                    }
                }
                Err(e) => return Err(self.abort(e, report).await),
            };

            if outcome.samples.is_empty() {
                summary.skipped += 1;
            } else {
                summary.measured += 1;
            }
            summary.degraded |= outcome.degraded;
            report.upsert(outcome.samples);
            if let Err(e) = report.flush().await {
                return Err(self.abort(e, report).await);
            }
        }

        self.finish(summary, report).await
    }

    fn stop_requested(&self, summary: &mut RunSummary) -> bool {
        if self.cancel.is_cancelled() {
            tracing::warn!(
                remaining = summary.models - summary.measured - summary.skipped,
                "Stop requested; not starting further models"
            );
            summary.cancelled = true;
        }
        summary.cancelled
    }

    async fn finish<R: ReportRow>(
        &self,
        mut summary: RunSummary,
        report: &ReportWriter<R>,
    ) -> Result<RunSummary> {
        if self.slot.leaked() > 0 {
            let stuck = self.slot.release().await;
            if stuck > 0 {
                tracing::error!(models = stuck, "Models may still be resident in the daemon");
            }
        }
        summary.rows = report.rows().len();

        tracing::info!(
            models = summary.models,
            measured = summary.measured,
            skipped = summary.skipped,
            rows = summary.rows,
            degraded = summary.degraded,
            cancelled = summary.cancelled,
            report = ?report.path(),
            "Run finished"
        );
        Ok(summary)
    }

    /// Release what we hold and hand the fatal error back
    async fn abort<R: ReportRow>(&self, e: ProbeError, report: &ReportWriter<R>) -> ProbeError {
        tracing::error!(error = %e, report = ?report.path(), "Run aborted");
        if self.slot.release().await > 0 {
            tracing::error!("Models may still be resident in the daemon");
        }
        e
    }
}
