//! Memory sampler
//!
//! Freshly loaded models report a climbing footprint for a while (weights
//! streaming in, first allocations) before settling. The sampler polls the
//! daemon until two consecutive readings agree, or gives up after a bounded wait
//! and hands back the last reading as provisional.

use crate::client::{LoadedModelHandle, MemoryReading, ServingClient};
use crate::error::{ProbeError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};

/// Sampler tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub poll_interval_ms: u64,
    /// Bound on the whole sampling wait, after which the last reading is provisional
    pub max_wait_ms: u64,
    /// Two readings this close (bytes) count as the same value
    pub stable_tolerance_bytes: u64,
    /// Consecutive status errors tolerated before the daemon is declared unavailable
    pub max_status_failures: u32,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            max_wait_ms: 30_000,
            stable_tolerance_bytes: 8 * 1024 * 1024,
            max_status_failures: 3,
        }
    }
}

impl SamplerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stability {
    /// Two consecutive polls agreed within tolerance
    Stable,
    /// Taken when the wait bound expired
    Provisional,
}

/// A single VRAM figure for a loaded model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub vram_bytes: u64,
    pub total_bytes: u64,
    pub stability: Stability,
    pub polls: u32,
    pub waited: Duration,
}

impl Sample {
    pub fn is_provisional(&self) -> bool {
        self.stability == Stability::Provisional
    }

    pub fn fully_resident(&self) -> bool {
        self.vram_bytes >= self.total_bytes
    }
}

pub struct MemorySampler {
    client: Arc<dyn ServingClient>,
    config: SamplerConfig,
}

impl MemorySampler {
    pub fn new(client: Arc<dyn ServingClient>, config: SamplerConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Poll until the footprint stabilizes or the wait bound expires
    pub async fn sample(&self, handle: &LoadedModelHandle) -> Result<Sample> {
        let started = Instant::now();
        let deadline = started + self.config.max_wait();
        let mut previous: Option<MemoryReading> = None;
        let mut consecutive_failures = 0u32;
        let mut polls = 0u32;

        loop {
            polls += 1;
            match self.client.status(handle).await {
                Ok(reading) => {
                    consecutive_failures = 0;
                    if reading.ready {
                        if let Some(prev) = previous
                            && self.agrees(&prev, &reading)
                        {
                            let sample = Sample {
                                vram_bytes: reading.vram_bytes,
                                total_bytes: reading.total_bytes,
                                stability: Stability::Stable,
                                polls,
                                waited: started.elapsed(),
                            };
                            crate::metrics::record_sample(sample.stability);
                            tracing::debug!(
                                model = %handle.model(),
                                context = handle.context(),
                                vram_bytes = sample.vram_bytes,
                                polls,
                                "Memory reading stabilized"
                            );
                            return Ok(sample);
                        }
                        previous = Some(reading);
                    }
                }
                Err(e) => {
                    consecutive_failures += 1;
                    tracing::warn!(
                        model = %handle.model(),
                        error = %e,
                        failures = consecutive_failures,
                        max_failures = self.config.max_status_failures,
                        "Status query failed"
                    );
                    if consecutive_failures >= self.config.max_status_failures {
                        return Err(ProbeError::DaemonUnavailable(format!(
                            "status query failed {} times in a row: {}",
                            consecutive_failures, e
                        )));
                    }
                }
            }

            if Instant::now() >= deadline {
                break;
            }
            sleep(self.config.poll_interval()).await;
        }

        match previous {
            Some(reading) => {
                let sample = Sample {
                    vram_bytes: reading.vram_bytes,
                    total_bytes: reading.total_bytes,
                    stability: Stability::Provisional,
                    polls,
                    waited: started.elapsed(),
                };
                crate::metrics::record_sample(sample.stability);
                tracing::warn!(
                    model = %handle.model(),
                    context = handle.context(),
                    vram_bytes = sample.vram_bytes,
                    waited_ms = sample.waited.as_millis() as u64,
                    "Memory reading did not stabilize; using provisional value"
                );
                Ok(sample)
            }
            None => Err(ProbeError::NotResident {
                model: handle.model().to_string(),
                context: handle.context(),
            }),
        }
    }

    fn agrees(&self, a: &MemoryReading, b: &MemoryReading) -> bool {
        let tol = self.config.stable_tolerance_bytes;
        a.vram_bytes.abs_diff(b.vram_bytes) <= tol && a.total_bytes.abs_diff(b.total_bytes) <= tol
    }
}
