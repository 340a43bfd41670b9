//! Deterministic in-memory serving daemon
//!
//! Memory cost is a pure function of (model, context), so any probe or sweep
//! against it is reproducible. Knobs let tests inject the failure modes seen
//! on real hardware: rejected or OOM loads, load timeouts, slow warm-up,
//! readings that never settle, partial offload, stuck unloads and a daemon
//! that goes away.

use super::{LoadedModelHandle, MemoryReading, ResidentModel, ServingClient};
use crate::catalog::{ModelCatalog, ModelDescriptor};
use crate::error::{LoadFailure, ProbeError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// VRAM cost curve: `base + per_token * context`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CostModel {
    pub base_bytes: u64,
    pub per_token_bytes: u64,
}

impl CostModel {
    pub fn linear(base_bytes: u64, per_token_bytes: u64) -> Self {
        Self {
            base_bytes,
            per_token_bytes,
        }
    }

    pub fn cost(&self, context: u32) -> u64 {
        self.base_bytes
            .saturating_add(self.per_token_bytes.saturating_mul(context as u64))
    }
}

/// Counters for balance and residency assertions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DaemonStats {
    pub load_attempts: u32,
    /// Loads the daemon accepted
    pub loads: u32,
    /// Unloads that actually removed a resident model
    pub unloads: u32,
    pub failed_unloads: u32,
    pub status_polls: u32,
    /// Most models resident at once
    pub peak_resident: usize,
}

#[derive(Debug)]
struct Resident {
    context: u32,
    polls: u32,
    foreign: bool,
}

#[derive(Default)]
struct State {
    resident: HashMap<String, Resident>,
    stats: DaemonStats,
    unload_failures_left: u32,
    /// Unloads that succeed before the failures start
    unloads_before_failure: u32,
    unreachable: bool,
}

pub struct SimulatedDaemon {
    default_cost: CostModel,
    costs: HashMap<String, CostModel>,
    catalog: Vec<ModelDescriptor>,
    warmup_polls: u32,
    never_settle: bool,
    reject_above: Option<u32>,
    timeout_above: Option<u32>,
    oom_above_bytes: Option<u64>,
    device_bytes: Option<u64>,
    unreachable_after_loads: Option<u32>,
    load_latency: Duration,
    state: Mutex<State>,
}

const DRIFT_PER_POLL: u64 = 64 * 1024 * 1024;

impl SimulatedDaemon {
    pub fn new(default_cost: CostModel) -> Self {
        Self {
            default_cost,
            costs: HashMap::new(),
            catalog: Vec::new(),
            warmup_polls: 0,
            never_settle: false,
            reject_above: None,
            timeout_above: None,
            oom_above_bytes: None,
            device_bytes: None,
            unreachable_after_loads: None,
            load_latency: Duration::ZERO,
            state: Mutex::new(State::default()),
        }
    }

    /// Add a catalog entry using the default cost curve
    pub fn with_model(mut self, name: impl Into<String>, declared_max_context: u32) -> Self {
        self.catalog
            .push(ModelDescriptor::new(name, declared_max_context));
        self
    }

    /// Add a catalog entry with its own cost curve
    pub fn with_model_cost(
        mut self,
        name: impl Into<String>,
        declared_max_context: u32,
        cost: CostModel,
    ) -> Self {
        let name = name.into();
        self.costs.insert(name.clone(), cost);
        self.catalog
            .push(ModelDescriptor::new(name, declared_max_context));
        self
    }

    /// Status reports "not ready" for the first `polls` polls after each load
    pub fn warmup_polls(mut self, polls: u32) -> Self {
        self.warmup_polls = polls;
        self
    }

    /// Readings keep drifting upward, so the sampler never sees two agree
    pub fn never_settle(mut self) -> Self {
        self.never_settle = true;
        self
    }

    /// Refuse loads whose context exceeds `context`
    pub fn reject_above(mut self, context: u32) -> Self {
        self.reject_above = Some(context);
        self
    }

    /// Loads above `context` time out
    pub fn timeout_above(mut self, context: u32) -> Self {
        self.timeout_above = Some(context);
        self
    }

    /// Loads whose cost exceeds `bytes` fail with out-of-memory
    pub fn oom_above(mut self, bytes: u64) -> Self {
        self.oom_above_bytes = Some(bytes);
        self
    }

    /// Device capacity; costs beyond it spill to system RAM
    pub fn device_bytes(mut self, bytes: u64) -> Self {
        self.device_bytes = Some(bytes);
        self
    }

    /// The next `count` unloads fail and leave the model resident
    pub fn fail_unloads(self, count: u32) -> Self {
        self.lock().unload_failures_left = count;
        self
    }

    /// Let `successes` unloads through first, then fail the next `count`
    pub fn fail_unloads_after(self, successes: u32, count: u32) -> Self {
        {
            let mut state = self.lock();
            state.unloads_before_failure = successes;
            state.unload_failures_left = count;
        }
        self
    }

    /// Stop answering once `loads` loads have been accepted
    pub fn unreachable_after_loads(mut self, loads: u32) -> Self {
        self.unreachable_after_loads = Some(loads);
        self
    }

    pub fn load_latency(mut self, latency: Duration) -> Self {
        self.load_latency = latency;
        self
    }

    /// A model loaded by someone else, visible in the resident list
    pub fn with_foreign_resident(self, name: impl Into<String>, context: u32) -> Self {
        self.lock().resident.insert(
            name.into(),
            Resident {
                context,
                polls: 0,
                foreign: true,
            },
        );
        self
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    pub fn stats(&self) -> DaemonStats {
        self.lock().stats
    }

    /// Names of resident models loaded through this daemon's clients
    pub fn resident(&self) -> Vec<String> {
        let state = self.lock();
        let mut names: Vec<String> = state
            .resident
            .iter()
            .filter(|(_, r)| !r.foreign)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Cost the daemon charges for `model` at `context`
    pub fn cost_of(&self, model: &str, context: u32) -> u64 {
        self.costs
            .get(model)
            .unwrap_or(&self.default_cost)
            .cost(context)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_reachable(state: &State) -> Result<()> {
        if state.unreachable {
            return Err(ProbeError::DaemonUnavailable(
                "simulated daemon unreachable".into(),
            ));
        }
        Ok(())
    }

    fn load_error(model: &str, context: u32, reason: LoadFailure, message: &str) -> ProbeError {
        ProbeError::Load {
            model: model.to_string(),
            context,
            reason,
            message: message.to_string(),
        }
    }

    fn reading(&self, model: &str, context: u32, polls: u32) -> MemoryReading {
        let mut total = self.cost_of(model, context);
        if self.never_settle {
            total = total.saturating_add(DRIFT_PER_POLL * polls as u64);
        }
        let vram = match self.device_bytes {
            Some(capacity) => total.min(capacity),
            None => total,
        };
        MemoryReading {
            vram_bytes: vram,
            total_bytes: total,
            ready: true,
        }
    }
}

#[async_trait]
impl ServingClient for SimulatedDaemon {
    async fn load(&self, model: &str, context: u32) -> Result<LoadedModelHandle> {
        {
            let mut state = self.lock();
            Self::check_reachable(&state)?;
            state.stats.load_attempts += 1;
        }

        if !self.load_latency.is_zero() {
            tokio::time::sleep(self.load_latency).await;
        }

        if self.reject_above.is_some_and(|limit| context > limit) {
            return Err(Self::load_error(
                model,
                context,
                LoadFailure::Rejected,
                "context length not supported",
            ));
        }
        if self.timeout_above.is_some_and(|limit| context > limit) {
            return Err(Self::load_error(
                model,
                context,
                LoadFailure::Timeout,
                "load timed out",
            ));
        }
        let cost = self.cost_of(model, context);
        if self.oom_above_bytes.is_some_and(|limit| cost > limit) {
            return Err(Self::load_error(
                model,
                context,
                LoadFailure::Oom,
                "cudaMalloc failed: out of memory",
            ));
        }

        let mut state = self.lock();
        Self::check_reachable(&state)?;
        state.resident.insert(
            model.to_string(),
            Resident {
                context,
                polls: 0,
                foreign: false,
            },
        );
        state.stats.loads += 1;
        let ours = state.resident.values().filter(|r| !r.foreign).count();
        state.stats.peak_resident = state.stats.peak_resident.max(ours);
        if self
            .unreachable_after_loads
            .is_some_and(|limit| state.stats.loads >= limit)
        {
            state.unreachable = true;
        }

        Ok(LoadedModelHandle::new(model, context))
    }

    async fn status(&self, handle: &LoadedModelHandle) -> Result<MemoryReading> {
        let mut state = self.lock();
        Self::check_reachable(&state)?;
        state.stats.status_polls += 1;

        let warmup = self.warmup_polls;
        let Some(resident) = state.resident.get_mut(handle.model()) else {
            return Ok(MemoryReading::not_ready());
        };
        if resident.context != handle.context() {
            return Ok(MemoryReading::not_ready());
        }
        resident.polls += 1;
        if resident.polls <= warmup {
            return Ok(MemoryReading::not_ready());
        }
        let polls = resident.polls - warmup;
        Ok(self.reading(handle.model(), handle.context(), polls))
    }

    async fn unload(&self, handle: LoadedModelHandle) -> Result<()> {
        let mut state = self.lock();
        Self::check_reachable(&state)?;

        if state.unloads_before_failure > 0 {
            state.unloads_before_failure -= 1;
        } else if state.unload_failures_left > 0 {
            state.unload_failures_left -= 1;
            state.stats.failed_unloads += 1;
            return Err(ProbeError::UnloadFailure {
                model: handle.model().to_string(),
                message: "model still resident after unload request".into(),
            });
        }

        if state.resident.remove(handle.model()).is_some() {
            state.stats.unloads += 1;
        }
        Ok(())
    }

    async fn resident_models(&self) -> Result<Vec<ResidentModel>> {
        let state = self.lock();
        Self::check_reachable(&state)?;
        let mut models: Vec<ResidentModel> = state
            .resident
            .iter()
            .map(|(name, r)| {
                let reading = self.reading(name, r.context, r.polls);
                ResidentModel {
                    name: name.clone(),
                    vram_bytes: reading.vram_bytes,
                    total_bytes: reading.total_bytes,
                    context_length: Some(r.context),
                }
            })
            .collect();
        models.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(models)
    }

    async fn version(&self) -> Result<String> {
        Self::check_reachable(&self.lock())?;
        Ok("0.0.0-simulated".to_string())
    }
}

#[async_trait]
impl ModelCatalog for SimulatedDaemon {
    async fn list_models(&self) -> Result<Vec<ModelDescriptor>> {
        Self::check_reachable(&self.lock())?;
        Ok(self.catalog.clone())
    }
}
