//! Single residency slot shared by the engines
//!
//! VRAM attribution only works if exactly one model loaded by this toolkit is
//! resident at a time. Every load and unload goes through the slot, which
//! refuses a second concurrent load and remembers what is resident so a
//! cancelled run can still release it.

use crate::client::{LoadedModelHandle, ServingClient};
use crate::error::{ProbeError, Result};
use std::sync::{Arc, Mutex};
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Occupant {
    model: String,
    context: u32,
}

#[derive(Default)]
struct SlotState {
    current: Option<Occupant>,
    /// Models whose unload failed and may still be resident in the daemon
    leaked: Vec<Occupant>,
}

pub struct ResidencySlot {
    client: Arc<dyn ServingClient>,
    state: Mutex<SlotState>,
}

impl ResidencySlot {
    pub fn new(client: Arc<dyn ServingClient>) -> Self {
        Self {
            client,
            state: Mutex::new(SlotState::default()),
        }
    }

    pub fn client(&self) -> &Arc<dyn ServingClient> {
        &self.client
    }

    /// Model currently held, if any
    pub fn occupant(&self) -> Option<(String, u32)> {
        self.lock()
            .current
            .as_ref()
            .map(|o| (o.model.clone(), o.context))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SlotState> {
        // A poisoned slot still holds valid bookkeeping
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Load through the client, claiming the slot for the duration
    pub async fn load(&self, model: &str, context: u32) -> Result<LoadedModelHandle> {
        {
            let mut state = self.lock();
            if let Some(held) = &state.current {
                return Err(ProbeError::Residency {
                    held: held.model.clone(),
                    requested: model.to_string(),
                });
            }
            state.current = Some(Occupant {
                model: model.to_string(),
                context,
            });
        }

        crate::metrics::record_load_attempt(model);
        let started = Instant::now();
        let result = self.client.load(model, context).await;

        match result {
            Ok(handle) => {
                crate::metrics::record_load_duration(started.elapsed());
                tracing::debug!(
                    model = %model,
                    context,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Model loaded"
                );
                Ok(handle)
            }
            Err(e) => {
                self.lock().current = None;
                if let Some(reason) = e.load_failure() {
                    crate::metrics::record_load_failure(model, reason);
                }
                Err(e)
            }
        }
    }

    /// Unload and free the slot
    ///
    /// The slot is freed even when the unload fails, so the run can move on to
    /// the next model; the model is remembered and retried by [`release`](Self::release).
    pub async fn unload(&self, handle: LoadedModelHandle) -> Result<()> {
        let model = handle.model().to_string();
        let context = handle.context();
        let result = self.client.unload(handle).await;

        let mut state = self.lock();
        state.current = None;
        if let Err(e) = &result {
            crate::metrics::record_unload_failure(&model);
            tracing::error!(
                model = %model,
                context,
                error = %e,
                "Unload failed; daemon may still hold the model"
            );
            state.leaked.push(Occupant { model, context });
        }
        result
    }

    /// Best-effort release of anything this run may have left resident
    ///
    /// Used on the cancellation path and at the end of a degraded run.
    /// Returns the number of models that could not be released.
    pub async fn release(&self) -> usize {
        let pending: Vec<Occupant> = {
            let mut state = self.lock();
            let mut pending: Vec<Occupant> = state.current.take().into_iter().collect();
            pending.append(&mut state.leaked);
            pending
        };

        let mut stuck = 0;
        for occupant in pending {
            tracing::info!(model = %occupant.model, "Releasing resident model");
            let handle = LoadedModelHandle::new(occupant.model.clone(), occupant.context);
            if let Err(e) = self.client.unload(handle).await {
                tracing::warn!(
                    model = %occupant.model,
                    error = %e,
                    "Best-effort release failed"
                );
                stuck += 1;
            }
        }
        stuck
    }

    /// Number of models whose unload failed and that have not been released since
    pub fn leaked(&self) -> usize {
        self.lock().leaked.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{CostModel, SimulatedDaemon};
    use crate::units::GIB;

    fn daemon() -> Arc<SimulatedDaemon> {
        Arc::new(SimulatedDaemon::new(CostModel::linear(4 * GIB, 100 * 1024)))
    }

    #[tokio::test]
    async fn test_second_load_is_refused() {
        let daemon = daemon();
        let slot = ResidencySlot::new(daemon.clone());

        let handle = slot.load("a", 2048).await.unwrap();
        let err = slot.load("b", 2048).await.unwrap_err();
        assert!(matches!(err, ProbeError::Residency { .. }));
        assert!(err.is_fatal());

        slot.unload(handle).await.unwrap();
        assert!(slot.occupant().is_none());
        assert_eq!(daemon.stats().peak_resident, 1);
    }

    #[tokio::test]
    async fn test_failed_load_frees_slot() {
        let daemon = Arc::new(
            SimulatedDaemon::new(CostModel::linear(4 * GIB, 100 * 1024)).reject_above(4096),
        );
        let slot = ResidencySlot::new(daemon.clone());

        assert!(slot.load("a", 8192).await.is_err());
        assert!(slot.occupant().is_none());
        let handle = slot.load("a", 4096).await.unwrap();
        slot.unload(handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_leaked_model_is_released_later() {
        let daemon = Arc::new(
            SimulatedDaemon::new(CostModel::linear(4 * GIB, 100 * 1024)).fail_unloads(1),
        );
        let slot = ResidencySlot::new(daemon.clone());

        let handle = slot.load("a", 2048).await.unwrap();
        assert!(slot.unload(handle).await.unwrap_err().is_unload_failure());
        assert_eq!(slot.leaked(), 1);
        assert!(slot.occupant().is_none());

        assert_eq!(slot.release().await, 0);
        assert_eq!(slot.leaked(), 0);
        assert!(daemon.resident().is_empty());
    }

    #[tokio::test]
    async fn test_release_on_cancel_path() {
        let daemon = daemon();
        let slot = ResidencySlot::new(daemon.clone());

        // Handle dropped without unload, as when an in-flight future is cancelled
        drop(slot.load("a", 16384).await.unwrap());
        assert_eq!(slot.occupant(), Some(("a".to_string(), 16384)));
        assert_eq!(daemon.resident().len(), 1);

        assert_eq!(slot.release().await, 0);
        assert!(slot.occupant().is_none());
        assert!(daemon.resident().is_empty());
    }
}
