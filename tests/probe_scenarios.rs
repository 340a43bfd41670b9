//! End-to-end probe and sweep runs against the simulated daemon
//!
//! Each test drives a full session: catalog, engine, residency slot and report
//! file, then checks the report and the daemon's load/unload counters.

use ctx_probe::client::{CostModel, SimulatedDaemon};
use ctx_probe::probe::SearchSettings;
use ctx_probe::sampler::SamplerConfig;
use ctx_probe::sweep::SweepSettings;
use ctx_probe::{
    CancelToken, ModelCatalog, ProbeEngine, ProbeError, ProbeResult, ProbeStatus, ReportFormat,
    ReportWriter, ResolvedBudget, RunStatus, Session, SweepEngine, UsageSample, UsageStatus,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const GB: u64 = 1_000_000_000;
const KB: u64 = 1_000;

fn linear() -> CostModel {
    CostModel::linear(4 * GB, 100 * KB)
}

fn sampler() -> SamplerConfig {
    SamplerConfig {
        poll_interval_ms: 50,
        max_wait_ms: 1_000,
        ..SamplerConfig::default()
    }
}

struct Harness {
    daemon: Arc<SimulatedDaemon>,
    session: Session,
    dir: TempDir,
}

impl Harness {
    fn new(daemon: SimulatedDaemon) -> Self {
        let daemon = Arc::new(daemon);
        let session = Session::new(daemon.clone(), CancelToken::new());
        Self {
            daemon,
            session,
            dir: TempDir::new().unwrap(),
        }
    }

    fn probe_engine(&self, budget: ResolvedBudget) -> ProbeEngine {
        ProbeEngine::new(
            self.session.slot().clone(),
            sampler(),
            budget,
            SearchSettings::default(),
        )
    }

    fn sweep_engine(&self) -> SweepEngine {
        SweepEngine::new(
            self.session.slot().clone(),
            sampler(),
            SweepSettings::default(),
        )
    }

    fn probe_report(&self) -> ReportWriter<ProbeResult> {
        ReportWriter::new(self.dir.path().join("max_context.csv"), ReportFormat::Csv)
    }

    fn usage_report(&self) -> ReportWriter<UsageSample> {
        ReportWriter::new(self.dir.path().join("context_usage.csv"), ReportFormat::Csv)
    }

    fn assert_balanced(&self) {
        let stats = self.daemon.stats();
        assert_eq!(stats.loads, stats.unloads, "loads and unloads must balance");
        assert!(stats.peak_resident <= 1, "more than one model resident");
        assert!(self.daemon.resident().is_empty());
    }
}

async fn probe_all(h: &Harness, budget: ResolvedBudget) -> (RunStatus, Vec<ProbeResult>) {
    let models = h.daemon.list_models().await.unwrap();
    let engine = h.probe_engine(budget);
    let mut report = h.probe_report();
    let summary = h
        .session
        .run_probe(&models, &engine, &mut report, false)
        .await
        .unwrap();
    (summary.status(), report.rows().to_vec())
}

#[tokio::test(start_paused = true)]
async fn test_declared_max_fits_in_one_cycle() {
    let h = Harness::new(SimulatedDaemon::new(linear()).with_model("m", 32768));
    let (status, rows) = probe_all(&h, ResolvedBudget::bytes(8 * GB)).await;

    assert_eq!(status, RunStatus::Complete);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].context_size, 32768);
    assert!(rows[0].is_model_max);
    assert_eq!(rows[0].load_cycles, 1);
    h.assert_balanced();
}

#[tokio::test(start_paused = true)]
async fn test_tight_budget_converges_near_boundary() {
    let h = Harness::new(SimulatedDaemon::new(linear()).with_model("m", 32768));
    let (_, rows) = probe_all(&h, ResolvedBudget::bytes(5 * GB)).await;

    let row = &rows[0];
    assert_eq!(row.status, ProbeStatus::Fits);
    // 4GB + c * 100KB = 5GB  =>  c = 10000
    assert!(row.context_size <= 10_000 && 10_000 - row.context_size <= 256);
    assert!(row.observed_vram <= 5 * GB);
    assert!(!row.is_model_max);
    // ceil(log2(32768 / 256)) = 7, plus the bound-finding probes
    assert!(row.load_cycles <= 7 + 3, "took {} cycles", row.load_cycles);
    h.assert_balanced();
}

#[tokio::test(start_paused = true)]
async fn test_weights_over_budget_is_not_probable_and_run_continues() {
    let h = Harness::new(
        SimulatedDaemon::new(linear())
            .with_model_cost("huge", 32768, CostModel::linear(10 * GB, 100 * KB))
            .with_model("small", 32768),
    );
    let (status, rows) = probe_all(&h, ResolvedBudget::bytes(8 * GB)).await;

    assert_eq!(status, RunStatus::Complete);
    assert_eq!(status.exit_code(), 0);
    let huge = rows.iter().find(|r| r.model == "huge").unwrap();
    assert_eq!(huge.status, ProbeStatus::NotProbable);
    assert_eq!(huge.context_size, 0);
    let small = rows.iter().find(|r| r.model == "small").unwrap();
    assert_eq!(small.status, ProbeStatus::Fits);
    h.assert_balanced();
}

#[tokio::test(start_paused = true)]
async fn test_probe_is_idempotent() {
    let run = || async {
        let h = Harness::new(
            SimulatedDaemon::new(linear())
                .with_model("a", 32768)
                .with_model("b", 131072),
        );
        let (_, rows) = probe_all(&h, ResolvedBudget::bytes(6 * GB)).await;
        rows.into_iter()
            .map(|r| (r.model, r.context_size, r.observed_vram, r.load_cycles))
            .collect::<Vec<_>>()
    };
    assert_eq!(run().await, run().await);
}

#[tokio::test(start_paused = true)]
async fn test_same_daemon_probed_twice_gives_same_result() {
    let h = Harness::new(SimulatedDaemon::new(linear()).with_model("m", 65536));
    let (_, first) = probe_all(&h, ResolvedBudget::bytes(7 * GB)).await;
    let (_, second) = probe_all(&h, ResolvedBudget::bytes(7 * GB)).await;
    assert_eq!(first[0].context_size, second[0].context_size);
    assert_eq!(first[0].observed_vram, second[0].observed_vram);
    h.assert_balanced();
}

#[tokio::test(start_paused = true)]
async fn test_unload_failure_degrades_run() {
    let h = Harness::new(
        SimulatedDaemon::new(linear())
            .with_model("a", 32768)
            .with_model("b", 32768)
            .fail_unloads(1),
    );
    let (status, rows) = probe_all(&h, ResolvedBudget::bytes(8 * GB)).await;

    assert_eq!(status, RunStatus::Degraded);
    assert_eq!(status.exit_code(), 2);
    assert_eq!(rows[0].status, ProbeStatus::UnloadFailed);
    assert_eq!(rows[1].status, ProbeStatus::Fits);
    // The stuck model was released at the end of the run
    assert!(h.daemon.resident().is_empty());
    assert_eq!(h.session.slot().leaked(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_descriptor_recorded_as_failed() {
    let h = Harness::new(
        SimulatedDaemon::new(linear())
            .with_model("broken", 0)
            .with_model("m", 32768),
    );
    let (status, rows) = probe_all(&h, ResolvedBudget::bytes(8 * GB)).await;

    assert_eq!(status, RunStatus::Complete);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].model, "broken");
    assert_eq!(rows[0].status, ProbeStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_daemon_lost_mid_run_is_fatal() {
    let h = Harness::new(
        SimulatedDaemon::new(linear())
            .with_model("a", 32768)
            .with_model("b", 32768)
            .unreachable_after_loads(2),
    );
    let models = h.daemon.list_models().await.unwrap();
    let engine = h.probe_engine(ResolvedBudget::bytes(8 * GB));
    let mut report = h.probe_report();

    let err = h
        .session
        .run_probe(&models, &engine, &mut report, false)
        .await
        .unwrap_err();
    assert!(matches!(err, ProbeError::DaemonUnavailable(_)));

    // The first model's row was persisted before the failure
    let written: ReportWriter<ProbeResult> =
        ReportWriter::resume(h.dir.path().join("max_context.csv"), ReportFormat::Csv)
            .await
            .unwrap();
    assert_eq!(written.rows().len(), 1);
    assert_eq!(written.rows()[0].model, "a");
}

#[tokio::test(start_paused = true)]
async fn test_empty_catalog_is_fatal() {
    let h = Harness::new(SimulatedDaemon::new(linear()));
    let engine = h.probe_engine(ResolvedBudget::bytes(8 * GB));
    let mut report = h.probe_report();
    let err = h
        .session
        .run_probe(&[], &engine, &mut report, false)
        .await
        .unwrap_err();
    assert!(matches!(err, ProbeError::EmptyCatalog));
    assert!(err.is_fatal());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_at_model_boundary() {
    let daemon = Arc::new(
        SimulatedDaemon::new(linear())
            .with_model("a", 32768)
            .with_model("b", 32768)
            .with_model("c", 32768),
    );
    let cancel = CancelToken::new();
    let session = Session::new(daemon.clone(), cancel.clone());
    let dir = TempDir::new().unwrap();
    let models = daemon.list_models().await.unwrap();
    let engine = ProbeEngine::new(
        session.slot().clone(),
        sampler(),
        ResolvedBudget::bytes(8 * GB),
        SearchSettings::default(),
    );
    let mut report = ReportWriter::new(dir.path().join("out.csv"), ReportFormat::Csv);

    // Cancelled before the run starts: nothing is loaded
    cancel.cancel();
    let summary = session
        .run_probe(&models, &engine, &mut report, false)
        .await
        .unwrap();
    assert!(summary.cancelled);
    assert_eq!(summary.measured, 0);
    assert_eq!(daemon.stats().load_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn test_abort_mid_load_releases_model() {
    let h = Harness::new(
        SimulatedDaemon::new(linear())
            .with_model("m", 32768)
            .warmup_polls(1_000),
    );
    let models = h.daemon.list_models().await.unwrap();
    let engine = h.probe_engine(ResolvedBudget::bytes(8 * GB));
    let mut report = h.probe_report();

    // Drop the run while the sampler is still waiting on a loaded model
    let run = h.session.run_probe(&models, &engine, &mut report, false);
    let timed_out = tokio::time::timeout(Duration::from_millis(200), run).await;
    assert!(timed_out.is_err());
    assert_eq!(h.daemon.resident(), vec!["m".to_string()]);

    assert_eq!(h.session.slot().release().await, 0);
    h.assert_balanced();
}

#[tokio::test(start_paused = true)]
async fn test_resume_skips_finished_models() {
    let h = Harness::new(
        SimulatedDaemon::new(linear())
            .with_model("a", 32768)
            .with_model("b", 32768),
    );
    let models = h.daemon.list_models().await.unwrap();
    let engine = h.probe_engine(ResolvedBudget::bytes(8 * GB));

    let mut first = h.probe_report();
    h.session
        .run_probe(&models[..1], &engine, &mut first, false)
        .await
        .unwrap();
    let loads_after_first = h.daemon.stats().loads;

    let mut resumed: ReportWriter<ProbeResult> =
        ReportWriter::resume(first.path(), ReportFormat::Csv).await.unwrap();
    let summary = h
        .session
        .run_probe(&models, &engine, &mut resumed, true)
        .await
        .unwrap();

    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.measured, 1);
    assert_eq!(h.daemon.stats().loads, loads_after_first + 1);
    assert_eq!(resumed.rows().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_sweep_one_sample_per_size_despite_failures() {
    let h = Harness::new(
        SimulatedDaemon::new(linear())
            .with_model("m", 131072)
            .reject_above(16384)
            .with_model("tiny", 1024),
    );
    let models = h.daemon.list_models().await.unwrap();
    let engine = h.sweep_engine();
    let mut report = h.usage_report();
    let summary = h
        .session
        .run_usage(&models, &engine, &mut report, false)
        .await
        .unwrap();

    assert_eq!(summary.status(), RunStatus::Complete);
    let sizes: Vec<u32> = report
        .rows()
        .iter()
        .filter(|r| r.model == "m")
        .map(|r| r.context_size)
        .collect();
    assert_eq!(sizes, vec![2048, 4096, 8192, 16384, 32768, 65536, 131072]);
    let failed = report
        .rows()
        .iter()
        .filter(|r| r.status == UsageStatus::LoadFailed)
        .count();
    assert_eq!(failed, 3);

    // Declared max below the floor is still measured once
    let tiny: Vec<_> = report.rows().iter().filter(|r| r.model == "tiny").collect();
    assert_eq!(tiny.len(), 1);
    assert_eq!(tiny[0].context_size, 1024);
    h.assert_balanced();
}

#[tokio::test(start_paused = true)]
async fn test_sweep_resume_measures_only_missing_sizes() {
    let h = Harness::new(SimulatedDaemon::new(linear()).with_model("m", 8192));
    let models = h.daemon.list_models().await.unwrap();
    let engine = h.sweep_engine();

    let mut report = h.usage_report();
    h.session
        .run_usage(&models, &engine, &mut report, false)
        .await
        .unwrap();
    assert_eq!(h.daemon.stats().loads, 3);

    let mut resumed: ReportWriter<UsageSample> =
        ReportWriter::resume(report.path(), ReportFormat::Csv).await.unwrap();
    h.session
        .run_usage(&models, &engine, &mut resumed, true)
        .await
        .unwrap();
    assert_eq!(h.daemon.stats().loads, 3);
    assert_eq!(resumed.rows().len(), 3);
}
