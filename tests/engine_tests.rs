use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use opswatch_rs::config::EngineConfig;
use opswatch_rs::sampler::{MetricsSource, PortProber, ProbeOutcome, ProcessSource};
use opswatch_rs::sink::{AlertSink, MemoryStore, Persistence, SessionId};
use opswatch_rs::types::{
    Alert, JobId, MetricsSnapshot, MonitorSample, ProcessInfo, ScanSummary, Severity, TaskKind,
    TaskResults, TaskState, ThresholdSet,
};
use opswatch_rs::{Engine, EngineError, SinkError};
use time::OffsetDateTime;
use tokio::net::TcpListener;

/// A host that accepts connections only on `open` ports.
struct SimulatedHost {
    name: String,
    open: HashSet<u16>,
    delay: Duration,
}

impl SimulatedHost {
    fn new(open: &[u16]) -> Self {
        Self {
            name: "sim.local".into(),
            open: open.iter().copied().collect(),
            delay: Duration::ZERO,
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl PortProber for SimulatedHost {
    async fn resolve(&self, host: &str) -> Result<IpAddr, EngineError> {
        if host == self.name {
            Ok(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))
        } else {
            Err(EngineError::HostResolution {
                host: host.to_string(),
                reason: "NXDOMAIN".into(),
            })
        }
    }

    async fn probe(&self, _addr: IpAddr, port: u16, _timeout: Duration) -> ProbeOutcome {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.open.contains(&port) {
            ProbeOutcome::Open
        } else if port % 7 == 0 {
            ProbeOutcome::Error("timed out".into())
        } else {
            ProbeOutcome::Closed
        }
    }
}

/// Memory store that also counts finalize calls.
#[derive(Default)]
struct CountingStore {
    inner: MemoryStore,
    finalized: AtomicUsize,
}

impl Persistence for CountingStore {
    fn create_session(
        &self,
        kind: TaskKind,
        target: &str,
        config: &serde_json::Value,
    ) -> Result<SessionId, SinkError> {
        self.inner.create_session(kind, target, config)
    }

    fn append_scan_result(
        &self,
        session: SessionId,
        port: u16,
        service: &str,
        status: &str,
    ) -> Result<(), SinkError> {
        self.inner.append_scan_result(session, port, service, status)
    }

    fn finalize_session(&self, session: SessionId, summary: &ScanSummary) -> Result<(), SinkError> {
        self.finalized.fetch_add(1, Ordering::SeqCst);
        self.inner.finalize_session(session, summary)
    }

    fn store_alert(&self, alert: &Alert) -> Result<(), SinkError> {
        self.inner.store_alert(alert)
    }
}

/// Persistence that always fails.
struct BrokenStore;

impl Persistence for BrokenStore {
    fn create_session(&self, _: TaskKind, _: &str, _: &serde_json::Value) -> Result<SessionId, SinkError> {
        Err(SinkError::Closed)
    }

    fn append_scan_result(&self, _: SessionId, _: u16, _: &str, _: &str) -> Result<(), SinkError> {
        Err(SinkError::Closed)
    }

    fn finalize_session(&self, _: SessionId, _: &ScanSummary) -> Result<(), SinkError> {
        Err(SinkError::Closed)
    }

    fn store_alert(&self, _: &Alert) -> Result<(), SinkError> {
        Err(SinkError::Closed)
    }
}

#[derive(Default)]
struct CollectAlerts(Mutex<Vec<Alert>>);

impl CollectAlerts {
    fn all(&self) -> Vec<Alert> {
        self.0.lock().unwrap().clone()
    }
}

impl AlertSink for CollectAlerts {
    fn notify(&self, alert: &Alert) -> Result<(), SinkError> {
        self.0.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

struct FixedMetrics {
    cpu: f32,
    memory: f32,
    disk: f32,
    fail: bool,
}

impl MetricsSource for FixedMetrics {
    fn sample(&mut self) -> anyhow::Result<MetricsSnapshot> {
        if self.fail {
            return Err(anyhow!("sensor unavailable"));
        }
        Ok(MetricsSnapshot {
            cpu_percent: self.cpu,
            memory_percent: self.memory,
            disk_percent: self.disk,
            connection_count: 12,
            process_count: 100,
            timestamp: OffsetDateTime::now_utc(),
        })
    }
}

/// Returns `ticks[i]` on the i-th call, then repeats the last tick.
struct ScriptedProcesses {
    ticks: Vec<Vec<ProcessInfo>>,
    calls: Arc<AtomicUsize>,
}

impl ProcessSource for ScriptedProcesses {
    fn processes(&mut self) -> anyhow::Result<Vec<ProcessInfo>> {
        let i = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.ticks[i.min(self.ticks.len() - 1)].clone())
    }
}

fn proc_info(pid: u32, name: &str) -> ProcessInfo {
    ProcessInfo {
        pid,
        name: name.to_string(),
    }
}

fn engine_with(store: Arc<dyn Persistence>) -> Engine {
    Engine::new(EngineConfig::default(), store)
}

async fn wait_for<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

const TIMEOUT: Duration = Duration::from_millis(100);

#[tokio::test]
async fn scan_finds_only_ssh_on_simulated_host() {
    let store = Arc::new(CountingStore::default());
    let engine = engine_with(store.clone());
    let host = Arc::new(SimulatedHost::new(&[22]));

    let id = engine
        .start_port_scan_with(host, "sim.local", 1, 100, TIMEOUT)
        .await
        .unwrap();
    let view = engine.wait(id).await.unwrap();

    assert_eq!(view.state, TaskState::Completed);
    assert_eq!(view.progress, 100);
    assert!(view.completed_at.is_some());
    match &view.results {
        TaskResults::Scan { hits } => {
            assert_eq!(hits.len(), 1);
            assert_eq!(hits[0].port, 22);
            assert_eq!(hits[0].service, "SSH");
        }
        other => panic!("unexpected results: {other:?}"),
    }

    let sessions = store.inner.sessions();
    assert_eq!(sessions.len(), 1);
    let results = store.inner.session_results(sessions[0].id);
    assert_eq!(results.len(), 1);
    assert_eq!((results[0].port, results[0].status.as_str()), (22, "open"));
    let summary = sessions[0].summary.clone().expect("session finalized");
    assert_eq!(summary.state, TaskState::Completed);
    assert_eq!(summary.open_ports, vec![22]);
    assert_eq!(store.finalized.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn scan_with_everything_refused_completes_empty() {
    let engine = engine_with(Arc::new(MemoryStore::new()));
    let id = engine
        .start_port_scan_with(Arc::new(SimulatedHost::new(&[])), "sim.local", 1, 100, TIMEOUT)
        .await
        .unwrap();
    let view = engine.wait(id).await.unwrap();
    assert_eq!(view.state, TaskState::Completed);
    assert_eq!(view.progress, 100);
    assert!(view.open_ports().is_empty());
}

#[tokio::test]
async fn progress_is_monotonic_and_ends_at_100() {
    let engine = Arc::new(engine_with(Arc::new(MemoryStore::new())));
    let host = Arc::new(SimulatedHost::new(&[5, 50]).with_delay(Duration::from_millis(1)));
    let id = engine
        .start_port_scan_with(host, "sim.local", 1, 150, TIMEOUT)
        .await
        .unwrap();

    let mut seen = Vec::new();
    loop {
        let view = engine.snapshot(id).await.unwrap();
        seen.push(view.progress);
        if view.state.is_terminal() {
            assert_eq!(view.state, TaskState::Completed);
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {seen:?}");
    assert_eq!(*seen.last().unwrap(), 100);
    assert_eq!(engine.wait(id).await.unwrap().open_ports(), vec![5, 50]);
}

#[tokio::test]
async fn unresolvable_host_fails_the_task() {
    let store = Arc::new(CountingStore::default());
    let engine = engine_with(store.clone());
    let id = engine
        .start_port_scan_with(Arc::new(SimulatedHost::new(&[22])), "nowhere.invalid", 1, 10, TIMEOUT)
        .await
        .unwrap();
    let view = engine.wait(id).await.unwrap();
    assert_eq!(view.state, TaskState::Failed);
    let error = view.error.clone().expect("error recorded");
    assert!(error.contains("nowhere.invalid"), "{error}");
    assert!(view.open_ports().is_empty());
    assert_eq!(store.finalized.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn invalid_requests_create_no_task() {
    let engine = engine_with(Arc::new(MemoryStore::new()));
    let host = Arc::new(SimulatedHost::new(&[]));

    let cases = [
        ("", 1, 10, TIMEOUT),
        ("   ", 1, 10, TIMEOUT),
        ("sim.local", 10, 1, TIMEOUT),
        ("sim.local", 0, 10, TIMEOUT),
        ("sim.local", 1, 10, Duration::ZERO),
    ];
    for (target, start, end, timeout) in cases {
        let err = engine
            .start_port_scan_with(host.clone(), target, start, end, timeout)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)), "{err}");
    }
    let err = engine
        .start_monitor(TaskKind::SystemMonitor, Duration::ZERO, ThresholdSet::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidArgument(_)));
    for interval in [Duration::from_millis(1), Duration::from_millis(999), Duration::from_secs(61)] {
        let err = engine
            .start_system_monitor_with(
                FixedMetrics {
                    cpu: 0.0,
                    memory: 0.0,
                    disk: 0.0,
                    fail: false,
                },
                interval,
                ThresholdSet::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)), "{interval:?}");
    }
    let err = engine
        .start_monitor(TaskKind::PortScan, Duration::from_secs(1), ThresholdSet::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidArgument(_)));

    assert!(engine.list().await.is_empty());
}

#[tokio::test]
async fn cancelled_scan_stops_and_stays_cancelled() {
    let store = Arc::new(CountingStore::default());
    let engine = engine_with(store.clone());
    let host = Arc::new(SimulatedHost::new(&[3, 900]).with_delay(Duration::from_millis(5)));
    let id = engine
        .start_port_scan_with(host, "sim.local", 1, 1000, TIMEOUT)
        .await
        .unwrap();

    wait_for(|| {
        let engine = &engine;
        async move { engine.snapshot(id).await.unwrap().progress >= 1 }
    })
    .await;

    assert!(engine.cancel(id).await.unwrap());
    let at_cancel = engine.snapshot(id).await.unwrap();
    assert!(!engine.cancel(id).await.unwrap(), "second cancel is a no-op");

    let after = engine.wait(id).await.unwrap();
    assert_eq!(after.state, TaskState::Cancelled);
    assert_eq!(after, at_cancel, "no progress or results after cancellation");
    assert!(after.progress < 100);
    assert_eq!(after.open_ports(), vec![3]);

    // A third cancel after the worker exited is still a no-op.
    assert!(!engine.cancel(id).await.unwrap());
    assert_eq!(store.finalized.load(Ordering::SeqCst), 1);
    let summary = store.inner.sessions()[0].summary.clone().unwrap();
    assert_eq!(summary.state, TaskState::Cancelled);
}

#[tokio::test]
async fn cancel_unknown_job_is_not_found() {
    let engine = engine_with(Arc::new(MemoryStore::new()));
    assert!(matches!(
        engine.cancel(JobId(77)).await,
        Err(EngineError::NotFound(JobId(77)))
    ));
    assert!(matches!(
        engine.status(JobId(77)).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_scans_keep_their_own_results() {
    let engine = Arc::new(engine_with(Arc::new(MemoryStore::new())));
    let mut jobs = Vec::new();
    for n in 1..=8u16 {
        let open = vec![n, n * 10];
        let host = Arc::new(SimulatedHost::new(&open).with_delay(Duration::from_micros(200)));
        let id = engine
            .start_port_scan_with(host, "sim.local", 1, 100, TIMEOUT)
            .await
            .unwrap();
        jobs.push((id, open));
    }
    for (id, open) in jobs {
        let view = engine.wait(id).await.unwrap();
        assert_eq!(view.state, TaskState::Completed);
        assert_eq!(view.progress, 100);
        assert_eq!(view.open_ports(), open, "job {id} has foreign results");
    }
}

#[tokio::test]
async fn sink_failures_do_not_affect_the_task() {
    let engine = engine_with(Arc::new(BrokenStore));
    let id = engine
        .start_port_scan_with(Arc::new(SimulatedHost::new(&[80, 443])), "sim.local", 1, 500, TIMEOUT)
        .await
        .unwrap();
    let view = engine.wait(id).await.unwrap();
    assert_eq!(view.state, TaskState::Completed);
    assert_eq!(view.open_ports(), vec![80, 443]);
}

#[tokio::test]
async fn real_tcp_scan_of_loopback_listener() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let engine = engine_with(Arc::new(MemoryStore::new()));

    let id = engine
        .start_port_scan("127.0.0.1", port, port, Duration::from_millis(500))
        .await
        .unwrap();
    let view = engine.wait(id).await.unwrap();
    assert_eq!(view.state, TaskState::Completed);
    assert_eq!(view.open_ports(), vec![port]);
}

#[tokio::test]
async fn system_monitor_alerts_on_cpu_breach_and_never_completes() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_with(store.clone());
    let alerts = Arc::new(CollectAlerts::default());
    engine.alerts().subscribe(alerts.clone());

    let source = FixedMetrics {
        cpu: 95.0,
        memory: 50.0,
        disk: 50.0,
        fail: false,
    };
    let thresholds = ThresholdSet {
        cpu_percent: 80.0,
        memory_percent: 85.0,
        disk_percent: 90.0,
    };
    let id = engine
        .start_system_monitor_with(source, Duration::from_secs(1), thresholds)
        .await
        .unwrap();

    wait_for(|| {
        let alerts = alerts.clone();
        async move { !alerts.all().is_empty() }
    })
    .await;

    let view = engine.snapshot(id).await.unwrap();
    assert_eq!(view.state, TaskState::Running);
    match view.last_sample() {
        Some(MonitorSample::Metrics(m)) => assert_eq!(m.cpu_percent, 95.0),
        other => panic!("unexpected sample: {other:?}"),
    }

    assert!(engine.cancel(id).await.unwrap());
    let view = engine.wait(id).await.unwrap();
    assert_eq!(view.state, TaskState::Cancelled);

    let collected = alerts.all();
    assert!(collected.iter().all(|a| a.job_id == id));
    assert!(collected
        .iter()
        .all(|a| a.severity == Severity::High && a.category == "CPU"));

    let status = engine.status(id).await.unwrap();
    assert!(status.open_ports.is_none());
    assert!(status.last_snapshot.is_some());
}

#[tokio::test]
async fn sampling_errors_raise_monitor_alerts_and_keep_running() {
    let engine = engine_with(Arc::new(MemoryStore::new()));
    let alerts = Arc::new(CollectAlerts::default());
    engine.alerts().subscribe(alerts.clone());

    let source = FixedMetrics {
        cpu: 0.0,
        memory: 0.0,
        disk: 0.0,
        fail: true,
    };
    let id = engine
        .start_system_monitor_with(source, Duration::from_secs(1), ThresholdSet::default())
        .await
        .unwrap();
    wait_for(|| {
        let alerts = alerts.clone();
        async move { !alerts.all().is_empty() }
    })
    .await;

    let first = &alerts.all()[0];
    assert_eq!(first.severity, Severity::Medium);
    assert_eq!(first.category, "Monitor");
    assert!(first.message.contains("sensor unavailable"));
    assert_eq!(engine.snapshot(id).await.unwrap().state, TaskState::Running);
    engine.cancel(id).await.unwrap();
    engine.wait(id).await.unwrap();
}

#[tokio::test]
async fn process_monitor_skips_first_tick_and_flags_new_keylogger() {
    let engine = engine_with(Arc::new(MemoryStore::new()));
    let alerts = Arc::new(CollectAlerts::default());
    engine.alerts().subscribe(alerts.clone());

    let calls = Arc::new(AtomicUsize::new(0));
    let source = ScriptedProcesses {
        ticks: vec![
            vec![proc_info(1, "init"), proc_info(2, "hacktool")],
            vec![
                proc_info(1, "init"),
                proc_info(2, "hacktool"),
                proc_info(3, "newkeylogger.exe"),
                proc_info(4, "editor"),
            ],
        ],
        calls: calls.clone(),
    };
    let id = engine
        .start_process_monitor_with(source, Duration::from_secs(1))
        .await
        .unwrap();

    wait_for(|| {
        let alerts = alerts.clone();
        async move { !alerts.all().is_empty() }
    })
    .await;
    assert!(calls.load(Ordering::SeqCst) >= 2);
    engine.cancel(id).await.unwrap();
    let view = engine.wait(id).await.unwrap();
    assert_eq!(view.state, TaskState::Cancelled);

    let collected = alerts.all();
    assert_eq!(collected.len(), 1, "{collected:?}");
    assert_eq!(collected[0].severity, Severity::High);
    assert_eq!(collected[0].job_id, id);
    assert!(collected[0].message.contains("newkeylogger.exe"));

    match view.results {
        TaskResults::Monitor { recent, samples_total } => {
            assert!(samples_total >= 2);
            match &recent[0] {
                MonitorSample::Processes(p) => {
                    assert_eq!(p.process_count, 2);
                    assert!(p.new_processes.is_empty());
                }
                other => panic!("unexpected sample: {other:?}"),
            }
        }
        other => panic!("unexpected results: {other:?}"),
    }
}

#[tokio::test]
async fn cancel_interrupts_monitor_sleep() {
    let engine = engine_with(Arc::new(MemoryStore::new()));
    let source = FixedMetrics {
        cpu: 1.0,
        memory: 1.0,
        disk: 1.0,
        fail: false,
    };
    let id = engine
        .start_system_monitor_with(source, Duration::from_secs(60), ThresholdSet::default())
        .await
        .unwrap();
    wait_for(|| {
        let engine = &engine;
        async move {
            matches!(
                engine.snapshot(id).await.unwrap().results,
                TaskResults::Monitor { samples_total, .. } if samples_total >= 1
            )
        }
    })
    .await;

    engine.cancel(id).await.unwrap();
    let view = tokio::time::timeout(Duration::from_secs(2), engine.wait(id))
        .await
        .expect("monitor did not stop promptly")
        .unwrap();
    assert_eq!(view.state, TaskState::Cancelled);
}

#[tokio::test]
async fn shutdown_cancels_live_jobs() {
    let engine = engine_with(Arc::new(MemoryStore::new()));
    let source = FixedMetrics {
        cpu: 1.0,
        memory: 1.0,
        disk: 1.0,
        fail: false,
    };
    let monitor = engine
        .start_system_monitor_with(source, Duration::from_secs(1), ThresholdSet::default())
        .await
        .unwrap();
    let scan = engine
        .start_port_scan_with(
            Arc::new(SimulatedHost::new(&[]).with_delay(Duration::from_millis(5))),
            "sim.local",
            1,
            5000,
            TIMEOUT,
        )
        .await
        .unwrap();

    engine.shutdown().await;
    assert_eq!(engine.snapshot(monitor).await.unwrap().state, TaskState::Cancelled);
    assert_eq!(engine.snapshot(scan).await.unwrap().state, TaskState::Cancelled);
}
