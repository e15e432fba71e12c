//! System and process monitor workers.
//!
//! Monitors never complete on their own: they tick until cancelled. Sampling
//! runs on the blocking pool and the inter-tick sleep races the cancellation
//! token, so a cancel takes effect without waiting out the interval.

use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use time::OffsetDateTime;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::TaskContext;
use crate::sampler::{MetricsSource, ProcessSource};
use crate::sink::{run_blocking, SessionId};
use crate::thresholds::{self, ProcessWatch};
use crate::types::{
    Alert, JobId, MetricsSnapshot, MonitorSample, ProcessInfo, ProcessSnapshot, ScanSummary,
    Severity, TaskKind, TaskResults, TaskState, ThresholdSet,
};

pub(crate) struct MonitorJob {
    pub id: JobId,
    pub kind: TaskKind,
    pub interval: Duration,
    /// Copied at start; later config changes do not reach a running monitor.
    pub thresholds: ThresholdSet,
    pub keywords: Vec<String>,
    pub cancel: CancellationToken,
}

pub(crate) async fn run_system<S: MetricsSource>(ctx: TaskContext, source: S, job: MonitorJob) {
    let session = start(&ctx, &job).await;
    let mut source = source;
    let mut failure = None;

    while !job.cancel.is_cancelled() {
        let (returned, sampled) = match sample_blocking(source, |s| s.sample()).await {
            Ok(v) => v,
            Err(e) => {
                failure = Some(format!("metrics sampler panicked: {e}"));
                break;
            }
        };
        source = returned;
        if job.cancel.is_cancelled() {
            break;
        }

        let alerts = match sampled {
            Ok(snapshot) => match record_metrics(&ctx, &job, snapshot).await {
                Some(alerts) => alerts,
                None => break,
            },
            Err(e) => {
                warn!(job = %job.id, error = %e, "metrics sampling failed");
                vec![Alert::new(
                    job.id,
                    Severity::Medium,
                    "Monitor",
                    format!("Monitoring error: {e}"),
                )]
            }
        };
        publish(&ctx, job.id, alerts).await;

        if !sleep_or_cancel(&job.cancel, job.interval).await {
            break;
        }
    }

    finish(&ctx, &job, session, failure).await;
}

pub(crate) async fn run_processes<S: ProcessSource>(
    ctx: TaskContext,
    source: S,
    job: MonitorJob,
) {
    let session = start(&ctx, &job).await;
    let mut source = source;
    let mut watch = ProcessWatch::new(&job.keywords);
    let mut failure = None;

    while !job.cancel.is_cancelled() {
        let (returned, sampled) = match sample_blocking(source, |s| s.processes()).await {
            Ok(v) => v,
            Err(e) => {
                failure = Some(format!("process sampler panicked: {e}"));
                break;
            }
        };
        source = returned;
        if job.cancel.is_cancelled() {
            break;
        }

        match sampled {
            Ok(processes) => match record_processes(&ctx, &job, &mut watch, &processes).await {
                Some(alerts) => publish(&ctx, job.id, alerts).await,
                None => break,
            },
            Err(e) => warn!(job = %job.id, error = %e, "process sampling failed"),
        }

        if !sleep_or_cancel(&job.cancel, job.interval).await {
            break;
        }
    }

    finish(&ctx, &job, session, failure).await;
}

/// Store a metrics sample and evaluate it. `None` once the registry no longer
/// accepts samples for the job; the tick's alerts are discarded with it.
async fn record_metrics(
    ctx: &TaskContext,
    job: &MonitorJob,
    snapshot: MetricsSnapshot,
) -> Option<Vec<Alert>> {
    debug!(
        job = %job.id,
        cpu = snapshot.cpu_percent,
        memory = snapshot.memory_percent,
        disk = snapshot.disk_percent,
        "metrics sampled"
    );
    let alerts = thresholds::evaluate(job.id, &snapshot, &job.thresholds);
    ctx.registry
        .push_sample(job.id, MonitorSample::Metrics(snapshot))
        .await
        .then_some(alerts)
}

async fn record_processes(
    ctx: &TaskContext,
    job: &MonitorJob,
    watch: &mut ProcessWatch,
    processes: &[ProcessInfo],
) -> Option<Vec<Alert>> {
    let fresh = watch.observe(processes);
    let alerts = watch.alerts_for(job.id, &fresh);
    debug!(
        job = %job.id,
        total = processes.len(),
        new = fresh.len(),
        "process list sampled"
    );
    let snapshot = ProcessSnapshot {
        process_count: processes.len() as u64,
        new_processes: fresh,
        timestamp: OffsetDateTime::now_utc(),
    };
    ctx.registry
        .push_sample(job.id, MonitorSample::Processes(snapshot))
        .await
        .then_some(alerts)
}

/// Run one sampling call on the blocking pool, handing the source back.
async fn sample_blocking<S, T, F>(mut source: S, f: F) -> Result<(S, Result<T>), JoinError>
where
    S: Send + 'static,
    T: Send + 'static,
    F: FnOnce(&mut S) -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let out = f(&mut source);
        (source, out)
    })
    .await
}

/// Returns `false` when cancelled during the wait.
async fn sleep_or_cancel(cancel: &CancellationToken, interval: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(interval) => true,
    }
}

async fn publish(ctx: &TaskContext, id: JobId, alerts: Vec<Alert>) {
    if alerts.is_empty() {
        return;
    }
    let hub = ctx.alerts.clone();
    run_blocking(id, "publish alerts", move || {
        for alert in &alerts {
            hub.publish(alert);
        }
        Ok(())
    })
    .await;
}

async fn start(ctx: &TaskContext, job: &MonitorJob) -> Option<SessionId> {
    ctx.registry.mark_running(job.id).await;
    let persistence = ctx.persistence.clone();
    let kind = job.kind;
    let config = json!({
        "interval_ms": job.interval.as_millis() as u64,
        "thresholds": job.thresholds,
    });
    run_blocking(job.id, "create session", move || {
        persistence.create_session(kind, "localhost", &config)
    })
    .await
}

async fn finish(
    ctx: &TaskContext,
    job: &MonitorJob,
    session: Option<SessionId>,
    failure: Option<String>,
) {
    match failure {
        Some(reason) => {
            error!(job = %job.id, %reason, "monitor failed");
            ctx.registry
                .complete(job.id, TaskState::Failed, Some(reason))
                .await;
        }
        None => {
            ctx.registry
                .complete(job.id, TaskState::Cancelled, None)
                .await;
        }
    }

    let view = ctx.registry.snapshot(job.id).await;
    let samples_total = match view.as_ref().map(|v| &v.results) {
        Some(TaskResults::Monitor { samples_total, .. }) => *samples_total,
        _ => 0,
    };
    let state = view.as_ref().map(|v| v.state).unwrap_or(TaskState::Cancelled);
    info!(job = %job.id, kind = %job.kind, %state, samples_total, "monitor stopped");

    if let Some(session) = session {
        let summary = ScanSummary {
            kind: job.kind,
            target: None,
            state,
            open_ports: Vec::new(),
            samples_total,
            error: view.and_then(|v| v.error),
            finished_at: OffsetDateTime::now_utc(),
        };
        let persistence = ctx.persistence.clone();
        run_blocking(job.id, "finalize session", move || {
            persistence.finalize_session(session, &summary)
        })
        .await;
    }
}
