//! Port scan worker.
//!
//! Ports are probed strictly in ascending order, one at a time, so discovered
//! hits are already sorted. Progress is published after every attempt.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::engine::TaskContext;
use crate::error::EngineError;
use crate::ports::service_label;
use crate::sampler::{PortProber, ProbeOutcome};
use crate::sink::{run_blocking, SessionId};
use crate::types::{JobId, ScanHit, ScanSummary, ScanTarget, TaskKind, TaskState};

pub(crate) struct ScanJob {
    pub id: JobId,
    pub target: ScanTarget,
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

enum ScanEnd {
    Exhausted,
    Cancelled,
}

pub(crate) async fn run<P: PortProber>(ctx: TaskContext, prober: Arc<P>, job: ScanJob) {
    let id = job.id;
    if !ctx.registry.mark_running(id).await {
        // Cancelled before the worker got scheduled.
        debug!(job = %id, "scan cancelled before start");
    }

    let session = {
        let persistence = ctx.persistence.clone();
        let host = job.target.host.clone();
        let config = json!({
            "start_port": job.target.start_port,
            "end_port": job.target.end_port,
            "timeout_ms": job.timeout.as_millis() as u64,
        });
        run_blocking(id, "create session", move || {
            persistence.create_session(TaskKind::PortScan, &host, &config)
        })
        .await
    };

    let mut open_ports = Vec::new();
    let outcome = scan_range(&ctx, prober.as_ref(), &job, session, &mut open_ports).await;
    let (state, error) = match outcome {
        Ok(ScanEnd::Exhausted) => (TaskState::Completed, None),
        Ok(ScanEnd::Cancelled) => (TaskState::Cancelled, None),
        Err(e) => {
            error!(job = %id, error = %e, "port scan failed");
            (TaskState::Failed, Some(e.to_string()))
        }
    };

    ctx.registry.complete(id, state, error).await;
    // The registry decides the final state: a cancel may have won the race.
    let view = ctx.registry.snapshot(id).await;
    let final_state = view.as_ref().map(|v| v.state).unwrap_or(state);
    info!(
        job = %id,
        state = %final_state,
        open = open_ports.len(),
        "port scan finished"
    );

    if let Some(session) = session {
        let summary = ScanSummary {
            kind: TaskKind::PortScan,
            target: Some(job.target.clone()),
            state: final_state,
            open_ports,
            samples_total: 0,
            error: view.and_then(|v| v.error),
            finished_at: OffsetDateTime::now_utc(),
        };
        let persistence = ctx.persistence.clone();
        run_blocking(id, "finalize session", move || {
            persistence.finalize_session(session, &summary)
        })
        .await;
    }
}

async fn scan_range<P: PortProber>(
    ctx: &TaskContext,
    prober: &P,
    job: &ScanJob,
    session: Option<SessionId>,
    open_ports: &mut Vec<u16>,
) -> Result<ScanEnd, EngineError> {
    let ScanJob {
        id,
        target,
        timeout,
        cancel,
    } = job;
    let id = *id;

    if cancel.is_cancelled() {
        return Ok(ScanEnd::Cancelled);
    }
    // Resolution failure is not port specific and aborts the whole scan.
    let addr = prober.resolve(&target.host).await?;
    debug!(job = %id, %addr, "target resolved");

    let total = target.port_count();
    let mut scanned = 0u64;

    for port in target.start_port..=target.end_port {
        if cancel.is_cancelled() {
            return Ok(ScanEnd::Cancelled);
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(ScanEnd::Cancelled),
            outcome = prober.probe(addr, port, *timeout) => outcome,
        };

        scanned += 1;
        let progress = (scanned * 100 / total) as u8;

        match outcome {
            ProbeOutcome::Open => {
                let service = service_label(port);
                let hit = ScanHit {
                    port,
                    service: service.to_string(),
                    discovered_at: OffsetDateTime::now_utc(),
                };
                if !ctx.registry.append_hit(id, hit, progress).await {
                    return Ok(ScanEnd::Cancelled);
                }
                open_ports.push(port);
                info!(job = %id, port, service, "open port");
                if let Some(session) = session {
                    let persistence = ctx.persistence.clone();
                    run_blocking(id, "store scan result", move || {
                        persistence.append_scan_result(session, port, service, "open")
                    })
                    .await;
                }
            }
            ProbeOutcome::Closed => {
                trace!(job = %id, port, "closed");
                ctx.registry.set_progress(id, progress).await;
            }
            ProbeOutcome::Error(reason) => {
                // Reported as closed; only the log keeps the distinction.
                debug!(job = %id, port, %reason, "probe failed");
                ctx.registry.set_progress(id, progress).await;
            }
        }
    }

    Ok(ScanEnd::Exhausted)
}
