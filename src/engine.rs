//! Task engine: validates requests, registers jobs and spawns their workers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{validate_interval, validate_thresholds, EngineConfig};
use crate::error::{EngineError, Result};
use crate::monitor::{self, MonitorJob};
use crate::ports::validate_range;
use crate::registry::JobRegistry;
use crate::sampler::{MetricsSource, PortProber, ProcessSource, SysinfoSource, TcpProber};
use crate::scan::{self, ScanJob};
use crate::sink::{AlertHub, Persistence};
use crate::types::{JobId, JobStatus, ScanTarget, TaskKind, TaskView, ThresholdSet};

/// Collaborators shared by every worker.
#[derive(Clone)]
pub(crate) struct TaskContext {
    pub registry: Arc<JobRegistry>,
    pub persistence: Arc<dyn Persistence>,
    pub alerts: AlertHub,
}

pub struct Engine {
    ctx: TaskContext,
    config: EngineConfig,
    workers: Mutex<HashMap<JobId, JoinHandle<()>>>,
}

impl Engine {
    pub fn new(config: EngineConfig, persistence: Arc<dyn Persistence>) -> Self {
        Self::with_alerts(config, persistence, AlertHub::new())
    }

    pub fn with_alerts(
        config: EngineConfig,
        persistence: Arc<dyn Persistence>,
        alerts: AlertHub,
    ) -> Self {
        let registry = Arc::new(JobRegistry::new(config.history_limit));
        Self {
            ctx: TaskContext {
                registry,
                persistence,
                alerts,
            },
            config,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.ctx.registry
    }

    pub fn alerts(&self) -> &AlertHub {
        &self.ctx.alerts
    }

    /// Start a TCP connect scan of `start..=end` on `target`.
    pub async fn start_port_scan(
        &self,
        target: &str,
        start: u16,
        end: u16,
        timeout: Duration,
    ) -> Result<JobId> {
        self.start_port_scan_with(Arc::new(TcpProber), target, start, end, timeout)
            .await
    }

    pub async fn start_port_scan_with<P: PortProber>(
        &self,
        prober: Arc<P>,
        target: &str,
        start: u16,
        end: u16,
        timeout: Duration,
    ) -> Result<JobId> {
        let host = target.trim();
        if host.is_empty() {
            return Err(EngineError::InvalidArgument("target must not be empty".into()));
        }
        validate_range(start, end)?;
        if timeout.is_zero() {
            return Err(EngineError::InvalidArgument("timeout must be > 0".into()));
        }

        let target = ScanTarget {
            host: host.to_string(),
            start_port: start,
            end_port: end,
        };
        let (id, cancel) = self
            .ctx
            .registry
            .create(TaskKind::PortScan, Some(target.clone()))
            .await;
        info!(job = %id, host, start, end, ?timeout, "port scan started");

        let job = ScanJob {
            id,
            target,
            timeout,
            cancel,
        };
        let handle = tokio::spawn(scan::run(self.ctx.clone(), prober, job));
        self.workers.lock().await.insert(id, handle);
        Ok(id)
    }

    /// Start a system or process monitor backed by sysinfo.
    pub async fn start_monitor(
        &self,
        kind: TaskKind,
        interval: Duration,
        thresholds: ThresholdSet,
    ) -> Result<JobId> {
        match kind {
            TaskKind::SystemMonitor => {
                self.start_system_monitor_with(SysinfoSource::new(), interval, thresholds)
                    .await
            }
            TaskKind::ProcessMonitor => {
                self.start_process_monitor_with(SysinfoSource::new(), interval)
                    .await
            }
            TaskKind::PortScan => Err(EngineError::InvalidArgument(
                "port_scan is not a monitor kind".into(),
            )),
        }
    }

    pub async fn start_system_monitor_with<S: MetricsSource>(
        &self,
        source: S,
        interval: Duration,
        thresholds: ThresholdSet,
    ) -> Result<JobId> {
        validate_thresholds(&thresholds)?;
        let job = self
            .monitor_job(TaskKind::SystemMonitor, interval, thresholds)
            .await?;
        let id = job.id;
        let handle = tokio::spawn(monitor::run_system(self.ctx.clone(), source, job));
        self.workers.lock().await.insert(id, handle);
        Ok(id)
    }

    pub async fn start_process_monitor_with<S: ProcessSource>(
        &self,
        source: S,
        interval: Duration,
    ) -> Result<JobId> {
        let job = self
            .monitor_job(TaskKind::ProcessMonitor, interval, self.config.thresholds)
            .await?;
        let id = job.id;
        let handle = tokio::spawn(monitor::run_processes(self.ctx.clone(), source, job));
        self.workers.lock().await.insert(id, handle);
        Ok(id)
    }

    async fn monitor_job(
        &self,
        kind: TaskKind,
        interval: Duration,
        thresholds: ThresholdSet,
    ) -> Result<MonitorJob> {
        validate_interval(interval)?;
        let (id, cancel) = self.ctx.registry.create(kind, None).await;
        info!(job = %id, %kind, ?interval, "monitor started");
        Ok(MonitorJob {
            id,
            kind,
            interval,
            thresholds,
            keywords: self.config.suspicious_keywords.clone(),
            cancel,
        })
    }

    /// Cancel a job. Idempotent; unknown ids are `NotFound`.
    pub async fn cancel(&self, id: JobId) -> Result<bool> {
        let changed = self.ctx.registry.cancel(id).await?;
        if changed {
            info!(job = %id, "cancellation requested");
        }
        Ok(changed)
    }

    pub async fn status(&self, id: JobId) -> Result<JobStatus> {
        self.ctx
            .registry
            .status(id)
            .await
            .ok_or(EngineError::NotFound(id))
    }

    pub async fn snapshot(&self, id: JobId) -> Result<TaskView> {
        self.ctx
            .registry
            .snapshot(id)
            .await
            .ok_or(EngineError::NotFound(id))
    }

    pub async fn list(&self) -> Vec<TaskView> {
        self.ctx.registry.list().await
    }

    /// Wait for the job's worker to exit and return its final view.
    pub async fn wait(&self, id: JobId) -> Result<TaskView> {
        let handle = self.workers.lock().await.remove(&id);
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(job = %id, error = %e, "worker did not exit cleanly");
            }
        }
        self.snapshot(id).await
    }

    /// Drop finished jobs older than the configured ttl.
    pub async fn purge_expired(&self) -> usize {
        let purged = self.ctx.registry.purge_expired(self.config.job_ttl()).await;
        if purged > 0 {
            info!(purged, "expired jobs removed");
        }
        let mut workers = self.workers.lock().await;
        workers.retain(|_, h| !h.is_finished());
        purged
    }

    /// Cancel every live job and wait for all workers.
    pub async fn shutdown(&self) {
        let cancelled = self.ctx.registry.cancel_all().await;
        info!(cancelled, "shutting down engine");
        let handles: Vec<_> = self.workers.lock().await.drain().collect();
        for (id, handle) in handles {
            if let Err(e) = handle.await {
                warn!(job = %id, error = %e, "worker did not exit cleanly");
            }
        }
    }
}
