//! Result and alert sinks.
//!
//! Tasks hand finished results to a [`Persistence`] implementation and fan
//! alerts out through an [`AlertHub`]. Both are called from the task's own
//! worker; failures are logged and never change task state.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::SinkError;
use crate::types::{Alert, JobId, ScanSummary, TaskKind};

pub type SessionId = u64;

/// Narrow write interface to the session/alert store.
pub trait Persistence: Send + Sync + 'static {
    fn create_session(
        &self,
        kind: TaskKind,
        target: &str,
        config: &serde_json::Value,
    ) -> Result<SessionId, SinkError>;

    fn append_scan_result(
        &self,
        session: SessionId,
        port: u16,
        service: &str,
        status: &str,
    ) -> Result<(), SinkError>;

    fn finalize_session(&self, session: SessionId, summary: &ScanSummary)
        -> Result<(), SinkError>;

    fn store_alert(&self, alert: &Alert) -> Result<(), SinkError>;
}

/// Receiver of alerts. Every subscriber of an [`AlertHub`] gets every alert.
pub trait AlertSink: Send + Sync + 'static {
    fn notify(&self, alert: &Alert) -> Result<(), SinkError>;
}

/// Fan-out of alerts to independent subscribers.
#[derive(Clone, Default)]
pub struct AlertHub {
    subscribers: Arc<RwLock<Vec<Arc<dyn AlertSink>>>>,
}

impl AlertHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, sink: Arc<dyn AlertSink>) {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sink);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Deliver `alert` to every subscriber. Returns how many accepted it.
    pub fn publish(&self, alert: &Alert) -> usize {
        warn!(
            job = %alert.job_id,
            severity = %alert.severity,
            category = %alert.category,
            "{}",
            alert.message
        );
        let subscribers = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut delivered = 0;
        for sink in subscribers {
            match sink.notify(alert) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(job = %alert.job_id, error = %e, "alert subscriber failed"),
            }
        }
        delivered
    }
}

impl std::fmt::Debug for AlertHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertHub")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Republishes alerts on a broadcast channel for UI or HTTP consumers.
#[derive(Debug, Clone)]
pub struct BroadcastAlertSink {
    tx: broadcast::Sender<Alert>,
}

impl BroadcastAlertSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.tx.subscribe()
    }
}

impl AlertSink for BroadcastAlertSink {
    fn notify(&self, alert: &Alert) -> Result<(), SinkError> {
        // No listeners is not an error.
        let _ = self.tx.send(alert.clone());
        Ok(())
    }
}

/// Stores every alert through a [`Persistence`] backend.
pub struct PersistAlerts(pub Arc<dyn Persistence>);

impl AlertSink for PersistAlerts {
    fn notify(&self, alert: &Alert) -> Result<(), SinkError> {
        self.0.store_alert(alert)
    }
}

/// Run a blocking sink call off the async worker threads. Errors are logged
/// and swallowed.
pub(crate) async fn run_blocking<T, F>(job: JobId, what: &'static str, f: F) -> Option<T>
where
    F: FnOnce() -> Result<T, SinkError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(v)) => Some(v),
        Ok(Err(e)) => {
            warn!(job = %job, error = %e, "{what} failed");
            None
        }
        Err(e) => {
            warn!(job = %job, error = %e, "{what} panicked");
            None
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub id: SessionId,
    pub kind: TaskKind,
    pub target: String,
    pub config: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub summary: Option<ScanSummary>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanResultRecord {
    pub session_id: SessionId,
    pub port: u16,
    pub service: String,
    pub status: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Dashboard counters over the stored sessions and alerts.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SessionStats {
    pub total_sessions: u64,
    pub scan_sessions: u64,
    pub monitor_sessions: u64,
    pub total_alerts: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_activity: Option<OffsetDateTime>,
}

/// History kept by a [`MemoryStore`] when no limits are given.
pub const DEFAULT_ALERT_HISTORY: usize = 500;
pub const DEFAULT_RESULT_HISTORY: usize = 1000;

#[derive(Debug, Default)]
struct MemoryInner {
    sessions: Vec<SessionRecord>,
    results: VecDeque<ScanResultRecord>,
    alerts: VecDeque<Alert>,
    alerts_total: u64,
}

/// In-process store; also the read side used by the HTTP API.
///
/// Alerts and scan results are kept in bounded windows, oldest evicted first.
/// `statistics` still counts every alert ever stored.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    max_alerts: usize,
    max_results: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_limits(DEFAULT_ALERT_HISTORY, DEFAULT_RESULT_HISTORY)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(max_alerts: usize, max_results: usize) -> Self {
        Self {
            inner: Mutex::new(MemoryInner::default()),
            max_alerts: max_alerts.max(1),
            max_results: max_results.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn sessions(&self) -> Vec<SessionRecord> {
        self.lock().sessions.clone()
    }

    /// Most recent sessions, newest first.
    pub fn recent_sessions(&self, limit: usize) -> Vec<SessionRecord> {
        self.lock().sessions.iter().rev().take(limit).cloned().collect()
    }

    pub fn session(&self, id: SessionId) -> Option<SessionRecord> {
        self.lock().sessions.iter().find(|s| s.id == id).cloned()
    }

    pub fn session_results(&self, id: SessionId) -> Vec<ScanResultRecord> {
        self.lock()
            .results
            .iter()
            .filter(|r| r.session_id == id)
            .cloned()
            .collect()
    }

    /// Most recent alerts, newest first.
    pub fn recent_alerts(&self, limit: usize) -> Vec<Alert> {
        self.lock().alerts.iter().rev().take(limit).cloned().collect()
    }

    pub fn statistics(&self) -> SessionStats {
        let inner = self.lock();
        let count = |f: fn(TaskKind) -> bool| inner.sessions.iter().filter(|s| f(s.kind)).count() as u64;
        SessionStats {
            total_sessions: inner.sessions.len() as u64,
            scan_sessions: count(|k| k == TaskKind::PortScan),
            monitor_sessions: count(TaskKind::is_monitor),
            total_alerts: inner.alerts_total,
            last_activity: inner.sessions.iter().map(|s| s.started_at).max(),
        }
    }

    fn insert_session(&self, record: SessionRecord) {
        self.lock().sessions.push(record);
    }
}

impl Persistence for MemoryStore {
    fn create_session(
        &self,
        kind: TaskKind,
        target: &str,
        config: &serde_json::Value,
    ) -> Result<SessionId, SinkError> {
        let mut inner = self.lock();
        let id = inner.sessions.iter().map(|s| s.id).max().unwrap_or(0) + 1;
        inner.sessions.push(SessionRecord {
            id,
            kind,
            target: target.to_string(),
            config: config.clone(),
            started_at: OffsetDateTime::now_utc(),
            summary: None,
        });
        Ok(id)
    }

    fn append_scan_result(
        &self,
        session: SessionId,
        port: u16,
        service: &str,
        status: &str,
    ) -> Result<(), SinkError> {
        let mut inner = self.lock();
        if !inner.sessions.iter().any(|s| s.id == session) {
            return Err(SinkError::UnknownSession(session));
        }
        if inner.results.len() == self.max_results {
            inner.results.pop_front();
        }
        inner.results.push_back(ScanResultRecord {
            session_id: session,
            port,
            service: service.to_string(),
            status: status.to_string(),
            timestamp: OffsetDateTime::now_utc(),
        });
        Ok(())
    }

    fn finalize_session(
        &self,
        session: SessionId,
        summary: &ScanSummary,
    ) -> Result<(), SinkError> {
        let mut inner = self.lock();
        let record = inner
            .sessions
            .iter_mut()
            .find(|s| s.id == session)
            .ok_or(SinkError::UnknownSession(session))?;
        record.summary = Some(summary.clone());
        Ok(())
    }

    fn store_alert(&self, alert: &Alert) -> Result<(), SinkError> {
        let mut inner = self.lock();
        if inner.alerts.len() == self.max_alerts {
            inner.alerts.pop_front();
        }
        inner.alerts.push_back(alert.clone());
        inner.alerts_total += 1;
        Ok(())
    }
}

/// Writes through to a primary store and mirrors every call into a
/// [`MemoryStore`], which keeps the primary's session ids.
pub struct TeeStore {
    primary: Arc<dyn Persistence>,
    mirror: Arc<MemoryStore>,
}

impl TeeStore {
    pub fn new(primary: Arc<dyn Persistence>, mirror: Arc<MemoryStore>) -> Self {
        Self { primary, mirror }
    }
}

impl Persistence for TeeStore {
    fn create_session(
        &self,
        kind: TaskKind,
        target: &str,
        config: &serde_json::Value,
    ) -> Result<SessionId, SinkError> {
        let id = self.primary.create_session(kind, target, config)?;
        self.mirror.insert_session(SessionRecord {
            id,
            kind,
            target: target.to_string(),
            config: config.clone(),
            started_at: OffsetDateTime::now_utc(),
            summary: None,
        });
        Ok(id)
    }

    fn append_scan_result(
        &self,
        session: SessionId,
        port: u16,
        service: &str,
        status: &str,
    ) -> Result<(), SinkError> {
        self.mirror.append_scan_result(session, port, service, status)?;
        self.primary.append_scan_result(session, port, service, status)
    }

    fn finalize_session(
        &self,
        session: SessionId,
        summary: &ScanSummary,
    ) -> Result<(), SinkError> {
        self.mirror.finalize_session(session, summary)?;
        self.primary.finalize_session(session, summary)
    }

    fn store_alert(&self, alert: &Alert) -> Result<(), SinkError> {
        self.mirror.store_alert(alert)?;
        self.primary.store_alert(alert)
    }
}

/// One line of a [`JsonlStore`] file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum StoreRecord {
    Session(SessionRecord),
    ScanResult(ScanResultRecord),
    SessionFinalized {
        session_id: SessionId,
        summary: ScanSummary,
    },
    Alert(Alert),
}

/// Append-only JSON-lines store. One record per call, flushed immediately.
#[derive(Debug)]
pub struct JsonlStore {
    path: PathBuf,
    file: Mutex<File>,
    next_session: AtomicU64,
}

impl JsonlStore {
    /// Open (or create) the store. Session ids continue after the highest id
    /// already present in the file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        let last_session = if path.exists() {
            Self::read_records(&path)?
                .iter()
                .filter_map(|r| match r {
                    StoreRecord::Session(s) => Some(s.id),
                    _ => None,
                })
                .max()
                .unwrap_or(0)
        } else {
            0
        };
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!(path = %path.display(), last_session, "opened jsonl store");
        Ok(Self {
            path,
            file: Mutex::new(file),
            next_session: AtomicU64::new(last_session + 1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record back. Malformed lines are skipped.
    pub fn read_records(path: impl AsRef<Path>) -> Result<Vec<StoreRecord>, SinkError> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let mut out = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(record) => out.push(record),
                Err(e) => debug!(error = %e, "skipping malformed store line"),
            }
        }
        Ok(out)
    }

    fn write(&self, record: &StoreRecord) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }
}

impl Persistence for JsonlStore {
    fn create_session(
        &self,
        kind: TaskKind,
        target: &str,
        config: &serde_json::Value,
    ) -> Result<SessionId, SinkError> {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        self.write(&StoreRecord::Session(SessionRecord {
            id,
            kind,
            target: target.to_string(),
            config: config.clone(),
            started_at: OffsetDateTime::now_utc(),
            summary: None,
        }))?;
        Ok(id)
    }

    fn append_scan_result(
        &self,
        session: SessionId,
        port: u16,
        service: &str,
        status: &str,
    ) -> Result<(), SinkError> {
        self.write(&StoreRecord::ScanResult(ScanResultRecord {
            session_id: session,
            port,
            service: service.to_string(),
            status: status.to_string(),
            timestamp: OffsetDateTime::now_utc(),
        }))
    }

    fn finalize_session(
        &self,
        session: SessionId,
        summary: &ScanSummary,
    ) -> Result<(), SinkError> {
        self.write(&StoreRecord::SessionFinalized {
            session_id: session,
            summary: summary.clone(),
        })
    }

    fn store_alert(&self, alert: &Alert) -> Result<(), SinkError> {
        self.write(&StoreRecord::Alert(alert.clone()))
    }
}
