use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Opaque job identifier, unique for the lifetime of the process.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(into = "String", try_from = "String")]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let n = s.strip_prefix("job-").unwrap_or(s);
        n.parse::<u64>()
            .map(JobId)
            .map_err(|_| format!("invalid job id: {s}"))
    }
}

impl From<JobId> for String {
    fn from(id: JobId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for JobId {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    PortScan,
    SystemMonitor,
    ProcessMonitor,
}

impl TaskKind {
    pub fn is_monitor(self) -> bool {
        !matches!(self, TaskKind::PortScan)
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskKind::PortScan => "port_scan",
            TaskKind::SystemMonitor => "system_monitor",
            TaskKind::ProcessMonitor => "process_monitor",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Cancelled | TaskState::Failed
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Cancelled => "cancelled",
            TaskState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Host plus inclusive port range of a port scan.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanTarget {
    pub host: String,
    pub start_port: u16,
    pub end_port: u16,
}

impl ScanTarget {
    pub fn port_count(&self) -> u64 {
        u64::from(self.end_port) - u64::from(self.start_port) + 1
    }
}

/// One open port discovered by a scan.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanHit {
    pub port: u16,
    pub service: String,
    #[serde(with = "time::serde::rfc3339")]
    pub discovered_at: OffsetDateTime,
}

/// One system monitor tick.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub disk_percent: f32,
    pub connection_count: u64,
    pub process_count: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
}

/// One process monitor tick: how many processes were seen and which ones are new.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProcessSnapshot {
    pub process_count: u64,
    pub new_processes: Vec<ProcessInfo>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorSample {
    Metrics(MetricsSnapshot),
    Processes(ProcessSnapshot),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        };
        f.pad(s)
    }
}

/// An alert raised by a task. Never mutated after emission.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub job_id: JobId,
    pub severity: Severity,
    pub category: String,
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl Alert {
    pub fn new(
        job_id: JobId,
        severity: Severity,
        category: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            job_id,
            severity,
            category: category.into(),
            message: message.into(),
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

/// Alert limits for the system monitor. Copied into a task when it starts.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct ThresholdSet {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub disk_percent: f32,
}

impl Default for ThresholdSet {
    fn default() -> Self {
        Self {
            cpu_percent: 80.0,
            memory_percent: 85.0,
            disk_percent: 90.0,
        }
    }
}

/// Accumulated results of a task.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskResults {
    Scan {
        hits: Vec<ScanHit>,
    },
    Monitor {
        /// Most recent samples, oldest first.
        recent: Vec<MonitorSample>,
        samples_total: u64,
    },
}

/// Immutable copy of a task as seen by an observer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TaskView {
    pub id: JobId,
    pub kind: TaskKind,
    pub target: Option<ScanTarget>,
    pub state: TaskState,
    pub progress: u8,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    pub error: Option<String>,
    pub results: TaskResults,
}

impl TaskView {
    pub fn open_ports(&self) -> Vec<u16> {
        match &self.results {
            TaskResults::Scan { hits } => hits.iter().map(|h| h.port).collect(),
            TaskResults::Monitor { .. } => Vec::new(),
        }
    }

    pub fn last_sample(&self) -> Option<&MonitorSample> {
        match &self.results {
            TaskResults::Monitor { recent, .. } => recent.last(),
            TaskResults::Scan { .. } => None,
        }
    }
}

/// Compact status returned to polling clients.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JobStatus {
    pub job_id: JobId,
    pub kind: TaskKind,
    pub state: TaskState,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_ports: Option<Vec<u16>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_snapshot: Option<MonitorSample>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&TaskView> for JobStatus {
    fn from(view: &TaskView) -> Self {
        let (open_ports, last_snapshot) = match view.kind {
            TaskKind::PortScan => (Some(view.open_ports()), None),
            _ => (None, view.last_sample().cloned()),
        };
        Self {
            job_id: view.id,
            kind: view.kind,
            state: view.state,
            progress: view.progress,
            open_ports,
            last_snapshot,
            error: view.error.clone(),
        }
    }
}

/// Summary handed to persistence when a task reaches a terminal state.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScanSummary {
    pub kind: TaskKind,
    pub target: Option<ScanTarget>,
    pub state: TaskState,
    pub open_ports: Vec<u16>,
    pub samples_total: u64,
    pub error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
}
