//! Alert rules: metric thresholds for the system monitor and the new-process
//! heuristic for the process monitor.

use std::collections::HashSet;

use crate::types::{Alert, JobId, MetricsSnapshot, ProcessInfo, Severity, ThresholdSet};

/// Map a snapshot to one alert per metric that strictly exceeds its limit.
pub fn evaluate(job_id: JobId, snapshot: &MetricsSnapshot, limits: &ThresholdSet) -> Vec<Alert> {
    let checks = [
        ("CPU", snapshot.cpu_percent, limits.cpu_percent, Severity::High),
        ("Memory", snapshot.memory_percent, limits.memory_percent, Severity::High),
        ("Disk", snapshot.disk_percent, limits.disk_percent, Severity::Critical),
    ];
    checks
        .into_iter()
        .filter(|&(_, value, limit, _)| value > limit)
        .map(|(category, value, _, severity)| {
            Alert::new(
                job_id,
                severity,
                category,
                format!("{category} usage critical: {value:.1}%"),
            )
        })
        .collect()
}

/// Remembers the previous tick's pids and flags suspicious newcomers.
#[derive(Debug, Clone)]
pub struct ProcessWatch {
    keywords: Vec<String>,
    known: Option<HashSet<u32>>,
}

impl ProcessWatch {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| k.as_ref().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
            known: None,
        }
    }

    pub fn is_suspicious(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        self.keywords.iter().any(|k| name.contains(k.as_str()))
    }

    /// Record a new tick. Returns processes not seen on the previous tick; the
    /// first tick only establishes the baseline and returns nothing.
    pub fn observe(&mut self, processes: &[ProcessInfo]) -> Vec<ProcessInfo> {
        let current: HashSet<u32> = processes.iter().map(|p| p.pid).collect();
        let fresh = match &self.known {
            None => Vec::new(),
            Some(known) => processes
                .iter()
                .filter(|p| !known.contains(&p.pid))
                .cloned()
                .collect(),
        };
        self.known = Some(current);
        fresh
    }

    /// One HIGH alert per suspicious process among `fresh`.
    pub fn alerts_for(&self, job_id: JobId, fresh: &[ProcessInfo]) -> Vec<Alert> {
        fresh
            .iter()
            .filter(|p| self.is_suspicious(&p.name))
            .map(|p| {
                Alert::new(
                    job_id,
                    Severity::High,
                    "Process",
                    format!("Suspicious: {} - New process detected", p.name),
                )
            })
            .collect()
    }
}
