//! Leaf samplers: one unit of probing work per call.
//!
//! A port scan repeats [`PortProber::probe`]; the monitors repeat
//! [`MetricsSource::sample`] or [`ProcessSource::processes`]. The traits exist
//! so tasks can be driven by simulated hosts in tests.

use std::future::Future;
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use sysinfo::{Disks, ProcessesToUpdate, System};
use time::OffsetDateTime;
use tokio::net::TcpStream;

use crate::error::EngineError;
use crate::types::{MetricsSnapshot, ProcessInfo};

/// Classification of a single connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Open,
    /// The host actively refused the connection.
    Closed,
    /// Timeout, unreachable or any other transient failure.
    Error(String),
}

pub trait PortProber: Send + Sync + 'static {
    /// Resolve the scan target once, before any port is probed.
    fn resolve(&self, host: &str) -> impl Future<Output = Result<IpAddr, EngineError>> + Send;

    fn probe(
        &self,
        addr: IpAddr,
        port: u16,
        timeout: Duration,
    ) -> impl Future<Output = ProbeOutcome> + Send;
}

/// Plain TCP connect prober.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProber;

impl PortProber for TcpProber {
    async fn resolve(&self, host: &str) -> Result<IpAddr, EngineError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }
        let resolution_error = |reason: String| EngineError::HostResolution {
            host: host.to_string(),
            reason,
        };
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|e| resolution_error(e.to_string()))?
            .collect();
        // Prefer IPv4.
        addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .map(SocketAddr::ip)
            .ok_or_else(|| resolution_error("no addresses returned".into()))
    }

    async fn probe(&self, addr: IpAddr, port: u16, timeout: Duration) -> ProbeOutcome {
        let target = SocketAddr::new(addr, port);
        match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
            // Stream dropped here; the socket is closed before we return.
            Ok(Ok(_stream)) => ProbeOutcome::Open,
            Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => ProbeOutcome::Closed,
            Ok(Err(e)) => ProbeOutcome::Error(e.to_string()),
            Err(_) => ProbeOutcome::Error(format!("timed out after {timeout:?}")),
        }
    }
}

/// Source of system metrics snapshots. Called on a blocking thread.
pub trait MetricsSource: Send + 'static {
    fn sample(&mut self) -> Result<MetricsSnapshot>;
}

/// Source of the current process list. Called on a blocking thread.
pub trait ProcessSource: Send + 'static {
    fn processes(&mut self) -> Result<Vec<ProcessInfo>>;
}

/// sysinfo-backed implementation of both monitor sources.
pub struct SysinfoSource {
    system: System,
    disks: Disks,
    cpu_primed: bool,
}

impl SysinfoSource {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            disks: Disks::new_with_refreshed_list(),
            cpu_primed: false,
        }
    }

    fn cpu_percent(&mut self) -> f32 {
        self.system.refresh_cpu_usage();
        if !self.cpu_primed {
            // CPU usage is a delta between two refreshes.
            std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
            self.system.refresh_cpu_usage();
            self.cpu_primed = true;
        }
        self.system.global_cpu_usage()
    }

    fn memory_percent(&mut self) -> f32 {
        self.system.refresh_memory();
        percent(self.system.used_memory(), self.system.total_memory())
    }

    /// Usage of the root filesystem, or of all disks combined when there is no `/` mount.
    fn disk_percent(&mut self) -> f32 {
        self.disks.refresh(true);
        let list = self.disks.list();
        let root = list.iter().find(|d| d.mount_point() == Path::new("/"));
        let (total, available) = match root {
            Some(d) => (d.total_space(), d.available_space()),
            None => list.iter().fold((0u64, 0u64), |(t, a), d| {
                (t + d.total_space(), a + d.available_space())
            }),
        };
        percent(total.saturating_sub(available), total)
    }
}

impl Default for SysinfoSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSource for SysinfoSource {
    fn sample(&mut self) -> Result<MetricsSnapshot> {
        let cpu_percent = self.cpu_percent();
        let memory_percent = self.memory_percent();
        let disk_percent = self.disk_percent();
        self.system.refresh_processes(ProcessesToUpdate::All, true);
        Ok(MetricsSnapshot {
            cpu_percent,
            memory_percent,
            disk_percent,
            connection_count: connection_count(),
            process_count: self.system.processes().len() as u64,
            timestamp: OffsetDateTime::now_utc(),
        })
    }
}

impl ProcessSource for SysinfoSource {
    fn processes(&mut self) -> Result<Vec<ProcessInfo>> {
        self.system.refresh_processes(ProcessesToUpdate::All, true);
        Ok(self
            .system
            .processes()
            .iter()
            .map(|(pid, p)| ProcessInfo {
                pid: pid.as_u32(),
                name: p.name().to_string_lossy().into_owned(),
            })
            .collect())
    }
}

fn percent(used: u64, total: u64) -> f32 {
    if total == 0 {
        0.0
    } else {
        (used as f64 / total as f64 * 100.0) as f32
    }
}

/// Number of TCP sockets known to the kernel.
#[cfg(target_os = "linux")]
fn connection_count() -> u64 {
    ["/proc/net/tcp", "/proc/net/tcp6"]
        .iter()
        .filter_map(|p| std::fs::read_to_string(p).ok())
        .map(|content| content.lines().skip(1).filter(|l| !l.trim().is_empty()).count() as u64)
        .sum()
}

#[cfg(not(target_os = "linux"))]
fn connection_count() -> u64 {
    0
}
