use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::types::ThresholdSet;

const MIN_INTERVAL_SECS: u64 = 1;
const MAX_INTERVAL_SECS: u64 = 60;
const MAX_JOB_TTL_SECS: u64 = 30 * 24 * 3600;

/// Engine settings. Every field has a default so a TOML file only needs the
/// keys it wants to change.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Per-port connect timeout.
    pub scan_timeout_ms: u64,
    pub default_start_port: u16,
    pub default_end_port: u16,
    pub monitor_interval_secs: u64,
    pub process_interval_secs: u64,
    pub thresholds: ThresholdSet,
    /// Lowercase fragments that mark a newly started process as suspicious.
    pub suspicious_keywords: Vec<String>,
    /// Monitor samples kept per job.
    pub history_limit: usize,
    /// How long finished jobs stay queryable.
    pub job_ttl_secs: u64,
    pub alert_buffer: usize,
    /// Alerts kept by the in-process store behind the HTTP API.
    pub alert_history_limit: usize,
    /// Scan results kept by the in-process store.
    pub result_history_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 1000,
            default_start_port: 1,
            default_end_port: 1000,
            monitor_interval_secs: 5,
            process_interval_secs: 10,
            thresholds: ThresholdSet::default(),
            suspicious_keywords: [
                "hack", "crack", "exploit", "backdoor", "keylog", "trojan", "malware", "virus",
                "rootkit",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            history_limit: 120,
            job_ttl_secs: 3600,
            alert_buffer: 256,
            alert_history_limit: 500,
            result_history_limit: 1000,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(s).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// Load from `path` when given, otherwise fall back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::from_file(p),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        if self.scan_timeout_ms == 0 {
            errors.push("scan_timeout_ms must be > 0".to_string());
        }
        if self.default_start_port == 0 {
            errors.push("default_start_port must be >= 1".to_string());
        }
        if self.default_start_port > self.default_end_port {
            errors.push("default_start_port must be <= default_end_port".to_string());
        }
        for (name, secs) in [
            ("monitor_interval_secs", self.monitor_interval_secs),
            ("process_interval_secs", self.process_interval_secs),
        ] {
            if !(MIN_INTERVAL_SECS..=MAX_INTERVAL_SECS).contains(&secs) {
                errors.push(format!(
                    "{name} must be between {MIN_INTERVAL_SECS} and {MAX_INTERVAL_SECS}"
                ));
            }
        }
        if let Err(e) = validate_thresholds(&self.thresholds) {
            errors.push(e.to_string());
        }
        if self.job_ttl_secs > MAX_JOB_TTL_SECS {
            errors.push(format!("job_ttl_secs must be <= {MAX_JOB_TTL_SECS}"));
        }
        for (name, limit) in [
            ("history_limit", self.history_limit),
            ("alert_history_limit", self.alert_history_limit),
            ("result_history_limit", self.result_history_limit),
        ] {
            if limit == 0 {
                errors.push(format!("{name} must be > 0"));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Config(errors.join("; ")))
        }
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn process_interval(&self) -> Duration {
        Duration::from_secs(self.process_interval_secs)
    }

    pub fn job_ttl(&self) -> Duration {
        Duration::from_secs(self.job_ttl_secs)
    }
}

/// Monitor intervals must lie between 1 and 60 seconds.
pub fn validate_interval(interval: Duration) -> Result<()> {
    let min = Duration::from_secs(MIN_INTERVAL_SECS);
    let max = Duration::from_secs(MAX_INTERVAL_SECS);
    if interval < min || interval > max {
        return Err(EngineError::InvalidArgument(format!(
            "interval must be between {MIN_INTERVAL_SECS}s and {MAX_INTERVAL_SECS}s, got {interval:?}"
        )));
    }
    Ok(())
}

/// Every limit must lie in (0, 100].
pub fn validate_thresholds(t: &ThresholdSet) -> Result<()> {
    for (name, v) in [
        ("cpu", t.cpu_percent),
        ("memory", t.memory_percent),
        ("disk", t.disk_percent),
    ] {
        if !(v > 0.0 && v <= 100.0) {
            return Err(EngineError::InvalidArgument(format!(
                "{name} threshold must be between 0 and 100, got {v}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let c = EngineConfig::default();
        c.validate().unwrap();
        assert_eq!(c.thresholds.cpu_percent, 80.0);
        assert_eq!(c.scan_timeout(), Duration::from_secs(1));
        assert!(c.suspicious_keywords.iter().any(|k| k == "keylog"));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let c = EngineConfig::from_toml_str(
            r#"
            monitor_interval_secs = 2
            [thresholds]
            cpu_percent = 50.0
            "#,
        )
        .unwrap();
        assert_eq!(c.monitor_interval_secs, 2);
        assert_eq!(c.thresholds.cpu_percent, 50.0);
        assert_eq!(c.thresholds.disk_percent, 90.0);
        assert_eq!(c.history_limit, 120);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let err = EngineConfig::from_toml_str("monitor_interval_secs = 0").unwrap_err();
        assert!(err.to_string().contains("monitor_interval_secs"));

        let err = EngineConfig::from_toml_str("[thresholds]\ncpu_percent = 120.0").unwrap_err();
        assert!(err.to_string().contains("cpu threshold"));

        assert!(EngineConfig::from_toml_str("default_start_port = 0").is_err());
        assert!(EngineConfig::from_toml_str("alert_history_limit = 0").is_err());

        let err = EngineConfig::from_toml_str("job_ttl_secs = 1000000000000").unwrap_err();
        assert!(err.to_string().contains("job_ttl_secs"));
        assert!(EngineConfig::from_toml_str("scan_timeout_ms = \"fast\"").is_err());
    }

    #[test]
    fn interval_bounds() {
        assert!(validate_interval(Duration::from_secs(1)).is_ok());
        assert!(validate_interval(Duration::from_secs(60)).is_ok());
        assert!(validate_interval(Duration::from_millis(1)).is_err());
        assert!(validate_interval(Duration::from_millis(60_001)).is_err());
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opswatch.toml");
        fs::write(&path, "job_ttl_secs = 60\n").unwrap();
        let c = EngineConfig::load(Some(&path)).unwrap();
        assert_eq!(c.job_ttl(), Duration::from_secs(60));
        assert!(EngineConfig::load(Some(&dir.path().join("missing.toml"))).is_err());
    }
}
