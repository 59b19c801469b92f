//! Health types and the pure rules that turn raw readings into verdicts.
//!
//! The [`crate::monitor::HealthMonitor`] gathers readings; everything here is side-effect free
//! so the thresholds can be tested without a running monitor.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::alerts::{AlertType, Severity};
use crate::backend::BackendKind;

/// Service key for the aggregated view over every registered adapter.
pub const HYBRID_SERVICE: &str = "hybrid";
/// Service key for host resources.
pub const SYSTEM_SERVICE: &str = "system";

pub const CPU_WARNING_PERCENT: f32 = 90.0;
pub const CPU_CRITICAL_PERCENT: f32 = 95.0;
pub const MEMORY_WARNING_PERCENT: f32 = 90.0;
pub const MEMORY_CRITICAL_PERCENT: f32 = 95.0;
/// 1-minute load above `cores * LOAD_PER_CORE_LIMIT` marks the host degraded.
pub const LOAD_PER_CORE_LIMIT: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    #[default]
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        }
    }

    /// Whether a backend in this state can take requests.
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The latest verdict for one monitored service. Overwritten every cycle.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub service: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<u64>,
    pub response_time_ms: u64,
    pub last_check: DateTime<Utc>,
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemoryStats {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub usage_percent: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiskStats {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub usage_percent: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessStats {
    pub pid: u32,
    pub cpu_percent: f32,
    pub memory_bytes: u64,
}

/// Host resource readings for one monitor cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    /// 1, 5 and 15 minute load averages.
    pub load_average: [f64; 3],
    pub cores: usize,
    pub memory: MemoryStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk: Option<DiskStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessStats>,
    pub uptime_seconds: u64,
}

/// An anomaly found while evaluating a reading; the monitor turns these into alerts.
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub alert_type: AlertType,
    pub severity: Severity,
    pub message: String,
}

impl Finding {
    fn warning(message: String) -> Self {
        Self {
            alert_type: AlertType::Warning,
            severity: Severity::Medium,
            message,
        }
    }

    fn critical(message: String) -> Self {
        Self {
            alert_type: AlertType::Error,
            severity: Severity::Critical,
            message,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SystemVerdict {
    pub status: HealthStatus,
    pub findings: Vec<Finding>,
}

/// Apply the host thresholds.
///
/// - CPU or memory above 90% marks the host degraded with a medium warning.
/// - Above 95% the host is unhealthy and a critical error is added on top.
/// - 1-minute load above `cores * 0.8` marks the host degraded with a medium warning.
pub fn evaluate_system(metrics: &SystemMetrics) -> SystemVerdict {
    let mut status = HealthStatus::Healthy;
    let mut findings = Vec::new();

    let mut check_usage = |label: &str, value: f32, warn_at: f32, critical_at: f32| {
        if value > warn_at {
            status = worst(status, HealthStatus::Degraded);
            findings.push(Finding::warning(format!("High {label} usage: {value:.1}%")));
        }
        if value > critical_at {
            status = worst(status, HealthStatus::Unhealthy);
            findings.push(Finding::critical(format!(
                "Critical {label} usage: {value:.1}%"
            )));
        }
    };
    check_usage(
        "CPU",
        metrics.cpu_usage_percent,
        CPU_WARNING_PERCENT,
        CPU_CRITICAL_PERCENT,
    );
    check_usage(
        "memory",
        metrics.memory.usage_percent,
        MEMORY_WARNING_PERCENT,
        MEMORY_CRITICAL_PERCENT,
    );

    let load_limit = metrics.cores as f64 * LOAD_PER_CORE_LIMIT;
    let load = metrics.load_average[0];
    if metrics.cores > 0 && load > load_limit {
        status = worst(status, HealthStatus::Degraded);
        findings.push(Finding::warning(format!(
            "High load average: {load:.2} (limit {load_limit:.2} for {} cores)",
            metrics.cores
        )));
    }

    SystemVerdict { status, findings }
}

/// The aggregated view over adapters: unhealthy with none available, degraded with some,
/// healthy with all. An empty set counts as none available.
pub fn aggregate_backends<'a>(statuses: impl IntoIterator<Item = &'a HealthStatus>) -> HealthStatus {
    let (total, available) = statuses
        .into_iter()
        .fold((0usize, 0usize), |(total, available), status| {
            (total + 1, available + usize::from(status.is_available()))
        });

    match available {
        0 => HealthStatus::Unhealthy,
        n if n < total => HealthStatus::Degraded,
        _ => HealthStatus::Healthy,
    }
}

/// Combine the hybrid view with the host verdict.
///
/// The result is unhealthy only when no adapter is available; host pressure can at most
/// degrade it.
pub fn overall_status(hybrid: HealthStatus, system: HealthStatus) -> HealthStatus {
    match (hybrid, system) {
        (HealthStatus::Unhealthy, _) => HealthStatus::Unhealthy,
        (hybrid, HealthStatus::Healthy) => hybrid,
        _ => HealthStatus::Degraded,
    }
}

fn rank(status: HealthStatus) -> u8 {
    match status {
        HealthStatus::Healthy => 0,
        HealthStatus::Unknown => 1,
        HealthStatus::Degraded => 2,
        HealthStatus::Unhealthy => 3,
    }
}

fn worst(a: HealthStatus, b: HealthStatus) -> HealthStatus {
    if rank(b) > rank(a) { b } else { a }
}

/// One completed monitor cycle. Published as a whole; readers never see a partial cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthSnapshot {
    pub cycle: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checked_at: Option<DateTime<Utc>>,
    pub status: HealthStatus,
    pub services: BTreeMap<String, HealthCheckResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemMetrics>,
}

impl HealthSnapshot {
    /// Status of one adapter as of the last cycle; `Unknown` before the first one.
    pub fn backend_status(&self, kind: BackendKind) -> HealthStatus {
        self.services
            .get(kind.as_str())
            .map(|result| result.status)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(cpu: f32, mem: f32, cores: usize, load1: f64) -> SystemMetrics {
        SystemMetrics {
            cpu_usage_percent: cpu,
            load_average: [load1, 0.0, 0.0],
            cores,
            memory: MemoryStats {
                usage_percent: mem,
                ..MemoryStats::default()
            },
            ..SystemMetrics::default()
        }
    }

    #[test]
    fn calm_host_is_healthy() {
        let verdict = evaluate_system(&metrics(20.0, 40.0, 8, 1.0));
        assert_eq!(verdict.status, HealthStatus::Healthy);
        assert!(verdict.findings.is_empty());
    }

    #[test]
    fn cpu_over_ninety_five_adds_critical_error() {
        let verdict = evaluate_system(&metrics(96.0, 10.0, 4, 3.0));
        assert_eq!(verdict.status, HealthStatus::Unhealthy);

        let critical: Vec<&Finding> = verdict
            .findings
            .iter()
            .filter(|f| f.severity == Severity::Critical)
            .collect();
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].alert_type, AlertType::Error);
        assert!(critical[0].message.contains("96.0%"));

        // load 3.0 on 4 cores stays under the 3.2 limit
        assert!(!verdict.findings.iter().any(|f| f.message.contains("load")));
    }

    #[test]
    fn memory_between_thresholds_only_degrades() {
        let verdict = evaluate_system(&metrics(10.0, 92.5, 4, 0.5));
        assert_eq!(verdict.status, HealthStatus::Degraded);
        assert_eq!(verdict.findings.len(), 1);
        assert_eq!(verdict.findings[0].severity, Severity::Medium);
        assert!(verdict.findings[0].message.contains("92.5%"));
    }

    #[test]
    fn load_over_cores_limit_degrades() {
        let verdict = evaluate_system(&metrics(10.0, 10.0, 4, 3.5));
        assert_eq!(verdict.status, HealthStatus::Degraded);
        assert!(verdict.findings[0].message.contains("High load average"));
    }

    #[test]
    fn aggregate_follows_availability_counts() {
        use HealthStatus::*;
        assert_eq!(aggregate_backends(&[]), Unhealthy);
        assert_eq!(aggregate_backends(&[Unhealthy, Unknown]), Unhealthy);
        assert_eq!(aggregate_backends(&[Healthy, Unhealthy, Healthy]), Degraded);
        assert_eq!(aggregate_backends(&[Healthy, Degraded]), Healthy);
    }

    #[test]
    fn host_pressure_never_makes_overall_unhealthy() {
        use HealthStatus::*;
        assert_eq!(overall_status(Healthy, Unhealthy), Degraded);
        assert_eq!(overall_status(Healthy, Healthy), Healthy);
        assert_eq!(overall_status(Unhealthy, Healthy), Unhealthy);
        assert_eq!(overall_status(Degraded, Healthy), Degraded);
    }
}
