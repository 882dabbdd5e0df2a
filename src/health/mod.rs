//! Health probing: cascading checks, streaming aggregation, output formats

pub mod monitor;
pub mod output;
pub mod prober;
pub mod sse;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::HealthState;

pub use monitor::{HealthMonitor, MonitorConfig};
pub use prober::{Prober, ProbeTarget, ServiceProbe, Strategy};

/// The kind of check that produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckType {
    Http,
    Tcp,
    Process,
    Output,
    Command,
    Disabled,
}

impl std::fmt::Display for CheckType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckType::Http => write!(f, "http"),
            CheckType::Tcp => write!(f, "tcp"),
            CheckType::Process => write!(f, "process"),
            CheckType::Output => write!(f, "output"),
            CheckType::Command => write!(f, "command"),
            CheckType::Disabled => write!(f, "disabled"),
        }
    }
}

/// One probe outcome for one service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResult {
    pub service_name: String,

    pub status: HealthState,

    pub check_type: CheckType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,

    pub response_time_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub timestamp: DateTime<Utc>,

    /// `checks` sub-object reported by the service itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl HealthResult {
    /// Skeleton result; callers fill in what the probe learned
    pub fn new(service: &str, check_type: CheckType) -> Self {
        Self {
            service_name: service.to_string(),
            status: HealthState::Unknown,
            check_type,
            endpoint: None,
            port: None,
            pid: None,
            response_time_ms: 0,
            status_code: None,
            error: None,
            timestamp: Utc::now(),
            details: None,
        }
    }
}

/// Aggregate of one probe round
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub unknown: usize,
    pub overall: HealthState,
}

impl HealthSummary {
    /// Derive the summary: any unhealthy wins, then degraded, then healthy
    /// when everything is, otherwise unknown
    pub fn from_results(results: &[HealthResult]) -> Self {
        let mut summary = Self {
            total: results.len(),
            healthy: 0,
            degraded: 0,
            unhealthy: 0,
            unknown: 0,
            overall: HealthState::Unknown,
        };

        for result in results {
            match result.status {
                HealthState::Healthy => summary.healthy += 1,
                HealthState::Degraded => summary.degraded += 1,
                HealthState::Unhealthy => summary.unhealthy += 1,
                HealthState::Unknown | HealthState::Starting => summary.unknown += 1,
            }
        }

        summary.overall = if summary.unhealthy > 0 {
            HealthState::Unhealthy
        } else if summary.degraded > 0 {
            HealthState::Degraded
        } else if summary.healthy == summary.total && summary.total > 0 {
            HealthState::Healthy
        } else {
            HealthState::Unknown
        };

        summary
    }
}

/// One complete cycle emitted to consumers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub timestamp: DateTime<Utc>,
    pub project: String,
    pub services: Vec<HealthResult>,
    pub summary: HealthSummary,
}

impl HealthReport {
    pub fn new(project: &str, services: Vec<HealthResult>) -> Self {
        let summary = HealthSummary::from_results(&services);
        Self {
            timestamp: Utc::now(),
            project: project.to_string(),
            services,
            summary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(service: &str, status: HealthState) -> HealthResult {
        let mut r = HealthResult::new(service, CheckType::Http);
        r.status = status;
        r
    }

    #[test]
    fn test_summary_all_healthy() {
        let results = vec![
            result("a", HealthState::Healthy),
            result("b", HealthState::Healthy),
        ];
        let summary = HealthSummary::from_results(&results);
        assert_eq!(summary.overall, HealthState::Healthy);
        assert_eq!(summary.healthy, 2);
    }

    #[test]
    fn test_summary_unhealthy_dominates() {
        let results = vec![
            result("a", HealthState::Healthy),
            result("b", HealthState::Degraded),
            result("c", HealthState::Unhealthy),
        ];
        let summary = HealthSummary::from_results(&results);
        assert_eq!(summary.overall, HealthState::Unhealthy);
    }

    #[test]
    fn test_summary_degraded_beats_healthy() {
        let results = vec![
            result("a", HealthState::Healthy),
            result("b", HealthState::Degraded),
        ];
        let summary = HealthSummary::from_results(&results);
        assert_eq!(summary.overall, HealthState::Degraded);
    }

    #[test]
    fn test_summary_empty_is_unknown() {
        let summary = HealthSummary::from_results(&[]);
        assert_eq!(summary.overall, HealthState::Unknown);
        assert_eq!(summary.total, 0);
    }
}
