//! Health reporting for probes.

use serde::Serialize;
use std::fmt;

#[cfg(test)]
#[path = "health_tests.rs"]
mod tests;

/// Kind of probe asking for health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum HealthCheckTag {
    Startup,
    /// Failing liveness means the process should be restarted
    Liveness,
    /// Failing readiness means the process should not receive work yet
    Readiness,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum HealthStatus {
    Unhealthy,
    Degraded,
    Healthy,
}

/// Health check result for a single component
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthCheckResult {
    pub status: HealthStatus,
    pub description: Option<String>,
}

impl HealthCheckResult {
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            description: None,
        }
    }

    pub fn degraded(description: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Degraded,
            description: Some(description.into()),
        }
    }

    pub fn unhealthy(description: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            description: Some(description.into()),
        }
    }

    /// Result for a component that has not finished initializing.
    ///
    /// Liveness probes see it as unhealthy, all other probes as degraded so a
    /// warming-up process is not killed.
    pub fn not_initialized(component: &str, tag: HealthCheckTag) -> Self {
        let description = format!("{component} is not yet initialized");
        match tag {
            HealthCheckTag::Liveness => Self::unhealthy(description),
            _ => Self::degraded(description),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

impl fmt::Display for HealthCheckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{:?}: {}", self.status, description),
            None => write!(f, "{:?}", self.status),
        }
    }
}
