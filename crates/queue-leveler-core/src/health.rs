//! Queue health reporting.
//!
//! A [`QueueHealthReport`] combines queue statistics, in-flight load and the
//! circuit breaker state into one status:
//!
//! - **Unhealthy**: the store could not be read, or the breaker is open
//! - **Degraded**: a warning threshold is exceeded, or the breaker is half-open
//! - **Healthy**: otherwise

use crate::circuit_breaker::CircuitState;
use crate::error::ConfigurationError;
use crate::message::Timestamp;
use crate::queue::QueueStatistics;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Overall health of one queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueHealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for QueueHealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        };
        write!(f, "{}", name)
    }
}

/// Levels above which the health monitor warns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthThresholds {
    /// Dead-letter list length
    pub max_dead_letter_count: usize,

    /// Visible, delayed and in-flight messages combined
    pub max_backlog: usize,

    /// Handlers running at once
    pub max_current_load: usize,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            max_dead_letter_count: 100,
            max_backlog: 1_000,
            max_current_load: 80,
        }
    }
}

impl HealthThresholds {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_backlog == 0 || self.max_current_load == 0 {
            return Err(ConfigurationError::Invalid {
                message: "health thresholds max_backlog and max_current_load must be at least 1"
                    .to_string(),
            });
        }
        Ok(())
    }
}

/// Point-in-time health of one queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueHealthReport {
    pub queue_name: String,
    pub status: QueueHealthStatus,
    pub active_count: usize,
    pub processing_count: usize,
    pub delayed_count: usize,
    pub dead_letter_count: usize,
    pub current_load: usize,
    pub circuit_state: CircuitState,
    pub issues: Vec<String>,
    pub checked_at: Timestamp,
}

impl QueueHealthReport {
    /// Build a report from the latest statistics read.
    ///
    /// `statistics` is the result of reading queue statistics; an error
    /// message there means the store was unreachable.
    pub fn assess(
        queue_name: &str,
        statistics: Result<&QueueStatistics, String>,
        current_load: usize,
        circuit_state: CircuitState,
        thresholds: &HealthThresholds,
    ) -> Self {
        let mut issues = Vec::new();
        let mut unhealthy = false;

        let (active_count, processing_count, delayed_count, dead_letter_count) = match statistics {
            Ok(stats) => (
                stats.active_count(),
                stats.processing_count,
                stats.delayed_count,
                stats.dead_letter_count,
            ),
            Err(message) => {
                unhealthy = true;
                issues.push(format!("store unavailable: {}", message));
                (0, 0, 0, 0)
            }
        };

        match circuit_state {
            CircuitState::Open => {
                unhealthy = true;
                issues.push("circuit breaker open".to_string());
            }
            CircuitState::HalfOpen => issues.push("circuit breaker half-open".to_string()),
            CircuitState::Closed => {}
        }

        if dead_letter_count > thresholds.max_dead_letter_count {
            issues.push(format!(
                "dead-letter count {} exceeds {}",
                dead_letter_count, thresholds.max_dead_letter_count
            ));
        }

        let backlog = active_count + delayed_count + processing_count;
        if backlog > thresholds.max_backlog {
            issues.push(format!(
                "backlog {} exceeds {}",
                backlog, thresholds.max_backlog
            ));
        }

        if current_load > thresholds.max_current_load {
            issues.push(format!(
                "current load {} exceeds {}",
                current_load, thresholds.max_current_load
            ));
        }

        let status = if unhealthy {
            QueueHealthStatus::Unhealthy
        } else if issues.is_empty() {
            QueueHealthStatus::Healthy
        } else {
            QueueHealthStatus::Degraded
        };

        Self {
            queue_name: queue_name.to_string(),
            status,
            active_count,
            processing_count,
            delayed_count,
            dead_letter_count,
            current_load,
            circuit_state,
            issues,
            checked_at: Timestamp::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == QueueHealthStatus::Healthy
    }
}

/// Interface for queue health monitoring
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Read current state and report health
    async fn check_health(&self) -> QueueHealthReport;

    /// Whether the queue can accept work; only an unhealthy queue cannot
    async fn check_readiness(&self) -> bool {
        self.check_health().await.status != QueueHealthStatus::Unhealthy
    }
}

#[cfg(test)]
#[path = "health_tests.rs"]
mod tests;
