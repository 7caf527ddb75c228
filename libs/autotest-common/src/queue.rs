/// Queue Dispatcher - Pure Routing Rules
///
/// **Core Responsibility:**
/// Decide which named queue a job lands in and how long it may run.
///
/// **Routing Rules (exclusive, in order):**
/// - More than one submission URL → `batch`
/// - High-priority flag set → `high`
/// - Otherwise → `low`
///
/// The `settings` queue only ever carries settings refresh jobs; test jobs
/// are never routed there. A job's queue is fixed at submission time.

use crate::types::SettingsRecord;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Multiplier applied to the summed group timeouts
pub const TIMEOUT_SAFETY_FACTOR: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueName {
    Settings,
    High,
    Low,
    Batch,
}

impl QueueName {
    pub const ALL: [QueueName; 4] = [
        QueueName::Settings,
        QueueName::High,
        QueueName::Low,
        QueueName::Batch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Settings => "settings",
            QueueName::High => "high",
            QueueName::Low => "low",
            QueueName::Batch => "batch",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueName::ALL
            .iter()
            .copied()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| format!("unknown queue: {}", s))
    }
}

/// The job attributes routing depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobAttributes {
    pub file_url_count: usize,
    pub high_priority: bool,
}

pub fn select_queue(attrs: &JobAttributes) -> QueueName {
    if attrs.file_url_count > 1 {
        QueueName::Batch
    } else if attrs.high_priority {
        QueueName::High
    } else {
        QueueName::Low
    }
}

/// Hard wall-clock budget for one job of this settings record.
///
/// Whole seconds, rounded down, like the per-group timeouts it is built from.
pub fn compute_timeout(settings: &SettingsRecord, factor: f64) -> Duration {
    let total = settings.total_group_timeout_secs() as f64 * factor;
    Duration::from_secs(total.floor() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(file_url_count: usize, high_priority: bool) -> JobAttributes {
        JobAttributes {
            file_url_count,
            high_priority,
        }
    }

    #[test]
    fn test_batch_wins_over_priority() {
        for n in 2..6 {
            assert_eq!(select_queue(&attrs(n, true)), QueueName::Batch);
            assert_eq!(select_queue(&attrs(n, false)), QueueName::Batch);
        }
    }

    #[test]
    fn test_single_url_priority() {
        assert_eq!(select_queue(&attrs(1, true)), QueueName::High);
        assert_eq!(select_queue(&attrs(1, false)), QueueName::Low);
    }

    #[test]
    fn test_test_jobs_never_routed_to_settings() {
        for n in 0..4 {
            for p in [true, false] {
                assert_ne!(select_queue(&attrs(n, p)), QueueName::Settings);
            }
        }
    }

    #[test]
    fn test_queue_names() {
        for q in QueueName::ALL {
            assert_eq!(q.as_str().parse::<QueueName>().unwrap(), q);
        }
        assert!("single".parse::<QueueName>().is_err());
    }

    #[test]
    fn test_compute_timeout_sums_all_groups() {
        let settings: SettingsRecord = serde_json::from_value(json!({
            "_user": "alice",
            "testers": [
                {"tester_type": "py", "test_data": [{"timeout": 30}, {"timeout": 10}]},
                {"tester_type": "java", "test_data": [{"timeout": 5}]}
            ]
        }))
        .unwrap();

        assert_eq!(compute_timeout(&settings, TIMEOUT_SAFETY_FACTOR), Duration::from_secs(67));
        assert_eq!(compute_timeout(&settings, 1.0), Duration::from_secs(45));
    }

    #[test]
    fn test_compute_timeout_single_python_group() {
        let settings: SettingsRecord = serde_json::from_value(json!({
            "_user": "alice",
            "testers": [{"tester_type": "py", "test_data": [{"timeout": 30}]}]
        }))
        .unwrap();
        assert_eq!(compute_timeout(&settings, TIMEOUT_SAFETY_FACTOR), Duration::from_secs(45));
    }

    #[test]
    fn test_compute_timeout_empty_settings() {
        let settings = SettingsRecord::new("alice");
        assert_eq!(compute_timeout(&settings, TIMEOUT_SAFETY_FACTOR), Duration::ZERO);
    }
}
