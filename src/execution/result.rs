//! Per-item execution results.

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::scheduler::job::Operation;

/// Run-level metadata attached to every stored result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunMetadata {
    /// Identifier shared by every result of one load run.
    #[serde(rename = "uuid")]
    pub run_id: String,
    /// Target registry host.
    #[serde(rename = "cluster_name")]
    pub cluster_id: String,
    /// Host name of the machine that produced the result.
    #[serde(rename = "hostname")]
    pub worker_host: String,
}

/// Outcome of processing one work item.
///
/// Failures are recorded here as data. A result is created once per item
/// and never mutated afterwards, except for attaching [`RunMetadata`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    #[serde(rename = "tag")]
    pub item: String,
    #[serde(rename = "targets", serialize_with = "serialize_target")]
    pub operation: Operation,
    /// Seconds spent on the measured part of the item.
    pub elapsed_time: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub success_count: u32,
    pub failure_count: u32,
    pub successful: bool,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<RunMetadata>,
}

fn serialize_target<S: Serializer>(operation: &Operation, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(operation.target())
}

impl ExecutionResult {
    /// Builds a result whose elapsed time is the span between `start` and `end`.
    pub fn timed(
        item: impl Into<String>,
        operation: Operation,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        success_count: u32,
        failure_count: u32,
        successful: bool,
    ) -> Self {
        let elapsed_time = (end - start)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        Self {
            item: item.into(),
            operation,
            elapsed_time,
            start_time: start,
            end_time: end,
            success_count,
            failure_count,
            successful,
            metadata: None,
        }
    }

    /// A single failure recorded with zero elapsed time.
    pub fn failed_without_timing(
        item: impl Into<String>,
        operation: Operation,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        Self {
            item: item.into(),
            operation,
            elapsed_time: 0.0,
            start_time: start,
            end_time: end,
            success_count: 0,
            failure_count: 1,
            successful: false,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: RunMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_timed_elapsed() {
        let start = Utc::now();
        let end = start + Duration::milliseconds(1500);
        let result = ExecutionResult::timed("r/o/x:1", Operation::Push, start, end, 1, 2, true);
        assert!((result.elapsed_time - 1.5).abs() < 1e-9);
        assert_eq!(result.failure_count, 2);
    }

    #[test]
    fn test_timed_clock_skew_is_zero() {
        let start = Utc::now();
        let end = start - Duration::seconds(1);
        let result = ExecutionResult::timed("r/o/x:1", Operation::Pull, start, end, 0, 1, false);
        assert_eq!(result.elapsed_time, 0.0);
    }

    #[test]
    fn test_serialized_field_names() {
        let now = Utc::now();
        let result = ExecutionResult::failed_without_timing("quay.io/org/repo:7", Operation::Pull, now, now)
            .with_metadata(RunMetadata {
                run_id: "run-1".to_string(),
                cluster_id: "quay.io".to_string(),
                worker_host: "pod-a".to_string(),
            });

        let doc = serde_json::to_value(&result).unwrap();
        assert_eq!(doc["tag"], "quay.io/org/repo:7");
        assert_eq!(doc["targets"], "image_pulls");
        assert_eq!(doc["elapsed_time"], 0.0);
        assert_eq!(doc["failure_count"], 1);
        assert_eq!(doc["successful"], false);
        assert_eq!(doc["uuid"], "run-1");
        assert_eq!(doc["cluster_name"], "quay.io");
        assert_eq!(doc["hostname"], "pod-a");
        assert!(doc.get("metadata").is_none());
    }

    #[test]
    fn test_serialized_without_metadata() {
        let now = Utc::now();
        let result = ExecutionResult::timed("a/b:c", Operation::Push, now, now, 1, 0, true);
        let doc = serde_json::to_value(&result).unwrap();
        assert_eq!(doc["targets"], "image_pushes");
        assert!(doc.get("uuid").is_none());
    }
}
