//! Job definitions for the scheduler.
//!
//! This module defines the types exchanged with the orchestration platform:
//!
//! - `Operation`: push or pull, the two kinds of work a segment owns
//! - `PullPolicy`: whether pulls cover every item or only pushed ones
//! - `JobDescriptor`: what the launcher submits for one segment/operation
//! - `JobStatus`: the platform's view of a submitted job
//! - `JobState`: the state derived from a status snapshot

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::segment::UserSegment;

/// Restart policy, backoff limit and TTL applied to every job.
pub const DEFAULT_TTL_SECONDS_AFTER_FINISHED: u32 = 120;
pub const DEFAULT_BACKOFF_LIMIT: u32 = 0;

/// The two kinds of work a user segment owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Push,
    Pull,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Push => "push",
            Operation::Pull => "pull",
        }
    }

    /// Value of the `targets` field in stored results.
    pub fn target(&self) -> &'static str {
        match self {
            Operation::Push => "image_pushes",
            Operation::Pull => "image_pulls",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "push" => Ok(Operation::Push),
            "pull" => Ok(Operation::Pull),
            other => Err(format!("unknown operation '{}': expected push or pull", other)),
        }
    }
}

/// Which items the pull queue of a segment receives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullPolicy {
    /// The pull queue is filled with every item up front.
    #[default]
    AllItems,
    /// The pull queue starts empty; push units append what they published.
    PushedOnly,
}

impl PullPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PullPolicy::AllItems => "all_items",
            PullPolicy::PushedOnly => "pushed_only",
        }
    }
}

impl fmt::Display for PullPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PullPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "all_items" | "all" => Ok(PullPolicy::AllItems),
            "pushed_only" | "pushed" => Ok(PullPolicy::PushedOnly),
            other => Err(format!(
                "unknown pull policy '{}': expected all_items or pushed_only",
                other
            )),
        }
    }
}

/// Number of completions needed to drain `total_items` in batches of
/// `batch_size`. `batch_size` of zero is treated as one.
pub fn completions_for(total_items: usize, batch_size: usize) -> u32 {
    let batch_size = batch_size.max(1);
    total_items.div_ceil(batch_size) as u32
}

/// Job name for a segment/operation pair.
pub fn job_name(segment: &UserSegment, operation: Operation) -> String {
    format!("test-registry-{}-{}", operation, segment.slug())
}

/// Description of a group of parallel execution units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    /// Unique job name, derived from the segment slug.
    pub name: String,
    /// Segment whose queue the units drain.
    pub segment: UserSegment,
    /// Push or pull.
    pub operation: Operation,
    /// Container image running the execution unit.
    pub image: String,
    /// Arguments passed to the image entrypoint.
    pub args: Vec<String>,
    /// Number of units allowed to run at once.
    pub parallelism: u32,
    /// Number of successful unit runs the job needs.
    pub completions: u32,
    /// Environment handed to every unit.
    pub env: BTreeMap<String, String>,
    /// Labels applied to the unit pods.
    pub labels: BTreeMap<String, String>,
    pub ttl_seconds_after_finished: u32,
    pub backoff_limit: u32,
}

impl JobDescriptor {
    /// Creates a descriptor with the default TTL and backoff limit and an
    /// executor label keyed by operation.
    pub fn new(
        segment: UserSegment,
        operation: Operation,
        image: impl Into<String>,
        parallelism: u32,
        completions: u32,
    ) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(
            format!("quay-perf-test-component-{}", operation),
            format!("executor-{}", segment.slug()),
        );

        Self {
            name: job_name(&segment, operation),
            segment,
            operation,
            image: image.into(),
            args: vec!["worker".to_string()],
            parallelism,
            completions,
            env: BTreeMap::new(),
            labels,
            ttl_seconds_after_finished: DEFAULT_TTL_SECONDS_AFTER_FINISHED,
            backoff_limit: DEFAULT_BACKOFF_LIMIT,
        }
    }

    /// Sets the environment handed to every unit.
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Adds one environment variable.
    pub fn with_env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Lifecycle of a submitted job as seen by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Running,
    Completed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Running => write!(f, "running"),
            JobState::Completed => write!(f, "completed"),
        }
    }
}

/// Status snapshot returned by the orchestration platform.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub start_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
    pub active: u32,
    pub succeeded: u32,
    pub failed: u32,
}

impl JobStatus {
    /// Completion is recognized only by a completion timestamp; failed pods
    /// do not end the wait.
    pub fn state(&self) -> JobState {
        if self.completion_time.is_some() {
            JobState::Completed
        } else if self.start_time.is_some() || self.active > 0 {
            JobState::Running
        } else {
            JobState::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment() -> UserSegment {
        UserSegment::new("ab12_user_0").unwrap()
    }

    #[test]
    fn test_completions_rounds_up() {
        assert_eq!(completions_for(0, 400), 0);
        assert_eq!(completions_for(1, 400), 1);
        assert_eq!(completions_for(400, 400), 1);
        assert_eq!(completions_for(401, 400), 2);
        assert_eq!(completions_for(1000, 100), 10);
    }

    #[test]
    fn test_completions_zero_batch_size() {
        assert_eq!(completions_for(5, 0), 5);
    }

    #[test]
    fn test_operation_parse_and_display() {
        assert_eq!("PUSH".parse::<Operation>().unwrap(), Operation::Push);
        assert_eq!("pull".parse::<Operation>().unwrap(), Operation::Pull);
        assert!("delete".parse::<Operation>().is_err());
        assert_eq!(Operation::Push.to_string(), "push");
        assert_eq!(Operation::Pull.target(), "image_pulls");
    }

    #[test]
    fn test_pull_policy_parse() {
        assert_eq!("pushed-only".parse::<PullPolicy>().unwrap(), PullPolicy::PushedOnly);
        assert_eq!("ALL_ITEMS".parse::<PullPolicy>().unwrap(), PullPolicy::AllItems);
        assert_eq!(PullPolicy::default(), PullPolicy::AllItems);
        assert!("some".parse::<PullPolicy>().is_err());
    }

    #[test]
    fn test_descriptor_naming_and_labels() {
        let desc = JobDescriptor::new(segment(), Operation::Push, "quay.io/perf:latest", 4, 3)
            .with_env_var("QUAY_TEST_NAME", "push");

        assert_eq!(desc.name, "test-registry-push-ab12-user-0");
        assert_eq!(
            desc.labels.get("quay-perf-test-component-push"),
            Some(&"executor-ab12-user-0".to_string())
        );
        assert_eq!(desc.ttl_seconds_after_finished, 120);
        assert_eq!(desc.backoff_limit, 0);
        assert_eq!(desc.env.get("QUAY_TEST_NAME"), Some(&"push".to_string()));
    }

    #[test]
    fn test_job_state_from_status() {
        let mut status = JobStatus::default();
        assert_eq!(status.state(), JobState::Pending);

        status.active = 2;
        assert_eq!(status.state(), JobState::Running);

        status.failed = 5;
        assert_eq!(status.state(), JobState::Running);

        status.completion_time = Some(Utc::now());
        assert_eq!(status.state(), JobState::Completed);
    }
}
