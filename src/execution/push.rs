//! Push path: build, publish, and remove one image per work item.
//!
//! Every built image embeds a fresh UUID so the registry always receives a
//! new layer. Only the publish attempts are timed; the build and the local
//! removal are excluded from `elapsed_time`.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::metrics::MetricsCollector;
use crate::scheduler::job::Operation;

use super::image_tool::{ImageTool, ToolOutput};
use super::pool::run_bounded;
use super::registry_client::Credentials;
use super::result::ExecutionResult;
use super::retry::{retry_blind, DEFAULT_MAX_ATTEMPTS};

/// Base image used when no custom build image is configured.
pub const DEFAULT_BASE_IMAGE: &str = "quay.io/jitesoft/alpine";

/// Settings for one push batch.
#[derive(Debug, Clone)]
pub struct PushConfig {
    /// Registry host to log in to.
    pub registry: String,
    pub credentials: Credentials,
    /// Base image of every build; `None` means [`DEFAULT_BASE_IMAGE`].
    pub base_image: Option<String>,
    /// Publish attempts per item.
    pub max_attempts: u32,
    /// Items in flight at once.
    pub concurrency: usize,
}

impl PushConfig {
    pub fn new(registry: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            registry: registry.into(),
            credentials,
            base_image: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            concurrency: 4,
        }
    }

    pub fn with_base_image(mut self, base_image: Option<String>) -> Self {
        self.base_image = base_image.filter(|s| !s.trim().is_empty());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    fn base_image(&self) -> &str {
        self.base_image.as_deref().unwrap_or(DEFAULT_BASE_IMAGE)
    }
}

/// Build file for one item: the base image plus a unique marker file.
pub fn build_file(base_image: &str, marker: Uuid) -> String {
    format!("FROM {}\nRUN echo {} > /tmp/key.txt", base_image, marker)
}

fn log_tool_failure(tag: &str, stage: &str, output: &ToolOutput) {
    warn!(
        tag = %tag,
        exit_code = ?output.exit_code,
        stdout = %output.stdout.trim(),
        stderr = %output.stderr.trim(),
        "{} failed",
        stage
    );
}

/// Builds, publishes, and removes one image.
///
/// Returns `None` when the build fails; the item is dropped without a
/// result. Otherwise the result carries the publish attempt counts.
pub async fn push_item(
    tool: &dyn ImageTool,
    tag: &str,
    base_image: &str,
    max_attempts: u32,
) -> Option<ExecutionResult> {
    let build = build_file(base_image, Uuid::new_v4());
    match tool.build(tag, &build).await {
        Ok(output) if output.success => {}
        Ok(output) => {
            error!(tag = %tag, "Failed to build image");
            log_tool_failure(tag, "build", &output);
            return None;
        }
        Err(e) => {
            error!(tag = %tag, error = %e, "Failed to build image");
            return None;
        }
    }

    let metrics = &MetricsCollector::new();
    let start = Utc::now();
    let outcome = retry_blind(
        max_attempts,
        |_| async move {
            let result = match tool.push(tag).await {
                Ok(output) if output.success => Ok(()),
                Ok(output) => Err(output),
                Err(e) => Err(ToolOutput::failed(e.to_string())),
            };
            metrics.record_attempt(Operation::Push.as_str(), result.is_ok());
            result
        },
        |attempt, output| {
            log_tool_failure(tag, "push", output);
            info!(tag = %tag, "Retrying {}/{}", attempt, max_attempts.max(1));
        },
    )
    .await;
    let end = Utc::now();

    match tool.remove(tag).await {
        Ok(output) if !output.success => {
            debug!(tag = %tag, stderr = %output.stderr.trim(), "Image removal failed")
        }
        Err(e) => debug!(tag = %tag, error = %e, "Image removal failed"),
        Ok(_) => {}
    }

    let succeeded = outcome.succeeded();
    Some(ExecutionResult::timed(
        tag,
        Operation::Push,
        start,
        end,
        u32::from(succeeded),
        outcome.failures,
        succeeded,
    ))
}

/// Logs in once, then pushes every item with bounded concurrency.
///
/// A failed login is logged and the batch proceeds; the pushes then fail
/// and are recorded as results.
pub async fn run_push_batch(
    tool: Arc<dyn ImageTool>,
    items: Vec<String>,
    config: &PushConfig,
) -> Vec<ExecutionResult> {
    info!(
        registry = %config.registry,
        username = %config.credentials.username,
        "Logging in to registry"
    );
    match tool
        .login(
            &config.registry,
            &config.credentials.username,
            &config.credentials.password,
        )
        .await
    {
        Ok(output) if output.success => {}
        Ok(output) => log_tool_failure(&config.registry, "login", &output),
        Err(e) => error!(registry = %config.registry, error = %e, "Login failed"),
    }

    info!("Creating and pushing {} tags", items.len());
    let base_image = config.base_image().to_string();
    let max_attempts = config.max_attempts;
    run_bounded(items, config.concurrency, "pushes", move |tag| {
        let tool = Arc::clone(&tool);
        let base_image = base_image.clone();
        async move { push_item(tool.as_ref(), &tag, &base_image, max_attempts).await }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ToolError;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedTool {
        failing_builds: HashSet<String>,
        fail_login: bool,
        push_failures_before_success: u32,
        pushes: AtomicU32,
        removes: AtomicU32,
        builds: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ImageTool for ScriptedTool {
        async fn login(&self, _: &str, _: &str, _: &str) -> Result<ToolOutput, ToolError> {
            Ok(if self.fail_login {
                ToolOutput::failed("unauthorized")
            } else {
                ToolOutput::ok()
            })
        }

        async fn build(&self, tag: &str, build_file: &str) -> Result<ToolOutput, ToolError> {
            self.builds.lock().unwrap().push(build_file.to_string());
            Ok(if self.failing_builds.contains(tag) {
                ToolOutput::failed("no space left")
            } else {
                ToolOutput::ok()
            })
        }

        async fn push(&self, _tag: &str) -> Result<ToolOutput, ToolError> {
            let n = self.pushes.fetch_add(1, Ordering::SeqCst);
            Ok(if n < self.push_failures_before_success {
                ToolOutput::failed("502 bad gateway")
            } else {
                ToolOutput::ok()
            })
        }

        async fn remove(&self, _tag: &str) -> Result<ToolOutput, ToolError> {
            self.removes.fetch_add(1, Ordering::SeqCst);
            Ok(ToolOutput::failed("image in use"))
        }
    }

    #[test]
    fn test_build_file_embeds_marker() {
        let marker = Uuid::new_v4();
        let file = build_file(DEFAULT_BASE_IMAGE, marker);
        assert_eq!(
            file,
            format!("FROM quay.io/jitesoft/alpine\nRUN echo {} > /tmp/key.txt", marker)
        );
    }

    #[test]
    fn test_blank_base_image_falls_back() {
        let creds = Credentials {
            username: "u".into(),
            password: "p".into(),
        };
        let config = PushConfig::new("quay.io", creds).with_base_image(Some("  ".into()));
        assert_eq!(config.base_image(), DEFAULT_BASE_IMAGE);
    }

    #[tokio::test]
    async fn test_push_always_failing_exhausts_attempts() {
        let tool = ScriptedTool {
            push_failures_before_success: u32::MAX,
            ..Default::default()
        };

        let result = push_item(&tool, "r/o/x:1", DEFAULT_BASE_IMAGE, 3).await.unwrap();
        assert_eq!(result.failure_count, 3);
        assert_eq!(result.success_count, 0);
        assert!(!result.successful);
        assert_eq!(tool.pushes.load(Ordering::SeqCst), 3);
        assert_eq!(tool.removes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_push_succeeds_after_retry() {
        let tool = ScriptedTool {
            push_failures_before_success: 1,
            ..Default::default()
        };

        let result = push_item(&tool, "r/o/x:1", DEFAULT_BASE_IMAGE, 3).await.unwrap();
        assert_eq!(result.failure_count, 1);
        assert_eq!(result.success_count, 1);
        assert!(result.successful);
        assert_eq!(result.operation, Operation::Push);
    }

    #[tokio::test]
    async fn test_build_failure_drops_item() {
        let tool = ScriptedTool {
            failing_builds: HashSet::from(["r/o/x:1".to_string()]),
            ..Default::default()
        };

        assert!(push_item(&tool, "r/o/x:1", DEFAULT_BASE_IMAGE, 3).await.is_none());
        assert_eq!(tool.pushes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_build_failure_leaves_rest_of_batch() {
        let tool = Arc::new(ScriptedTool {
            failing_builds: HashSet::from(["r/o/x:2".to_string()]),
            ..Default::default()
        });
        let creds = Credentials {
            username: "u".into(),
            password: "p".into(),
        };
        let config = PushConfig::new("quay.io", creds).with_concurrency(1);
        let items = vec![
            "r/o/x:1".to_string(),
            "r/o/x:2".to_string(),
            "r/o/x:3".to_string(),
        ];

        let results = run_push_batch(tool.clone(), items, &config).await;

        let mut pushed: Vec<_> = results.iter().map(|r| r.item.as_str()).collect();
        pushed.sort();
        assert_eq!(pushed, vec!["r/o/x:1", "r/o/x:3"]);
        assert!(results.iter().all(|r| r.successful));
        assert_eq!(tool.pushes.load(Ordering::SeqCst), 2);
        assert_eq!(tool.builds.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_each_build_gets_unique_marker() {
        let tool = Arc::new(ScriptedTool::default());
        let creds = Credentials {
            username: "u".into(),
            password: "p".into(),
        };
        let config = PushConfig::new("quay.io", creds).with_concurrency(2);
        let items = vec!["r/o/x:1".to_string(), "r/o/x:2".to_string()];

        let results = run_push_batch(tool.clone(), items, &config).await;
        assert_eq!(results.len(), 2);

        let builds = tool.builds.lock().unwrap();
        assert_eq!(builds.len(), 2);
        assert_ne!(builds[0], builds[1]);
    }

    #[tokio::test]
    async fn test_login_failure_does_not_stop_batch() {
        let tool = Arc::new(ScriptedTool {
            fail_login: true,
            ..Default::default()
        });
        let creds = Credentials {
            username: "u".into(),
            password: "bad".into(),
        };
        let config = PushConfig::new("quay.io", creds);

        let results = run_push_batch(tool, vec!["r/o/x:1".to_string()], &config).await;
        assert_eq!(results.len(), 1);
    }
}
