//! Run configuration.
//!
//! Settings arrive through the CLI (with environment fallbacks) and are
//! validated here into typed structs before any queue, job or registry call
//! is made. The coordinator hands the worker-side settings to every
//! execution unit as environment variables; [`RunSettings::unit_env`] and the
//! `worker` command agree on the names.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::warn;

use crate::aggregate::{ElasticsearchStore, MetricsStore, NullStore};
use crate::error::{ConfigError, MetricsStoreError};
use crate::execution::{Credentials, PullConfig, PushConfig, RunMetadata};
use crate::scheduler::{CoordinatorConfig, MonitorConfig, Operation, PullPolicy};

/// Environment variable names shared by the driver and the units.
pub mod env {
    pub const QUAY_HOST: &str = "QUAY_HOST";
    pub const QUAY_USERNAME: &str = "QUAY_USERNAME";
    pub const QUAY_PASSWORD: &str = "QUAY_PASSWORD";
    pub const QUAY_ORG: &str = "QUAY_ORG";
    pub const QUAY_TEST_NAME: &str = "QUAY_TEST_NAME";
    pub const CONCURRENCY: &str = "CONCURRENCY";
    pub const TEST_BATCH_SIZE: &str = "TEST_BATCH_SIZE";
    pub const TEST_UUID: &str = "TEST_UUID";
    pub const TEST_NAMESPACE: &str = "TEST_NAMESPACE";
    pub const TARGET_HIT_SIZE: &str = "TARGET_HIT_SIZE";
    pub const PUSH_PULL_NUMBERS: &str = "PUSH_PULL_NUMBERS";
    pub const PUSH_PULL_IMAGE: &str = "PUSH_PULL_IMAGE";
    pub const PUSH_PULL_ES_INDEX: &str = "PUSH_PULL_ES_INDEX";
    pub const ES_HOST: &str = "ES_HOST";
    pub const ES_PORT: &str = "ES_PORT";
    pub const CUSTOM_BUILD_IMAGE: &str = "CUSTOM_BUILD_IMAGE";
    pub const REDIS_URL: &str = "REDIS_URL";
    pub const PULL_POLICY: &str = "PULL_POLICY";
    pub const MAX_RETRIES: &str = "MAX_RETRIES";
    pub const LAYER_CONCURRENCY: &str = "LAYER_CONCURRENCY";
    pub const VERIFY_TLS: &str = "VERIFY_TLS";
}

/// Host name of this machine, or `"unknown"`.
pub fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Identity of one load run. Built once at startup and passed explicitly.
#[derive(Debug, Clone, PartialEq)]
pub struct RunContext {
    pub run_id: String,
    /// Target registry host.
    pub cluster_id: String,
    pub organization: String,
    pub worker_host: String,
}

impl RunContext {
    pub fn new(
        run_id: impl Into<String>,
        cluster_id: impl Into<String>,
        organization: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            cluster_id: cluster_id.into(),
            organization: organization.into(),
            worker_host: local_hostname(),
        }
    }

    pub fn with_worker_host(mut self, worker_host: impl Into<String>) -> Self {
        self.worker_host = worker_host.into();
        self
    }

    /// Metadata attached to every stored result.
    pub fn metadata(&self) -> RunMetadata {
        RunMetadata {
            run_id: self.run_id.clone(),
            cluster_id: self.cluster_id.clone(),
            worker_host: self.worker_host.clone(),
        }
    }
}

/// Target registry.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub host: String,
    pub password: String,
    pub organization: String,
    /// Verify the registry's TLS certificate on HTTP pulls.
    pub verify_tls: bool,
}

/// Metrics store location. No host means results are not stored.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub host: Option<String>,
    pub port: u16,
    pub index: String,
}

impl StoreSettings {
    /// Builds the configured store.
    pub fn build(&self) -> Result<Arc<dyn MetricsStore>, MetricsStoreError> {
        match self.host.as_deref().map(str::trim).filter(|h| !h.is_empty()) {
            Some(host) => Ok(Arc::new(ElasticsearchStore::new(host, self.port)?)),
            None => {
                warn!("No metrics store host configured, results will not be stored");
                Ok(Arc::new(NullStore))
            }
        }
    }
}

/// Settings shared by both push and pull paths of a unit.
#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    /// Items in flight at once inside one unit.
    pub concurrency: usize,
    /// Items one unit pops.
    pub batch_size: usize,
    pub base_image: Option<String>,
    pub max_attempts: u32,
    pub layer_concurrency: usize,
    pub pull_policy: PullPolicy,
}

impl ExecutionSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        positive(env::CONCURRENCY, self.concurrency)?;
        positive(env::TEST_BATCH_SIZE, self.batch_size)?;
        positive(env::MAX_RETRIES, self.max_attempts as usize)?;
        positive(env::LAYER_CONCURRENCY, self.layer_concurrency)
    }
}

/// Validated settings of the `run` command.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub context: RunContext,
    pub registry: RegistrySettings,
    pub store: StoreSettings,
    pub execution: ExecutionSettings,
    pub redis_url: String,
    pub usernames: Vec<String>,
    pub items: Vec<String>,
    /// Segments running at once.
    pub group_size: usize,
    pub skip_push: bool,
    /// Kubernetes namespace; `None` uses the service account's.
    pub namespace: Option<String>,
    /// Image the units run in.
    pub unit_image: String,
    /// Passed through to units for reporting.
    pub target_hit_size: usize,
    pub monitor: MonitorConfig,
}

impl RunSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        required(env::QUAY_HOST, &self.registry.host)?;
        required(env::QUAY_ORG, &self.registry.organization)?;
        required(env::REDIS_URL, &self.redis_url)?;
        required(env::PUSH_PULL_IMAGE, &self.unit_image)?;
        required(env::TEST_UUID, &self.context.run_id)?;
        self.execution.validate()?;
        positive("GROUP_SIZE", self.group_size)?;

        if self.usernames.is_empty() {
            return Err(ConfigError::Missing(env::QUAY_USERNAME));
        }
        if self.items.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: env::PUSH_PULL_NUMBERS,
                message: "the run has no tags to push or pull".to_string(),
            });
        }
        if self.monitor.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "POLL_INTERVAL",
                message: "must be greater than 0".to_string(),
            });
        }
        Ok(())
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            group_size: self.group_size,
            skip_push: self.skip_push,
            pull_policy: self.execution.pull_policy,
        }
    }

    /// Worker settings for units running in this process. Each job supplies
    /// its own username and operation; the first user and push stand in.
    pub fn local_worker(&self) -> WorkerSettings {
        WorkerSettings {
            context: self.context.clone(),
            registry: self.registry.clone(),
            store: self.store.clone(),
            execution: self.execution.clone(),
            redis_url: self.redis_url.clone(),
            username: self.usernames.first().cloned().unwrap_or_default(),
            operation: Operation::Push,
        }
    }

    /// Environment handed to every unit. The launcher adds the per-job
    /// username and operation.
    pub fn unit_env(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        let mut set = |key: &str, value: String| {
            vars.insert(key.to_string(), value);
        };

        set(env::QUAY_HOST, self.registry.host.clone());
        set(env::QUAY_PASSWORD, self.registry.password.clone());
        set(env::QUAY_ORG, self.registry.organization.clone());
        set(env::VERIFY_TLS, self.registry.verify_tls.to_string());
        set(env::TEST_UUID, self.context.run_id.clone());
        set(env::CONCURRENCY, self.execution.concurrency.to_string());
        set(env::TEST_BATCH_SIZE, self.execution.batch_size.to_string());
        set(env::MAX_RETRIES, self.execution.max_attempts.to_string());
        set(env::LAYER_CONCURRENCY, self.execution.layer_concurrency.to_string());
        set(env::PULL_POLICY, self.execution.pull_policy.to_string());
        set(
            env::CUSTOM_BUILD_IMAGE,
            self.execution.base_image.clone().unwrap_or_default(),
        );
        set(env::REDIS_URL, self.redis_url.clone());
        set(env::ES_HOST, self.store.host.clone().unwrap_or_default());
        set(env::ES_PORT, self.store.port.to_string());
        set(env::PUSH_PULL_ES_INDEX, self.store.index.clone());
        set(env::PUSH_PULL_IMAGE, self.unit_image.clone());
        set(env::PUSH_PULL_NUMBERS, self.items.len().to_string());
        set(env::TARGET_HIT_SIZE, self.target_hit_size.to_string());
        if let Some(namespace) = &self.namespace {
            set(env::TEST_NAMESPACE, namespace.clone());
        }

        vars
    }
}

/// Validated settings of the `worker` command.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub context: RunContext,
    pub registry: RegistrySettings,
    pub store: StoreSettings,
    pub execution: ExecutionSettings,
    pub redis_url: String,
    pub username: String,
    pub operation: Operation,
}

impl WorkerSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        required(env::QUAY_HOST, &self.registry.host)?;
        required(env::QUAY_USERNAME, &self.username)?;
        required(env::REDIS_URL, &self.redis_url)?;
        self.execution.validate()
    }

    fn credentials(&self) -> Credentials {
        Credentials {
            username: self.username.clone(),
            password: self.registry.password.clone(),
        }
    }

    pub fn push_config(&self) -> PushConfig {
        PushConfig::new(self.registry.host.clone(), self.credentials())
            .with_base_image(self.execution.base_image.clone())
            .with_max_attempts(self.execution.max_attempts)
            .with_concurrency(self.execution.concurrency)
    }

    pub fn pull_config(&self) -> PullConfig {
        PullConfig::default()
            .with_credentials(Some(self.credentials()))
            .with_max_attempts(self.execution.max_attempts)
            .with_item_concurrency(self.execution.concurrency)
            .with_layer_concurrency(self.execution.layer_concurrency)
    }
}

fn required(key: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Missing(key));
    }
    Ok(())
}

fn positive(key: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key,
            message: "must be greater than 0".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{DEFAULT_LAYER_CONCURRENCY, DEFAULT_MAX_ATTEMPTS};

    fn execution() -> ExecutionSettings {
        ExecutionSettings {
            concurrency: 4,
            batch_size: 100,
            base_image: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            layer_concurrency: DEFAULT_LAYER_CONCURRENCY,
            pull_policy: PullPolicy::AllItems,
        }
    }

    fn registry() -> RegistrySettings {
        RegistrySettings {
            host: "quay.example.com".to_string(),
            password: "secret".to_string(),
            organization: "perf".to_string(),
            verify_tls: false,
        }
    }

    fn store() -> StoreSettings {
        StoreSettings {
            host: Some("es.example.com".to_string()),
            port: 9200,
            index: "push-pull".to_string(),
        }
    }

    fn run_settings() -> RunSettings {
        RunSettings {
            context: RunContext::new("run-1234", "quay.example.com", "perf")
                .with_worker_host("driver"),
            registry: registry(),
            store: store(),
            execution: execution(),
            redis_url: "redis://localhost:6379".to_string(),
            usernames: vec!["admin".to_string()],
            items: vec!["quay.example.com/perf/repo:0".to_string()],
            group_size: 1,
            skip_push: false,
            namespace: Some("perf-test".to_string()),
            unit_image: "quay.io/perf/loadgen:latest".to_string(),
            target_hit_size: 10,
            monitor: MonitorConfig::default(),
        }
    }

    #[test]
    fn test_run_context_metadata() {
        let context = RunContext::new("run-1", "quay.example.com", "perf").with_worker_host("w1");
        let metadata = context.metadata();
        assert_eq!(metadata.run_id, "run-1");
        assert_eq!(metadata.cluster_id, "quay.example.com");
        assert_eq!(metadata.worker_host, "w1");
        assert!(!local_hostname().is_empty());
    }

    #[test]
    fn test_run_settings_validate() {
        assert!(run_settings().validate().is_ok());

        let mut settings = run_settings();
        settings.registry.host = " ".to_string();
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::Missing("QUAY_HOST"))
        ));

        let mut settings = run_settings();
        settings.execution.batch_size = 0;
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::InvalidValue { key: "TEST_BATCH_SIZE", .. })
        ));

        let mut settings = run_settings();
        settings.items.clear();
        assert!(settings.validate().is_err());

        let mut settings = run_settings();
        settings.usernames.clear();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_unit_env() {
        let vars = run_settings().unit_env();
        assert_eq!(vars["QUAY_HOST"], "quay.example.com");
        assert_eq!(vars["TEST_UUID"], "run-1234");
        assert_eq!(vars["TEST_BATCH_SIZE"], "100");
        assert_eq!(vars["PULL_POLICY"], "all_items");
        assert_eq!(vars["PUSH_PULL_NUMBERS"], "1");
        assert_eq!(vars["TEST_NAMESPACE"], "perf-test");
        assert_eq!(vars["CUSTOM_BUILD_IMAGE"], "");
        assert!(!vars.contains_key("QUAY_USERNAME"));
    }

    #[test]
    fn test_worker_configs() {
        let worker = WorkerSettings {
            context: RunContext::new("run-1", "quay.example.com", "perf"),
            registry: registry(),
            store: store(),
            execution: ExecutionSettings {
                base_image: Some("registry.local/base".to_string()),
                ..execution()
            },
            redis_url: "redis://localhost:6379".to_string(),
            username: "ab12_user_0".to_string(),
            operation: Operation::Push,
        };
        assert!(worker.validate().is_ok());

        let push = worker.push_config();
        assert_eq!(push.registry, "quay.example.com");
        assert_eq!(push.credentials.username, "ab12_user_0");
        assert_eq!(push.base_image.as_deref(), Some("registry.local/base"));
        assert_eq!(push.concurrency, 4);

        let pull = worker.pull_config();
        assert_eq!(pull.item_concurrency, 4);
        assert_eq!(pull.credentials.unwrap().password, "secret");
    }

    #[test]
    fn test_store_without_host_is_null() {
        let settings = StoreSettings {
            host: None,
            ..store()
        };
        assert!(settings.build().is_ok());
    }
}
