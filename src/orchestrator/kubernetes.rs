//! Kubernetes Jobs through the batch/v1 REST API.
//!
//! Only three calls are needed (create, read status, delete), so the API
//! server is addressed directly with `reqwest` rather than through a full
//! client library.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Certificate, Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::Orchestrator;
use crate::error::OrchestratorError;
use crate::scheduler::job::{JobDescriptor, JobStatus};

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Container name used for every execution unit.
pub const CONTAINER_NAME: &str = "python";

/// Orchestrator backed by a Kubernetes API server.
#[derive(Debug, Clone)]
pub struct KubernetesOrchestrator {
    client: Client,
    api_base: String,
    token: Option<String>,
    namespace: String,
}

impl KubernetesOrchestrator {
    /// Connects with explicit settings.
    pub fn new(
        api_base: impl Into<String>,
        token: Option<String>,
        namespace: impl Into<String>,
        accept_invalid_certs: bool,
    ) -> Result<Self, OrchestratorError> {
        let client = Client::builder()
            .danger_accept_invalid_certs(accept_invalid_certs)
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token,
            namespace: namespace.into(),
        })
    }

    /// Uses the pod's service account: API server address from the
    /// environment, token and CA certificate from the mounted secret.
    ///
    /// `namespace` overrides the service account's own namespace.
    pub async fn in_cluster(namespace: Option<String>) -> Result<Self, OrchestratorError> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| OrchestratorError::ClusterConfig("KUBERNETES_SERVICE_HOST not set".into()))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());

        let dir = Path::new(SERVICE_ACCOUNT_DIR);
        let token = tokio::fs::read_to_string(dir.join("token")).await?;
        let ca = tokio::fs::read(dir.join("ca.crt")).await?;
        let namespace = match namespace {
            Some(ns) => ns,
            None => tokio::fs::read_to_string(dir.join("namespace"))
                .await?
                .trim()
                .to_string(),
        };

        let cert = Certificate::from_pem(&ca)
            .map_err(|e| OrchestratorError::ClusterConfig(format!("invalid CA certificate: {}", e)))?;
        let client = Client::builder()
            .add_root_certificate(cert)
            .timeout(Duration::from_secs(30))
            .build()?;

        let host = if host.contains(':') {
            format!("[{}]", host)
        } else {
            host
        };

        info!(namespace = %namespace, "Using in-cluster Kubernetes configuration");
        Ok(Self {
            client,
            api_base: format!("https://{}:{}", host, port),
            token: Some(token.trim().to_string()),
            namespace,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn jobs_url(&self) -> String {
        format!(
            "{}/apis/batch/v1/namespaces/{}/jobs",
            self.api_base, self.namespace
        )
    }

    fn job_url(&self, name: &str) -> String {
        format!("{}/{}", self.jobs_url(), name)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn api_error(response: Response) -> OrchestratorError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
            .unwrap_or(body);
        OrchestratorError::Api { status, message }
    }
}

/// The batch/v1 Job object for a descriptor.
pub fn job_manifest(job: &JobDescriptor, namespace: &str) -> Result<Value, OrchestratorError> {
    if job.parallelism == 0 {
        return Err(OrchestratorError::InvalidDescriptor(format!(
            "{}: parallelism must be at least 1",
            job.name
        )));
    }
    if job.completions == 0 {
        return Err(OrchestratorError::InvalidDescriptor(format!(
            "{}: completions must be at least 1",
            job.name
        )));
    }

    let env: Vec<Value> = job
        .env
        .iter()
        .map(|(name, value)| json!({ "name": name, "value": value }))
        .collect();

    Ok(json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "name": job.name,
            "namespace": namespace,
            "labels": job.labels,
        },
        "spec": {
            "parallelism": job.parallelism,
            "completions": job.completions,
            "backoffLimit": job.backoff_limit,
            "ttlSecondsAfterFinished": job.ttl_seconds_after_finished,
            "template": {
                "metadata": { "labels": job.labels },
                "spec": {
                    "restartPolicy": "Never",
                    "containers": [{
                        "name": CONTAINER_NAME,
                        "image": job.image,
                        "args": job.args,
                        "env": env,
                        "securityContext": { "privileged": true },
                        "resources": {
                            "requests": { "cpu": "1m", "memory": "10Mi" }
                        }
                    }]
                }
            }
        }
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatusBody {
    start_time: Option<DateTime<Utc>>,
    completion_time: Option<DateTime<Utc>>,
    #[serde(default)]
    active: u32,
    #[serde(default)]
    succeeded: u32,
    #[serde(default)]
    failed: u32,
}

#[derive(Debug, Deserialize)]
struct JobBody {
    #[serde(default)]
    status: Option<JobStatusBody>,
}

fn parse_status(body: Value) -> Result<JobStatus, OrchestratorError> {
    let job: JobBody = serde_json::from_value(body).map_err(|e| OrchestratorError::Api {
        status: 200,
        message: format!("unreadable job status: {}", e),
    })?;
    let s = job.status.unwrap_or_default();
    Ok(JobStatus {
        start_time: s.start_time,
        completion_time: s.completion_time,
        active: s.active,
        succeeded: s.succeeded,
        failed: s.failed,
    })
}

#[async_trait]
impl Orchestrator for KubernetesOrchestrator {
    async fn submit(&self, job: &JobDescriptor) -> Result<(), OrchestratorError> {
        let manifest = job_manifest(job, &self.namespace)?;
        let response = self
            .authorized(self.client.post(self.jobs_url()))
            .json(&manifest)
            .send()
            .await?;

        match response.status() {
            s if s.is_success() => {
                info!(job = %job.name, namespace = %self.namespace, "Created job");
                Ok(())
            }
            StatusCode::CONFLICT => Err(OrchestratorError::AlreadyExists(job.name.clone())),
            _ => Err(Self::api_error(response).await),
        }
    }

    async fn status(&self, name: &str) -> Result<JobStatus, OrchestratorError> {
        let response = self
            .authorized(self.client.get(self.job_url(name)))
            .send()
            .await?;

        match response.status() {
            s if s.is_success() => {
                let body: Value = response.json().await?;
                let status = parse_status(body)?;
                debug!(job = %name, state = %status.state(), "Read job status");
                Ok(status)
            }
            StatusCode::NOT_FOUND => Err(OrchestratorError::NotFound(name.to_string())),
            _ => Err(Self::api_error(response).await),
        }
    }

    async fn delete(&self, name: &str) -> Result<(), OrchestratorError> {
        let response = self
            .authorized(self.client.delete(format!(
                "{}?propagationPolicy=Background",
                self.job_url(name)
            )))
            .send()
            .await?;

        match response.status() {
            s if s.is_success() => {
                info!(job = %name, "Deleted job");
                Ok(())
            }
            StatusCode::NOT_FOUND => Err(OrchestratorError::NotFound(name.to_string())),
            _ => Err(Self::api_error(response).await),
        }
    }
}
