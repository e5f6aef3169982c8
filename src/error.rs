//! Error types for registry-loadgen operations.
//!
//! Defines error types for the subsystems that talk to the outside world:
//! - The local image tool (podman) used by the push path
//! - The registry HTTP API used by the pull path
//! - The orchestration platform that runs execution units
//! - The metrics store that receives results
//! - Configuration validation
//!
//! Queue, monitor and coordinator errors live next to their modules in
//! [`crate::scheduler`].

use thiserror::Error;

/// Errors raised while invoking the local image tool.
///
/// A non-zero exit status is not an error here: the tool reports it through
/// [`crate::execution::ToolOutput`] and callers treat it as data.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write build file to stdin: {0}")]
    Stdin(std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while talking to the registry HTTP API.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Malformed image reference '{0}': expected registry/repository:tag")]
    MalformedReference(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Registry returned {status} for {url}")]
    Status { status: u16, url: String },

    #[error("Token response from {0} did not contain a token")]
    MissingToken(String),

    #[error("Manifest for {reference} lists no layers")]
    EmptyManifest { reference: String },

    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(String),
}

/// Errors from the orchestration platform.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Job '{0}' already exists")]
    AlreadyExists(String),

    #[error("Job '{0}' not found")]
    NotFound(String),

    #[error("Orchestrator API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid job descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("In-cluster configuration unavailable: {0}")]
    ClusterConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the metrics store.
#[derive(Debug, Error)]
pub enum MetricsStoreError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Metrics store returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Bulk insert reported item errors ({failed} of {total} documents rejected)")]
    BulkRejected { failed: usize, total: usize },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised while validating configuration before the core runs.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: &'static str, message: String },

    #[error("Invalid user segment '{name}': {reason}")]
    InvalidSegment { name: String, reason: String },
}
