//! Local container image tool used by the push path.
//!
//! The tool is driven as a subprocess. Its exit status is the only success
//! signal; captured output is kept for logging.

use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::ToolError;

const STORAGE_OPT: &str = "overlay.mount_program=/usr/bin/fuse-overlayfs";
const STORAGE_DRIVER: &str = "overlay";

/// Captured result of one tool invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    fn from_parts(status: ExitStatus, stdout: &[u8], stderr: &[u8]) -> Self {
        Self {
            success: status.success(),
            exit_code: status.code(),
            stdout: String::from_utf8_lossy(stdout).into_owned(),
            stderr: String::from_utf8_lossy(stderr).into_owned(),
        }
    }

    /// A successful invocation with no output.
    pub fn ok() -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            ..Self::default()
        }
    }

    /// A failed invocation with the given stderr.
    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code: Some(1),
            stderr: stderr.into(),
            ..Self::default()
        }
    }
}

/// Operations the push path needs from a local image tool.
#[async_trait]
pub trait ImageTool: Send + Sync {
    async fn login(&self, registry: &str, username: &str, password: &str)
        -> Result<ToolOutput, ToolError>;

    /// Builds `tag` from a build file given as text.
    async fn build(&self, tag: &str, build_file: &str) -> Result<ToolOutput, ToolError>;

    async fn push(&self, tag: &str) -> Result<ToolOutput, ToolError>;

    /// Removes the local image, forcefully.
    async fn remove(&self, tag: &str) -> Result<ToolOutput, ToolError>;
}

/// `podman` driven through `tokio::process`.
#[derive(Debug, Clone)]
pub struct PodmanTool {
    program: String,
}

impl Default for PodmanTool {
    fn default() -> Self {
        Self::new()
    }
}

impl PodmanTool {
    pub fn new() -> Self {
        Self {
            program: "podman".to_string(),
        }
    }

    /// Uses a different executable, e.g. an absolute path.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd
    }

    async fn run(&self, args: &[&str]) -> Result<ToolOutput, ToolError> {
        debug!(program = %self.program, ?args, "Running image tool");
        let output = self
            .command()
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| ToolError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        Ok(ToolOutput::from_parts(
            output.status,
            &output.stdout,
            &output.stderr,
        ))
    }
}

/// Arguments for `podman login`. The password is passed on the command line.
pub fn login_args<'a>(registry: &'a str, username: &'a str, password: &'a str) -> Vec<&'a str> {
    vec![
        "login",
        "-u",
        username,
        "-p",
        password,
        "--tls-verify=false",
        "--storage-opt",
        STORAGE_OPT,
        "--storage-driver",
        STORAGE_DRIVER,
        registry,
    ]
}

/// Arguments for `podman build`, reading the build file from stdin.
pub fn build_args(tag: &str) -> Vec<&str> {
    vec![
        "build",
        "--tag",
        tag,
        "--storage-opt",
        STORAGE_OPT,
        "--storage-driver",
        STORAGE_DRIVER,
        "--no-cache",
        "-f",
        "-",
    ]
}

pub fn push_args(tag: &str) -> Vec<&str> {
    vec![
        "push",
        tag,
        "--tls-verify=false",
        "--storage-opt",
        STORAGE_OPT,
        "--storage-driver",
        STORAGE_DRIVER,
    ]
}

pub fn remove_args(tag: &str) -> Vec<&str> {
    vec![
        "rmi",
        "--force",
        "--storage-opt",
        STORAGE_OPT,
        "--storage-driver",
        STORAGE_DRIVER,
        tag,
    ]
}

#[async_trait]
impl ImageTool for PodmanTool {
    async fn login(
        &self,
        registry: &str,
        username: &str,
        password: &str,
    ) -> Result<ToolOutput, ToolError> {
        self.run(&login_args(registry, username, password)).await
    }

    async fn build(&self, tag: &str, build_file: &str) -> Result<ToolOutput, ToolError> {
        debug!(program = %self.program, tag = %tag, "Building image");
        let mut child = self
            .command()
            .args(build_args(tag))
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|source| ToolError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(build_file.as_bytes())
                .await
                .map_err(ToolError::Stdin)?;
            // Dropping stdin closes the pipe so the build can start.
        }

        let output = child.wait_with_output().await?;
        Ok(ToolOutput::from_parts(
            output.status,
            &output.stdout,
            &output.stderr,
        ))
    }

    async fn push(&self, tag: &str) -> Result<ToolOutput, ToolError> {
        self.run(&push_args(tag)).await
    }

    async fn remove(&self, tag: &str) -> Result<ToolOutput, ToolError> {
        self.run(&remove_args(tag)).await
    }
}
