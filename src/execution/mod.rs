//! Execution layer: what a single unit does with the items it pops.
//!
//! Two paths turn work items into [`ExecutionResult`]s:
//!
//! - **Push**: build a unique image with the local image tool, publish it
//!   with bounded retries, then remove it
//! - **Pull**: fetch a token and manifest from the registry API, then stream
//!   every layer through a SHA-256 digest with per-layer retries
//!
//! Items are processed by a bounded pool in which every item is its own task,
//! so one failing item never affects the others.
//!
//! # Example
//!
//! ```ignore
//! use registry_loadgen::execution::{ExecutionUnit, PodmanTool, HttpRegistryClient};
//!
//! let unit = ExecutionUnit::new(queue, Arc::new(PodmanTool::new()), registry, aggregator, push, pull)
//!     .with_batch_size(400);
//! let report = unit.run(&segment, Operation::Push).await?;
//! ```

pub mod image_tool;
pub mod pool;
pub mod pull;
pub mod push;
pub mod registry_client;
pub mod result;
pub mod retry;
pub mod unit;

pub use image_tool::{ImageTool, PodmanTool, ToolOutput};
pub use pool::run_bounded;
pub use pull::{pull_item, run_pull_batch, PullConfig, DEFAULT_LAYER_CONCURRENCY};
pub use push::{push_item, run_push_batch, PushConfig, DEFAULT_BASE_IMAGE};
pub use registry_client::{Credentials, HttpRegistryClient, ImageReference, LayerDigest, RegistryApi};
pub use result::{ExecutionResult, RunMetadata};
pub use retry::{retry_blind, RetryOutcome, DEFAULT_MAX_ATTEMPTS};
pub use unit::{ExecutionUnit, UnitError, UnitReport, DEFAULT_BATCH_SIZE};
