//! kiln-runtime — the container engine as seen by Kiln.
//!
//! Kiln never owns images or containers; it drives an external engine
//! through the [`ContainerRuntime`] capability and keeps only identifiers.
//! Two implementations are provided:
//!
//! - [`DockerCli`]: shells out to the `docker` client, one child process
//!   per call
//! - [`MemoryRuntime`]: an in-process engine for tests
//!
//! # Cancellation
//!
//! Every operation is an async call. Dropping the returned future cancels
//! it; `DockerCli` kills its child process when that happens. A cancelled
//! call may leave an image or container behind in the engine.

pub mod docker;
pub mod error;
pub mod log;
pub mod memory;

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWrite;

pub use docker::DockerCli;
pub use error::{RuntimeError, RuntimeResult};
pub use log::LineSink;
pub use memory::MemoryRuntime;

/// Container label recording the build a container was created from.
pub const LABEL_BUILD: &str = "io.kiln.build";

/// Container label recording the owning component.
pub const LABEL_COMPONENT: &str = "io.kiln.component";

/// An image as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Content-addressed image identity (e.g. `sha256:…`).
    pub id: String,
    pub repo_tags: Vec<String>,
}

/// A host path bound into a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

/// Everything needed to create a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub image: String,
    /// Command override; empty keeps the image's default.
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<BindMount>,
    pub labels: BTreeMap<String, String>,
}

/// Lifecycle status of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Created,
    Running,
    Exited,
    Other(String),
}

impl ContainerStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "created" => ContainerStatus::Created,
            "running" => ContainerStatus::Running,
            "exited" => ContainerStatus::Exited,
            other => ContainerStatus::Other(other.to_string()),
        }
    }
}

/// A container as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub image: String,
    pub status: ContainerStatus,
    /// Set once the container has exited.
    pub exit_code: Option<i64>,
}

/// Operations Kiln needs from a container engine.
///
/// Every call is a fallible remote call. Implementations are shared
/// between tasks and must be safe to call concurrently.
pub trait ContainerRuntime: Send + Sync {
    /// Build an image from `context`, tag it `tag`, and return its identity.
    ///
    /// Build output is written to `log` line by line. A failing `log` does
    /// not fail the build.
    fn build_image<W>(
        &self,
        context: &Path,
        tag: &str,
        log: &mut W,
    ) -> impl Future<Output = RuntimeResult<String>> + Send
    where
        W: AsyncWrite + Unpin + Send + ?Sized;

    /// Point `target` at the image `source` (a tag or image ID) resolves to.
    fn tag_image(&self, source: &str, target: &str)
    -> impl Future<Output = RuntimeResult<()>> + Send;

    fn inspect_image(&self, reference: &str)
    -> impl Future<Output = RuntimeResult<ImageInfo>> + Send;

    fn remove_image(
        &self,
        reference: &str,
        force: bool,
    ) -> impl Future<Output = RuntimeResult<()>> + Send;

    /// Create (but do not start) a container; returns its ID.
    fn create_container(
        &self,
        config: &ContainerConfig,
    ) -> impl Future<Output = RuntimeResult<String>> + Send;

    fn start_container(&self, id: &str) -> impl Future<Output = RuntimeResult<()>> + Send;

    /// Block until the container exits; returns its exit code.
    fn wait_container(&self, id: &str) -> impl Future<Output = RuntimeResult<i64>> + Send;

    fn inspect_container(&self, id: &str)
    -> impl Future<Output = RuntimeResult<ContainerInfo>> + Send;

    fn remove_container(
        &self,
        id: &str,
        force: bool,
    ) -> impl Future<Output = RuntimeResult<()>> + Send;
}

/// Repository part of a tag (`kiln/etl:3` → `kiln/etl`).
pub fn tag_repository(tag: &str) -> &str {
    match tag.rsplit_once(':') {
        // A colon inside the last path segment separates the tag;
        // one before a `/` belongs to a registry host:port.
        Some((repo, suffix)) if !suffix.contains('/') => repo,
        _ => tag,
    }
}
