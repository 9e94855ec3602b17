pub mod build;
pub mod component;
pub mod execution;
pub mod init;
pub mod run;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use kiln_core::KilnConfig;
use kiln_lifecycle::{
    BuildManager, ComponentRegistry, ExecutionManager, LifecycleError, LifecycleResult,
};
use kiln_runtime::DockerCli;
use kiln_state::StateStore;
use tracing::warn;

/// Effective settings for one invocation: `kiln.toml` overlaid with flags.
pub struct Context {
    pub config: KilnConfig,
    pub state_dir: PathBuf,
    pub docker_bin: String,
    pub timeout: Duration,
}

impl Context {
    pub fn load(
        config_path: Option<&Path>,
        state_dir: Option<PathBuf>,
        docker_bin: Option<String>,
    ) -> anyhow::Result<Self> {
        let config = KilnConfig::load(config_path)?;
        let timeout = config.timeout()?;
        Ok(Self {
            state_dir: state_dir.unwrap_or_else(|| config.state_dir()),
            docker_bin: docker_bin.unwrap_or_else(|| config.docker_bin().to_string()),
            timeout,
            config,
        })
    }

    pub fn open_state(&self) -> anyhow::Result<StateStore> {
        StateStore::open(&self.state_dir).with_context(|| {
            format!(
                "cannot open kiln state in {} (run `kiln init` first?)",
                self.state_dir.display()
            )
        })
    }

    pub fn runtime(&self) -> Arc<DockerCli> {
        Arc::new(DockerCli::new(self.docker_bin.clone()))
    }

    pub fn registry(&self) -> anyhow::Result<ComponentRegistry> {
        Ok(ComponentRegistry::new(self.open_state()?))
    }

    pub fn build_manager(
        &self,
        state: StateStore,
        runtime: Arc<DockerCli>,
    ) -> BuildManager<DockerCli> {
        BuildManager::new(state, runtime)
            .with_policy(self.config.contention_policy())
            .with_namespace(self.config.image_namespace())
    }

    pub fn execution_manager(
        &self,
        state: StateStore,
        runtime: Arc<DockerCli>,
    ) -> ExecutionManager<DockerCli> {
        ExecutionManager::new(state, runtime).with_read_only_mounts(self.config.read_only_mounts())
    }

    /// Run a lifecycle operation under the configured timeout. The operation
    /// is dropped on expiry, which kills any docker child it spawned.
    pub async fn with_timeout<T>(
        &self,
        what: &str,
        fut: impl Future<Output = LifecycleResult<T>>,
    ) -> anyhow::Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(report(e)),
            Err(_) => anyhow::bail!("{what} timed out after {:?}", self.timeout),
        }
    }
}

fn report(e: LifecycleError) -> anyhow::Error {
    if let Some(resource) = e.resource_id() {
        warn!(kind = %e.kind(), %resource, "left behind in the container runtime");
    }
    e.into()
}

/// Print a record as pretty JSON.
pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
