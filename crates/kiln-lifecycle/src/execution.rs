//! Execution manager — starts a container from a recorded build.
//!
//! `execute` returns as soon as the container is started and recorded.
//! Waiting, exit status and removal are left to the caller, who talks to
//! the runtime directly using the returned container ID.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use kiln_core::Specification;
use kiln_runtime::{BindMount, ContainerConfig, ContainerRuntime, LABEL_BUILD, LABEL_COMPONENT};
use kiln_state::{Execution, StateStore};
use tracing::{debug, info};

use crate::epoch_secs;
use crate::error::{LifecycleError, LifecycleResult};
use crate::registry::read_specification;

pub struct ExecutionManager<R> {
    state: StateStore,
    runtime: Arc<R>,
    read_only_mounts: bool,
}

impl<R> Clone for ExecutionManager<R> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            runtime: self.runtime.clone(),
            read_only_mounts: self.read_only_mounts,
        }
    }
}

impl<R: ContainerRuntime> ExecutionManager<R> {
    pub fn new(state: StateStore, runtime: Arc<R>) -> Self {
        Self {
            state,
            runtime,
            read_only_mounts: false,
        }
    }

    /// Bind every mount read-only instead of read-write.
    pub fn with_read_only_mounts(mut self, read_only: bool) -> Self {
        self.read_only_mounts = read_only;
        self
    }

    /// Create and start a container from `build_id`.
    ///
    /// `mounts` maps host paths to container paths; every container path
    /// must be declared by the component's specification. Declared paths
    /// left out of `mounts` stay unbound. An empty `command` runs the
    /// image's own entrypoint.
    ///
    /// Nothing is created in the runtime unless the build exists and the
    /// mounts are valid. If the container was created but could not be
    /// started or recorded, it is left in place and the error's
    /// `resource_id` is its ID.
    pub async fn execute(
        &self,
        build_id: &str,
        command: &[String],
        mounts: &BTreeMap<String, String>,
    ) -> LifecycleResult<Execution> {
        let build = self
            .state
            .get_build(build_id)?
            .ok_or_else(|| LifecycleError::not_found("build", build_id))?;
        let component = self
            .state
            .get_component(&build.component_id)?
            .ok_or_else(|| LifecycleError::not_found("component", &build.component_id))?;
        let spec = read_specification(&component)?;

        let binds = bind_mounts(&component.id, &spec, mounts, self.read_only_mounts)?;

        let config = ContainerConfig {
            image: build.id.clone(),
            command: command.to_vec(),
            env: spec.env,
            mounts: binds,
            labels: BTreeMap::from([
                (LABEL_BUILD.to_string(), build.id.clone()),
                (LABEL_COMPONENT.to_string(), component.id.clone()),
            ]),
        };

        let container_id = self
            .runtime
            .create_container(&config)
            .await
            .map_err(|e| LifecycleError::runtime(None, e))?;
        debug!(%build_id, %container_id, "container created");

        self.runtime
            .start_container(&container_id)
            .await
            .map_err(|e| LifecycleError::runtime(Some(&container_id), e))?;

        let execution = Execution {
            id: container_id.clone(),
            build_id: build.id,
            command: config.command,
            mounts: mounts.clone(),
            created_at: epoch_secs(),
        };
        self.state
            .insert_execution(&execution)
            .map_err(|e| LifecycleError::persistence(Some(&container_id), e))?;

        info!(%build_id, execution_id = %execution.id, "execution started");
        Ok(execution)
    }

    pub fn get_execution(&self, id: &str) -> LifecycleResult<Execution> {
        self.state
            .get_execution(id)?
            .ok_or_else(|| LifecycleError::not_found("execution", id))
    }

    pub fn list_executions(&self, build_id: Option<&str>) -> LifecycleResult<Vec<Execution>> {
        Ok(self.state.list_executions(build_id)?)
    }
}

/// Check a host → container mount map against the specification.
fn bind_mounts(
    component_id: &str,
    spec: &Specification,
    mounts: &BTreeMap<String, String>,
    read_only: bool,
) -> LifecycleResult<Vec<BindMount>> {
    let mut targets = HashSet::new();
    let mut binds = Vec::with_capacity(mounts.len());
    for (source, target) in mounts {
        if !spec.declares(target) {
            return Err(LifecycleError::UnknownMountTarget {
                component_id: component_id.to_string(),
                target: target.clone(),
            });
        }
        if !Path::new(source).is_absolute() {
            return Err(LifecycleError::Validation(format!(
                "mount source {source} must be an absolute host path"
            )));
        }
        if !targets.insert(target.as_str()) {
            return Err(LifecycleError::Validation(format!(
                "mount target {target} is bound more than once"
            )));
        }
        binds.push(BindMount {
            source: source.clone(),
            target: target.clone(),
            read_only,
        });
    }
    Ok(binds)
}
