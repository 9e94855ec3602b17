//! In-memory container engine (for testing).
//!
//! Images and containers live in a mutex-guarded map. Starting a container
//! runs a caller-supplied "program" synchronously, which lets tests emulate
//! what an image would do to its bind mounts, then marks the container
//! exited with the program's return value.
//!
//! Knobs: build delay, injected build/create/start failures, and hooks
//! called after each image build and each container start.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::AsyncWrite;

use crate::error::{RuntimeError, RuntimeResult};
use crate::log::LineSink;
use crate::{ContainerConfig, ContainerInfo, ContainerRuntime, ContainerStatus, ImageInfo, tag_repository};

/// Simulated container entrypoint: receives the container's config and
/// returns its exit code.
pub type Program = Arc<dyn Fn(&ContainerConfig) -> i64 + Send + Sync>;

/// Called with the tag of every successfully built image.
pub type BuildHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Called with the ID of every started container.
pub type StartHook = Arc<dyn Fn(&str) + Send + Sync>;

struct MemContainer {
    config: ContainerConfig,
    status: ContainerStatus,
    exit_code: Option<i64>,
}

#[derive(Default)]
struct MemState {
    next_id: u64,
    images: BTreeSet<String>,
    /// tag → image ID
    tags: HashMap<String, String>,
    containers: HashMap<String, MemContainer>,
    /// repository → builds currently running
    in_flight: HashMap<String, usize>,
    /// repository → highest observed `in_flight`
    max_in_flight: HashMap<String, usize>,
    builds_started: usize,
}

#[derive(Default)]
struct Knobs {
    build_delay: Option<Duration>,
    fail_builds: bool,
    fail_create: bool,
    fail_start: bool,
    program: Option<Program>,
    on_build: Option<BuildHook>,
    on_start: Option<StartHook>,
}

/// Thread-safe in-memory runtime. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryRuntime {
    state: Arc<Mutex<MemState>>,
    knobs: Arc<Mutex<Knobs>>,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every build (widens race windows in tests).
    pub fn set_build_delay(&self, delay: Duration) {
        self.knobs().build_delay = Some(delay);
    }

    pub fn set_fail_builds(&self, fail: bool) {
        self.knobs().fail_builds = fail;
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.knobs().fail_create = fail;
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.knobs().fail_start = fail;
    }

    pub fn set_program(&self, program: impl Fn(&ContainerConfig) -> i64 + Send + Sync + 'static) {
        self.knobs().program = Some(Arc::new(program));
    }

    pub fn set_build_hook(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        self.knobs().on_build = Some(Arc::new(hook));
    }

    pub fn set_start_hook(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        self.knobs().on_start = Some(Arc::new(hook));
    }

    /// Image ID a tag currently points at.
    pub fn resolve(&self, reference: &str) -> Option<String> {
        resolve(&self.state(), reference)
    }

    pub fn image_count(&self) -> usize {
        self.state().images.len()
    }

    pub fn container_count(&self) -> usize {
        self.state().containers.len()
    }

    pub fn container_config(&self, id: &str) -> Option<ContainerConfig> {
        self.state().containers.get(id).map(|c| c.config.clone())
    }

    /// Number of `build_image` calls made so far, successful or not.
    pub fn builds_started(&self) -> usize {
        self.state().builds_started
    }

    /// Highest number of simultaneous builds seen for a repository.
    pub fn max_concurrent_builds(&self, repository: &str) -> usize {
        self.state()
            .max_in_flight
            .get(repository)
            .copied()
            .unwrap_or(0)
    }

    fn state(&self) -> MutexGuard<'_, MemState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn knobs(&self) -> MutexGuard<'_, Knobs> {
        self.knobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn resolve(state: &MemState, reference: &str) -> Option<String> {
    if let Some(id) = state.tags.get(reference) {
        return Some(id.clone());
    }
    state.images.contains(reference).then(|| reference.to_string())
}

/// Decrements the in-flight count for a repository when dropped, including
/// when the build future is cancelled.
struct InFlight {
    state: Arc<Mutex<MemState>>,
    repository: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(n) = state.in_flight.get_mut(&self.repository) {
            *n = n.saturating_sub(1);
        }
    }
}

impl ContainerRuntime for MemoryRuntime {
    async fn build_image<W>(&self, context: &Path, tag: &str, log: &mut W) -> RuntimeResult<String>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let (delay, fail, hook) = {
            let knobs = self.knobs();
            (knobs.build_delay, knobs.fail_builds, knobs.on_build.clone())
        };
        let repository = tag_repository(tag).to_string();

        let _in_flight = {
            let mut state = self.state();
            state.builds_started += 1;
            let n = state.in_flight.entry(repository.clone()).or_insert(0);
            *n += 1;
            let current = *n;
            let max = state.max_in_flight.entry(repository.clone()).or_insert(0);
            *max = (*max).max(current);
            InFlight {
                state: self.state.clone(),
                repository,
            }
        };

        let mut sink = LineSink::new(log);
        sink.write_line(&format!("Step 1/1 : build {} as {tag}", context.display()))
            .await;

        if !context.is_dir() {
            return Err(RuntimeError::Rejected(format!(
                "build context {} is not a directory",
                context.display()
            )));
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            sink.write_line("error: build failed").await;
            return Err(RuntimeError::CommandFailed {
                command: format!("build {tag}"),
                code: Some(1),
                stderr: "injected build failure".to_string(),
            });
        }

        let image_id = {
            let mut state = self.state();
            state.next_id += 1;
            let image_id = format!("sha256:{:064x}", state.next_id);
            state.images.insert(image_id.clone());
            state.tags.insert(tag.to_string(), image_id.clone());
            image_id
        };
        sink.write_line(&format!("Successfully tagged {tag}")).await;

        if let Some(hook) = hook {
            hook(tag);
        }
        Ok(image_id)
    }

    async fn tag_image(&self, source: &str, target: &str) -> RuntimeResult<()> {
        let mut state = self.state();
        let image_id = resolve(&state, source).ok_or_else(|| RuntimeError::NotFound {
            kind: "image",
            reference: source.to_string(),
        })?;
        state.tags.insert(target.to_string(), image_id);
        Ok(())
    }

    async fn inspect_image(&self, reference: &str) -> RuntimeResult<ImageInfo> {
        let state = self.state();
        let image_id = resolve(&state, reference).ok_or_else(|| RuntimeError::NotFound {
            kind: "image",
            reference: reference.to_string(),
        })?;
        let mut repo_tags: Vec<String> = state
            .tags
            .iter()
            .filter(|(_, id)| **id == image_id)
            .map(|(tag, _)| tag.clone())
            .collect();
        repo_tags.sort();
        Ok(ImageInfo {
            id: image_id,
            repo_tags,
        })
    }

    async fn remove_image(&self, reference: &str, force: bool) -> RuntimeResult<()> {
        let mut state = self.state();
        let image_id = resolve(&state, reference).ok_or_else(|| RuntimeError::NotFound {
            kind: "image",
            reference: reference.to_string(),
        })?;
        let is_tag = state.tags.contains_key(reference);
        let tag_count = state.tags.values().filter(|id| **id == image_id).count();

        if is_tag && tag_count > 1 && !force {
            // Untag only; the image stays reachable through its other tags.
            state.tags.remove(reference);
            return Ok(());
        }
        if !is_tag && tag_count > 1 && !force {
            return Err(RuntimeError::Rejected(format!(
                "image {image_id} is referenced by {tag_count} tags"
            )));
        }
        state.tags.retain(|_, id| *id != image_id);
        state.images.remove(&image_id);
        Ok(())
    }

    async fn create_container(&self, config: &ContainerConfig) -> RuntimeResult<String> {
        if self.knobs().fail_create {
            return Err(RuntimeError::Rejected("injected create failure".to_string()));
        }
        for mount in &config.mounts {
            if !Path::new(&mount.source).exists() {
                return Err(RuntimeError::Rejected(format!(
                    "bind source path does not exist: {}",
                    mount.source
                )));
            }
        }
        let mut state = self.state();
        if resolve(&state, &config.image).is_none() {
            return Err(RuntimeError::NotFound {
                kind: "image",
                reference: config.image.clone(),
            });
        }
        state.next_id += 1;
        let id = format!("{:064x}", state.next_id);
        state.containers.insert(
            id.clone(),
            MemContainer {
                config: config.clone(),
                status: ContainerStatus::Created,
                exit_code: None,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> RuntimeResult<()> {
        let (fail, program, on_start) = {
            let knobs = self.knobs();
            (knobs.fail_start, knobs.program.clone(), knobs.on_start.clone())
        };
        let config = {
            let mut state = self.state();
            let container = state.containers.get_mut(id).ok_or_else(|| RuntimeError::NotFound {
                kind: "container",
                reference: id.to_string(),
            })?;
            if container.status != ContainerStatus::Created {
                return Err(RuntimeError::Rejected(format!("container {id} already started")));
            }
            if fail {
                return Err(RuntimeError::Rejected("injected start failure".to_string()));
            }
            container.status = ContainerStatus::Running;
            container.config.clone()
        };

        // The program runs outside the lock; it may touch the filesystem.
        let exit_code = program.map(|p| p(&config)).unwrap_or(0);

        {
            let mut state = self.state();
            if let Some(container) = state.containers.get_mut(id) {
                container.status = ContainerStatus::Exited;
                container.exit_code = Some(exit_code);
            }
        }
        if let Some(hook) = on_start {
            hook(id);
        }
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> RuntimeResult<i64> {
        let state = self.state();
        let container = state.containers.get(id).ok_or_else(|| RuntimeError::NotFound {
            kind: "container",
            reference: id.to_string(),
        })?;
        container
            .exit_code
            .ok_or_else(|| RuntimeError::Rejected(format!("container {id} was never started")))
    }

    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerInfo> {
        let state = self.state();
        let container = state.containers.get(id).ok_or_else(|| RuntimeError::NotFound {
            kind: "container",
            reference: id.to_string(),
        })?;
        Ok(ContainerInfo {
            id: id.to_string(),
            image: container.config.image.clone(),
            status: container.status.clone(),
            exit_code: container.exit_code,
        })
    }

    async fn remove_container(&self, id: &str, force: bool) -> RuntimeResult<()> {
        let mut state = self.state();
        let container = state.containers.get(id).ok_or_else(|| RuntimeError::NotFound {
            kind: "container",
            reference: id.to_string(),
        })?;
        if container.status == ContainerStatus::Running && !force {
            return Err(RuntimeError::Rejected(format!("container {id} is running")));
        }
        state.containers.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BindMount;

    async fn build(runtime: &MemoryRuntime, tag: &str) -> String {
        let dir = tempfile::tempdir().unwrap();
        runtime
            .build_image(dir.path(), tag, &mut tokio::io::sink())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn build_tags_and_logs() {
        let runtime = MemoryRuntime::new();
        let dir = tempfile::tempdir().unwrap();
        let mut log: Vec<u8> = Vec::new();

        let id = runtime.build_image(dir.path(), "kiln/etl:1", &mut log).await.unwrap();

        assert_eq!(runtime.resolve("kiln/etl:1"), Some(id.clone()));
        let log = String::from_utf8(log).unwrap();
        assert!(log.contains("Successfully tagged kiln/etl:1"));
        assert_eq!(runtime.builds_started(), 1);
    }

    #[tokio::test]
    async fn build_rejects_missing_context() {
        let runtime = MemoryRuntime::new();
        let err = runtime
            .build_image(Path::new("/nonexistent/ctx"), "kiln/x:1", &mut tokio::io::sink())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Rejected(_)));
        assert_eq!(runtime.image_count(), 0);
    }

    #[tokio::test]
    async fn injected_build_failure() {
        let runtime = MemoryRuntime::new();
        runtime.set_fail_builds(true);
        let dir = tempfile::tempdir().unwrap();
        let err = runtime
            .build_image(dir.path(), "kiln/x:1", &mut tokio::io::sink())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::CommandFailed { .. }));
        assert!(runtime.resolve("kiln/x:1").is_none());
    }

    #[tokio::test]
    async fn tag_and_inspect() {
        let runtime = MemoryRuntime::new();
        let id = build(&runtime, "kiln/etl:1").await;
        runtime.tag_image("kiln/etl:1", "kiln/etl:latest").await.unwrap();

        let info = runtime.inspect_image("kiln/etl:latest").await.unwrap();
        assert_eq!(info.id, id);
        assert_eq!(info.repo_tags, ["kiln/etl:1", "kiln/etl:latest"]);

        let err = runtime.tag_image("kiln/none:1", "x:latest").await.unwrap_err();
        assert!(matches!(err, RuntimeError::NotFound { kind: "image", .. }));
    }

    #[tokio::test]
    async fn remove_image_untags_then_deletes() {
        let runtime = MemoryRuntime::new();
        let id = build(&runtime, "kiln/etl:1").await;
        runtime.tag_image(&id, "kiln/etl:latest").await.unwrap();

        runtime.remove_image("kiln/etl:1", false).await.unwrap();
        assert!(runtime.resolve("kiln/etl:1").is_none());
        assert_eq!(runtime.image_count(), 1);

        runtime.remove_image("kiln/etl:latest", false).await.unwrap();
        assert_eq!(runtime.image_count(), 0);
    }

    #[tokio::test]
    async fn container_lifecycle_runs_program() {
        let runtime = MemoryRuntime::new();
        build(&runtime, "kiln/etl:1").await;
        runtime.set_program(|config| if config.env.contains_key("FAIL") { 2 } else { 0 });

        let config = ContainerConfig {
            image: "kiln/etl:1".to_string(),
            ..ContainerConfig::default()
        };
        let id = runtime.create_container(&config).await.unwrap();
        assert_eq!(
            runtime.inspect_container(&id).await.unwrap().status,
            ContainerStatus::Created
        );
        assert!(runtime.wait_container(&id).await.is_err());

        runtime.start_container(&id).await.unwrap();
        assert_eq!(runtime.wait_container(&id).await.unwrap(), 0);
        let info = runtime.inspect_container(&id).await.unwrap();
        assert_eq!(info.status, ContainerStatus::Exited);
        assert_eq!(info.exit_code, Some(0));

        runtime.remove_container(&id, false).await.unwrap();
        assert_eq!(runtime.container_count(), 0);
        assert!(matches!(
            runtime.inspect_container(&id).await,
            Err(RuntimeError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn create_requires_image_and_mount_sources() {
        let runtime = MemoryRuntime::new();
        let config = ContainerConfig {
            image: "kiln/none:1".to_string(),
            ..ContainerConfig::default()
        };
        assert!(matches!(
            runtime.create_container(&config).await,
            Err(RuntimeError::NotFound { .. })
        ));

        build(&runtime, "kiln/etl:1").await;
        let config = ContainerConfig {
            image: "kiln/etl:1".to_string(),
            mounts: vec![BindMount {
                source: "/nonexistent/source".to_string(),
                target: "/data".to_string(),
                read_only: false,
            }],
            ..ContainerConfig::default()
        };
        assert!(matches!(
            runtime.create_container(&config).await,
            Err(RuntimeError::Rejected(_))
        ));
        assert_eq!(runtime.container_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_builds_are_counted_per_repository() {
        let runtime = MemoryRuntime::new();
        runtime.set_build_delay(Duration::from_millis(50));
        let dir = tempfile::tempdir().unwrap();

        let a = {
            let runtime = runtime.clone();
            let path = dir.path().to_path_buf();
            tokio::spawn(async move {
                runtime
                    .build_image(&path, "kiln/a:1", &mut tokio::io::sink())
                    .await
            })
        };
        let b = {
            let runtime = runtime.clone();
            let path = dir.path().to_path_buf();
            tokio::spawn(async move {
                runtime
                    .build_image(&path, "kiln/a:2", &mut tokio::io::sink())
                    .await
            })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(runtime.max_concurrent_builds("kiln/a"), 2);
        assert_eq!(runtime.max_concurrent_builds("kiln/b"), 0);
    }
}
