//! Build manager — turns a component's build context into a tagged image.
//!
//! Each build gets a fresh tag `<namespace>/<component>:<n>`, where `<n>` is
//! reserved from the store before the image is built, and repoints
//! `<namespace>/<component>:latest` at the new image. Both steps happen
//! under the component's lock, so `latest` always ends up on the image of
//! the last build to finish.

use std::path::Path;
use std::sync::Arc;

use kiln_core::ContentionPolicy;
use kiln_core::config::DEFAULT_IMAGE_NAMESPACE;
use kiln_runtime::{ContainerRuntime, RuntimeError};
use kiln_state::{Build, BuildGuard, StateStore};
use tokio::io::AsyncWrite;
use tracing::{debug, info, warn};

use crate::epoch_secs;
use crate::error::{LifecycleError, LifecycleResult};

pub struct BuildManager<R> {
    state: StateStore,
    runtime: Arc<R>,
    policy: ContentionPolicy,
    namespace: String,
}

// Clones share the store and the runtime.
impl<R> Clone for BuildManager<R> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            runtime: self.runtime.clone(),
            policy: self.policy,
            namespace: self.namespace.clone(),
        }
    }
}

impl<R: ContainerRuntime> BuildManager<R> {
    /// Create a manager that queues contending builds and tags images
    /// under the default namespace.
    pub fn new(state: StateStore, runtime: Arc<R>) -> Self {
        Self {
            state,
            runtime,
            policy: ContentionPolicy::default(),
            namespace: DEFAULT_IMAGE_NAMESPACE.to_string(),
        }
    }

    pub fn with_policy(mut self, policy: ContentionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn policy(&self) -> ContentionPolicy {
        self.policy
    }

    /// Tag of build number `sequence` of a component.
    pub fn image_tag(&self, component_id: &str, sequence: u64) -> String {
        format!("{}/{component_id}:{sequence}", self.namespace)
    }

    /// Alias that follows the newest build of a component.
    pub fn latest_tag(&self, component_id: &str) -> String {
        format!("{}/{component_id}:latest", self.namespace)
    }

    /// Build the component's image, tag it, and record the build.
    ///
    /// Build output goes to `log`; a failing `log` does not fail the build.
    /// The row is written only after the runtime reports both tags on the
    /// same image. On failure after the image exists, the image is left in
    /// the runtime and the error's `resource_id` is its tag.
    pub async fn create_build<W>(&self, component_id: &str, log: &mut W) -> LifecycleResult<Build>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let component = self
            .state
            .get_component(component_id)?
            .ok_or_else(|| LifecycleError::not_found("component", component_id))?;

        let _guard = self.acquire(component_id).await?;

        let context = Path::new(&component.component_path);
        if !context.is_dir() {
            return Err(LifecycleError::Validation(format!(
                "component path {} of {component_id} is not a directory",
                context.display()
            )));
        }

        let sequence = self.state.reserve_build_sequence(component_id)?;
        let tag = self.image_tag(component_id, sequence);
        info!(%component_id, %tag, "building image");

        let built_id = self
            .runtime
            .build_image(context, &tag, log)
            .await
            .map_err(|source| LifecycleError::BuildFailed {
                component_id: component_id.to_string(),
                tag: tag.clone(),
                source,
            })?;
        debug!(%tag, image_id = %built_id, "image built");

        let latest = self.latest_tag(component_id);
        self.runtime
            .tag_image(&tag, &latest)
            .await
            .map_err(|e| LifecycleError::runtime(Some(&tag), e))?;

        let image_id = self.confirm_tags(&tag, &latest).await?;
        if image_id != built_id {
            warn!(%tag, %built_id, %image_id, "runtime reports a different image ID than the build returned");
        }

        let build = Build {
            id: tag.clone(),
            component_id: component_id.to_string(),
            sequence,
            image_id,
            created_at: epoch_secs(),
        };
        self.state
            .insert_build(&build)
            .map_err(|e| LifecycleError::persistence(Some(&tag), e))?;

        info!(%component_id, build_id = %build.id, image_id = %build.image_id, "build recorded");
        Ok(build)
    }

    pub fn get_build(&self, id: &str) -> LifecycleResult<Build> {
        self.state
            .get_build(id)?
            .ok_or_else(|| LifecycleError::not_found("build", id))
    }

    pub fn list_builds(&self, component_id: Option<&str>) -> LifecycleResult<Vec<Build>> {
        Ok(self.state.list_builds(component_id)?)
    }

    /// The component's most recently recorded build.
    pub fn latest_build(&self, component_id: &str) -> LifecycleResult<Build> {
        if self.state.get_component(component_id)?.is_none() {
            return Err(LifecycleError::not_found("component", component_id));
        }
        self.state
            .latest_build(component_id)?
            .ok_or_else(|| LifecycleError::not_found("build of component", component_id))
    }

    /// Take the component's build lock from the store, so managers on the
    /// same store serialize with each other as well as with clones.
    async fn acquire(&self, component_id: &str) -> LifecycleResult<BuildGuard> {
        let locks = self.state.build_locks();
        match self.policy {
            ContentionPolicy::Queue => {
                if let Some(guard) = locks.try_lock(component_id)? {
                    return Ok(guard);
                }
                debug!(%component_id, "waiting for in-flight build");
                Ok(locks.lock(component_id).await?)
            }
            ContentionPolicy::FailFast => locks
                .try_lock(component_id)?
                .ok_or_else(|| LifecycleError::BuildInProgress(component_id.to_string())),
        }
    }

    /// Check that `tag` and `latest` name the same image; returns its ID.
    async fn confirm_tags(&self, tag: &str, latest: &str) -> LifecycleResult<String> {
        let built = self
            .runtime
            .inspect_image(tag)
            .await
            .map_err(|e| LifecycleError::runtime(Some(tag), e))?;
        let alias = self
            .runtime
            .inspect_image(latest)
            .await
            .map_err(|e| LifecycleError::runtime(Some(tag), e))?;
        if built.id != alias.id {
            return Err(LifecycleError::runtime(
                Some(tag),
                RuntimeError::Rejected(format!(
                    "{latest} resolves to {} instead of {}",
                    alias.id, built.id
                )),
            ));
        }
        Ok(built.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_runtime::MemoryRuntime;

    fn manager() -> BuildManager<MemoryRuntime> {
        BuildManager::new(
            StateStore::open_in_memory().unwrap(),
            Arc::new(MemoryRuntime::new()),
        )
    }

    #[test]
    fn tag_format() {
        let m = manager();
        assert_eq!(m.image_tag("etl", 3), "kiln/etl:3");
        assert_eq!(m.latest_tag("etl"), "kiln/etl:latest");

        let m = m.with_namespace("acme");
        assert_eq!(m.image_tag("etl", 1), "acme/etl:1");
        assert_eq!(m.latest_tag("etl"), "acme/etl:latest");
    }

    #[tokio::test]
    async fn managers_on_one_store_share_build_locks() {
        let m = manager().with_policy(ContentionPolicy::FailFast);
        let c = m.clone();
        assert_eq!(c.policy(), ContentionPolicy::FailFast);
        let other = BuildManager::new(m.state.clone(), Arc::new(MemoryRuntime::new()));

        let _held = m.acquire("etl").await.unwrap();
        assert!(matches!(
            c.acquire("etl").await,
            Err(LifecycleError::BuildInProgress(_))
        ));
        assert!(
            other
                .with_policy(ContentionPolicy::FailFast)
                .acquire("etl")
                .await
                .is_err()
        );
        assert!(c.acquire("report").await.is_ok());
    }

    #[tokio::test]
    async fn missing_component_is_not_found() {
        let m = manager();
        let err = m
            .create_build("nope", &mut tokio::io::sink())
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::NotFound { kind: "component", .. }));
        assert_eq!(m.runtime.builds_started(), 0);
    }
}
